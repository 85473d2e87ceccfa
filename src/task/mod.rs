// src/task/mod.rs

//! Background task scheduling
//!
//! Mutating operations are wrapped in tasks that declare the resource keys
//! they read-modify-write. The [`List`] runs tasks with disjoint keys in
//! parallel and queues the rest in submission order.

pub mod list;
pub mod output;
pub mod resources;

pub use list::{List, Process, ProcessReturnValue, Task, TaskState, parse_task_id};
pub use output::{Cancellation, Detail, Output, Progress, TaskProgress};
pub use resources::{ALL_LOCAL_REPOS_RESOURCES_KEY, ALL_RESOURCES_KEY, ResourcesSet};
