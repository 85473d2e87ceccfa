// src/task/list.rs

//! Task scheduler
//!
//! Tasks are admitted through a [`ResourcesSet`]: a task starts only when no
//! running task holds a conflicting resource key. Admitted tasks are handed
//! to a dispatch thread which spawns one worker thread per task. When a task
//! finishes, its resources are released and the idle tasks are scanned in
//! submission order; the first conflict-free one is admitted.

use super::output::{Detail, Output, Progress};
use super::resources::ResourcesSet;
use crate::error::{Error, Result};
use crossbeam::channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Value produced by a successful task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessReturnValue {
    pub code: u16,
    pub value: serde_json::Value,
}

impl ProcessReturnValue {
    pub fn new(code: u16, value: serde_json::Value) -> Self {
        Self { code, value }
    }

    /// `200` with the given payload
    pub fn ok(value: serde_json::Value) -> Self {
        Self::new(200, value)
    }
}

/// Work executed by a task
pub type Process =
    Box<dyn FnOnce(&Output, &Detail) -> Result<ProcessReturnValue> + Send + 'static>;

/// Task lifecycle: `Idle -> Running -> {Succeeded, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Idle => "IDLE",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a task handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "State")]
    pub state: TaskState,
}

/// Parse a task id coming from a request
///
/// A non-integer id is a malformed request, distinct from an unknown id.
pub fn parse_task_id(raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| Error::Validation(format!("invalid task id '{}'", raw)))
}

/// One-shot completion event
#[derive(Debug, Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn signal(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Parts of a task shared with the worker thread running it
struct TaskShared {
    id: u64,
    name: String,
    resources: Vec<String>,
    output: Output,
    detail: Detail,
    completion: Completion,
}

/// Scheduler-side record of a task; only touched under the list lock
struct TaskRecord {
    shared: Arc<TaskShared>,
    state: TaskState,
    /// Resources already claimed and `Run` sent, dispatcher not yet caught up
    queued: bool,
    process: Option<Process>,
    return_value: Option<ProcessReturnValue>,
    error: Option<String>,
}

impl TaskRecord {
    fn snapshot(&self) -> Task {
        Task {
            id: self.shared.id,
            name: self.shared.name.clone(),
            state: self.state,
        }
    }
}

enum Message {
    Run(u64),
    Stop,
}

#[derive(Default)]
struct ListState {
    next_id: u64,
    tasks: Vec<TaskRecord>,
    used_resources: ResourcesSet,
    /// Tasks submitted but not yet terminal
    outstanding: usize,
    workers: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl ListState {
    fn record(&self, id: u64) -> Result<&TaskRecord> {
        self.tasks
            .iter()
            .find(|t| t.shared.id == id)
            .ok_or_else(|| Error::NotFound(format!("task with id {} not found", id)))
    }

    fn record_mut(&mut self, id: u64) -> Result<&mut TaskRecord> {
        self.tasks
            .iter_mut()
            .find(|t| t.shared.id == id)
            .ok_or_else(|| Error::NotFound(format!("task with id {} not found", id)))
    }
}

struct Shared {
    state: Mutex<ListState>,
    all_done: Condvar,
    queue: Sender<Message>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ListState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome, release resources and admit the next idle task
    fn finish(&self, id: u64, outcome: std::thread::Result<Result<ProcessReturnValue>>) {
        let mut state = self.lock();

        let Ok(record) = state.record_mut(id) else {
            warn!("Finished task {} is no longer registered", id);
            return;
        };

        match outcome {
            Ok(Ok(value)) => {
                record.return_value = Some(value);
                record.state = TaskState::Succeeded;
            }
            Ok(Err(err)) => {
                record
                    .shared
                    .output
                    .printf(format_args!("Task failed with error: {}\n", err));
                record.error = Some(err.to_string());
                record.state = TaskState::Failed;
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                record
                    .shared
                    .output
                    .printf(format_args!("Task failed with panic: {}\n", message));
                record.error = Some(message);
                record.state = TaskState::Failed;
            }
        }
        info!("Task {} '{}' finished: {}", id, record.shared.name, record.state);

        let shared = Arc::clone(&record.shared);
        state.used_resources.free(&shared.resources);
        state.outstanding = state.outstanding.saturating_sub(1);
        shared.completion.signal();

        self.admit_next(&mut state);
        drop(state);
        self.all_done.notify_all();
    }

    /// Admit at most one idle task whose resources are now free
    fn admit_next(&self, state: &mut ListState) {
        if state.stopped {
            return;
        }

        let candidate = state
            .tasks
            .iter()
            .find(|t| {
                t.state == TaskState::Idle
                    && !t.queued
                    && state.used_resources.used_by(&t.shared.resources).is_empty()
            })
            .map(|t| Arc::clone(&t.shared));

        if let Some(next) = candidate {
            state.used_resources.mark_in_use(&next.resources, next.id);
            if let Ok(record) = state.record_mut(next.id) {
                record.queued = true;
            }
            debug!("Admitting task {} '{}'", next.id, next.name);
            if self.queue.send(Message::Run(next.id)).is_err() {
                warn!("Dispatcher is gone, task {} will not start", next.id);
            }
        }
    }

    /// Mark a task that never got to run as failed
    fn abandon(&self, state: &mut ListState, id: u64, reason: &str) {
        if let Ok(record) = state.record_mut(id) {
            record
                .shared
                .output
                .printf(format_args!("Task failed with error: {}\n", reason));
            record.error = Some(reason.to_string());
            record.state = TaskState::Failed;
            record.queued = false;
            let shared = Arc::clone(&record.shared);
            state.used_resources.free(&shared.resources);
            state.outstanding = state.outstanding.saturating_sub(1);
            shared.completion.signal();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_task(shared: Arc<Shared>, task: Arc<TaskShared>, process: Option<Process>) {
    debug!("Running task {} '{}'", task.id, task.name);
    let outcome = match process {
        Some(process) => {
            panic::catch_unwind(AssertUnwindSafe(|| process(&task.output, &task.detail)))
        }
        None => Ok(Err(Error::Internal(format!(
            "task {} has no process to run",
            task.id
        )))),
    };
    shared.finish(task.id, outcome);
}

fn dispatch(shared: Arc<Shared>, queue: Receiver<Message>) {
    for message in queue {
        let id = match message {
            Message::Stop => break,
            Message::Run(id) => id,
        };

        let mut state = shared.lock();
        let (task, process) = match state.record_mut(id) {
            Ok(record) => {
                record.state = TaskState::Running;
                record.queued = false;
                (Arc::clone(&record.shared), record.process.take())
            }
            Err(_) => {
                warn!("Dispatched task {} is no longer registered", id);
                continue;
            }
        };

        let worker_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("task-{}", id))
            .spawn(move || run_task(worker_shared, task, process));

        match spawned {
            Ok(handle) => {
                state.workers.retain(|worker| !worker.is_finished());
                state.workers.push(handle);
            }
            Err(err) => {
                shared.abandon(&mut state, id, &format!("unable to spawn worker: {}", err));
                shared.admit_next(&mut state);
                drop(state);
                shared.all_done.notify_all();
            }
        }
    }
    debug!("Task dispatcher exited");
}

/// Owner of all tasks
pub struct List {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl List {
    /// Create the list and start its dispatch thread
    pub fn new() -> Result<Self> {
        let (queue, receiver) = unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(ListState {
                next_id: 1,
                ..Default::default()
            }),
            all_done: Condvar::new(),
            queue,
        });

        let dispatcher_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("task-dispatcher".to_string())
            .spawn(move || dispatch(dispatcher_shared, receiver))?;

        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    fn submit(
        &self,
        name: &str,
        resources: Vec<String>,
        process: Process,
        fail_on_conflict: bool,
    ) -> Result<Task> {
        if name.trim().is_empty() {
            return Err(Error::Validation("task name must not be empty".to_string()));
        }

        let mut state = self.shared.lock();
        if state.stopped {
            return Err(Error::Conflict("task list is stopped".to_string()));
        }

        let holders = state.used_resources.used_by(&resources);
        if fail_on_conflict && !holders.is_empty() {
            return Err(Error::ResourceConflict { tasks: holders });
        }

        let id = state.next_id;
        state.next_id += 1;

        let shared = Arc::new(TaskShared {
            id,
            name: name.to_string(),
            resources,
            output: Output::new(),
            detail: Detail::new(),
            completion: Completion::default(),
        });
        let mut record = TaskRecord {
            shared: Arc::clone(&shared),
            state: TaskState::Idle,
            queued: false,
            process: Some(process),
            return_value: None,
            error: None,
        };

        if holders.is_empty() {
            if self.shared.queue.send(Message::Run(id)).is_err() {
                return Err(Error::Internal("task dispatcher is not running".to_string()));
            }
            state.used_resources.mark_in_use(&shared.resources, id);
            record.queued = true;
        } else {
            debug!(
                "Task {} '{}' waits for tasks {:?}",
                id, shared.name, holders
            );
        }

        let task = record.snapshot();
        state.tasks.push(record);
        state.outstanding += 1;
        info!("Task {} '{}' submitted", id, name);
        Ok(task)
    }

    /// Register a task; it starts as soon as its resources are free
    pub fn run_task_in_background<F>(
        &self,
        name: &str,
        resources: Vec<String>,
        process: F,
    ) -> Result<Task>
    where
        F: FnOnce(&Output, &Detail) -> Result<ProcessReturnValue> + Send + 'static,
    {
        self.submit(name, resources, Box::new(process), false)
    }

    /// Like [`List::run_task_in_background`], but fail with
    /// [`Error::ResourceConflict`] instead of queueing behind other tasks
    pub fn try_run_task<F>(&self, name: &str, resources: Vec<String>, process: F) -> Result<Task>
    where
        F: FnOnce(&Output, &Detail) -> Result<ProcessReturnValue> + Send + 'static,
    {
        self.submit(name, resources, Box::new(process), true)
    }

    /// Submit a task and block until it is terminal
    pub fn run_task_and_wait<F>(
        &self,
        name: &str,
        resources: Vec<String>,
        process: F,
    ) -> Result<Task>
    where
        F: FnOnce(&Output, &Detail) -> Result<ProcessReturnValue> + Send + 'static,
    {
        let task = self.run_task_in_background(name, resources, process)?;
        self.wait_for_task_by_id(task.id)
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        self.shared
            .lock()
            .tasks
            .iter()
            .map(TaskRecord::snapshot)
            .collect()
    }

    pub fn get_task_by_id(&self, id: u64) -> Result<Task> {
        Ok(self.shared.lock().record(id)?.snapshot())
    }

    pub fn get_task_output_by_id(&self, id: u64) -> Result<String> {
        let shared = Arc::clone(&self.shared.lock().record(id)?.shared);
        Ok(shared.output.contents())
    }

    pub fn get_task_detail_by_id(&self, id: u64) -> Result<serde_json::Value> {
        let shared = Arc::clone(&self.shared.lock().record(id)?.shared);
        Ok(shared.detail.load())
    }

    pub fn get_task_return_value_by_id(&self, id: u64) -> Result<Option<ProcessReturnValue>> {
        Ok(self.shared.lock().record(id)?.return_value.clone())
    }

    pub fn get_task_error_by_id(&self, id: u64) -> Result<Option<String>> {
        Ok(self.shared.lock().record(id)?.error.clone())
    }

    /// Block until the task reaches a terminal state
    pub fn wait_for_task_by_id(&self, id: u64) -> Result<Task> {
        let shared = Arc::clone(&self.shared.lock().record(id)?.shared);
        shared.completion.wait();
        self.get_task_by_id(id)
    }

    /// Block until every submitted task is terminal
    pub fn wait(&self) {
        let mut state = self.shared.lock();
        while state.outstanding > 0 {
            state = self
                .shared
                .all_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove a terminal task
    pub fn delete_task_by_id(&self, id: u64) -> Result<Task> {
        let mut state = self.shared.lock();
        let position = state
            .tasks
            .iter()
            .position(|t| t.shared.id == id)
            .ok_or_else(|| Error::NotFound(format!("task with id {} not found", id)))?;

        let task = state.tasks[position].snapshot();
        if !task.state.is_terminal() {
            return Err(Error::Conflict(format!(
                "task {} is {} and cannot be deleted",
                id, task.state
            )));
        }
        state.tasks.remove(position);
        Ok(task)
    }

    /// Remove all terminal tasks
    pub fn clear(&self) {
        self.shared
            .lock()
            .tasks
            .retain(|t| !t.state.is_terminal());
    }

    /// Stop the dispatcher and join every worker
    ///
    /// Running tasks are allowed to finish; tasks that never started are
    /// failed so that waiters are released. Safe to call repeatedly.
    pub fn stop(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = dispatcher {
            self.shared.lock().stopped = true;
            let _ = self.shared.queue.send(Message::Stop);
            if handle.join().is_err() {
                warn!("Task dispatcher panicked");
            }
        }

        loop {
            let workers = std::mem::take(&mut self.shared.lock().workers);
            if workers.is_empty() {
                break;
            }
            for worker in workers {
                if worker.join().is_err() {
                    warn!("Task worker panicked outside of its task");
                }
            }
        }

        let mut state = self.shared.lock();
        let pending: Vec<u64> = state
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Idle)
            .map(|t| t.shared.id)
            .collect();
        for id in pending {
            self.shared
                .abandon(&mut state, id, "task list stopped before the task started");
        }
        drop(state);
        self.shared.all_done.notify_all();
    }
}

impl Drop for List {
    fn drop(&mut self) {
        self.stop();
    }
}
