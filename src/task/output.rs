// src/task/output.rs

//! Output log, detail slot and cancellation plumbing shared between a
//! running task and its observers

use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Sink for user-visible progress messages
///
/// Long-running operations (publish, mirror update, cleanup) report through
/// this trait so the same code path works inside a task and from tests.
pub trait Progress: Send + Sync {
    /// Append formatted text as-is
    fn printf(&self, args: fmt::Arguments<'_>);

    /// Append formatted text with color markup removed, terminated by a newline
    fn colored_printf(&self, args: fmt::Arguments<'_>);

    /// Publish a structured progress value; sinks without a detail slot drop it
    fn set_detail(&self, _detail: Value) {}
}

/// Remove `@r`, `@g`, `@y`, `@b`, `@!` and `@|` color markers
fn strip_color_tags(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '@' {
            if let Some(&next) = chars.peek() {
                if matches!(next, 'r' | 'g' | 'y' | 'b' | '!' | '|') {
                    chars.next();
                    continue;
                }
            }
        }
        result.push(c);
    }
    result
}

/// Append-only text log of a task
#[derive(Debug, Default)]
pub struct Output {
    text: Mutex<String>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full text accumulated so far
    pub fn contents(&self) -> String {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn print(&self, text: &str) {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }
}

impl Progress for Output {
    fn printf(&self, args: fmt::Arguments<'_>) {
        let mut text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = text.write_fmt(args);
    }

    fn colored_printf(&self, args: fmt::Arguments<'_>) {
        let line = strip_color_tags(&args.to_string());
        let mut text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        text.push_str(&line);
        text.push('\n');
    }
}

/// Last-write-wins slot for a structured progress payload
#[derive(Debug)]
pub struct Detail {
    value: Mutex<Value>,
}

impl Default for Detail {
    fn default() -> Self {
        Self {
            value: Mutex::new(Value::Object(Default::default())),
        }
    }
}

impl Detail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, value: Value) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// The empty object until something is stored, then the latest value
    pub fn load(&self) -> Value {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Progress sink that writes to a task's output and detail slot
pub struct TaskProgress<'a> {
    output: &'a Output,
    detail: &'a Detail,
}

impl<'a> TaskProgress<'a> {
    pub fn new(output: &'a Output, detail: &'a Detail) -> Self {
        Self { output, detail }
    }
}

impl Progress for TaskProgress<'_> {
    fn printf(&self, args: fmt::Arguments<'_>) {
        self.output.printf(args);
    }

    fn colored_printf(&self, args: fmt::Arguments<'_>) {
        self.output.colored_printf(args);
    }

    fn set_detail(&self, detail: Value) {
        self.detail.store(detail);
    }
}

/// Cooperative cancellation signal with an optional deadline
///
/// The scheduler never interrupts a task; operations that talk to the
/// network or to a signer poll [`Cancellation::check`] between steps.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fail with [`Error::Cancelled`] once cancelled or past the deadline
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(operation.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_accumulates() {
        let output = Output::new();
        output.printf(format_args!("Loading {} packages...\n", 3));
        output.colored_printf(format_args!("@yWarning@|: pool file {} missing", "a.deb"));

        assert_eq!(
            output.contents(),
            "Loading 3 packages...\nWarning: pool file a.deb missing\n"
        );
    }

    #[test]
    fn test_detail_last_write_wins() {
        let detail = Detail::new();
        assert_eq!(detail.load(), json!({}));

        detail.store(json!({"total": 10}));
        detail.store(json!({"total": 10, "remaining": 4}));
        assert_eq!(detail.load(), json!({"total": 10, "remaining": 4}));
    }

    #[test]
    fn test_task_progress_routes_detail() {
        let output = Output::new();
        let detail = Detail::new();
        let progress = TaskProgress::new(&output, &detail);

        progress.printf(format_args!("step"));
        progress.set_detail(json!({"step": 1}));

        assert_eq!(output.contents(), "step");
        assert_eq!(detail.load(), json!({"step": 1}));
    }

    #[test]
    fn test_cancellation() {
        let token = Cancellation::new();
        assert!(token.check("download").is_ok());

        let observer = token.clone();
        token.cancel();
        assert!(matches!(observer.check("download"), Err(Error::Cancelled(_))));

        let expired = Cancellation::with_timeout(Duration::from_millis(0));
        assert!(expired.is_cancelled());
    }
}
