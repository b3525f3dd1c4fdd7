//! State shared between a [`RunnableTask`](crate::task::RunnableTask) and
//! every [`RunnableSubtask`](crate::subtask::RunnableSubtask) it owns:
//! the abort-time atomic cooperative cancellation is keyed off, the
//! listener pair, and the external collaborators.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use store::TaskRecord;
use telemetry::TelemetrySink;

use crate::error::TaskError;
use crate::pool::ExecutorProvider;
use crate::redact::PayloadRedactor;
use crate::registry::TaskRegistry;

type BeforeListener = Box<dyn Fn(&TaskRecord) -> Result<(), TaskError> + Send + Sync>;
type AfterListener = Box<dyn Fn(&TaskRecord, Option<&TaskError>) + Send + Sync>;

/// `before`/`after` callbacks registered on a Runnable Task, fired around
/// every subtask's (and the top-level task's own) execution.
#[derive(Default)]
pub struct Listeners {
    before: Option<BeforeListener>,
    after: Option<AfterListener>,
}

impl Listeners {
    pub fn set_before<F>(&mut self, f: F)
    where
        F: Fn(&TaskRecord) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.before = Some(Box::new(f));
    }

    pub fn set_after<F>(&mut self, f: F)
    where
        F: Fn(&TaskRecord, Option<&TaskError>) + Send + Sync + 'static,
    {
        self.after = Some(Box::new(f));
    }

    /// Runs `before`; a listener panic is caught and logged, not re-entered
    /// into the state machine (the spec's "listener exceptions do not
    /// re-enter the state machine"), and is treated as no objection.
    pub fn run_before(&self, record: &TaskRecord) -> Result<(), TaskError> {
        match &self.before {
            Some(f) => {
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(record))) {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!("before-listener panicked for task {}", record.id);
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        }
    }

    pub fn run_after(&self, record: &TaskRecord, error: Option<&TaskError>) {
        if let Some(f) = &self.after {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(record, error))).is_err() {
                tracing::warn!("after-listener panicked for task {}", record.id);
            }
        }
    }
}

pub struct TaskShared {
    pub abort_at: Mutex<Option<DateTime<Utc>>>,
    pub listeners: Listeners,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub store: Arc<dyn store::TaskStore>,
    pub registry: Arc<TaskRegistry>,
    pub provider: Arc<dyn ExecutorProvider>,
    pub redactor: PayloadRedactor,
    pub owner: String,
    pub abort_grace: Duration,
    pub spin_interval: Duration,
    pub skip_subtask_abortable_check: bool,
}

impl TaskShared {
    pub fn abort_time(&self) -> Option<DateTime<Utc>> {
        *self.abort_at.lock()
    }

    /// Idempotent: only the first call actually sets the abort time; later
    /// calls observe the same instant.
    pub fn set_abort_time_now(&self) -> DateTime<Utc> {
        let mut guard = self.abort_at.lock();
        if guard.is_none() {
            *guard = Some(Utc::now());
        }
        guard.unwrap()
    }

    /// Whether a still-running subtask of the given type should be force
    /// cancelled right now: abort was requested, the grace window has
    /// elapsed, and either the policy flag waives the abortable check or
    /// the subtask type itself is abortable.
    pub fn should_force_cancel(&self, subtask_type: &str) -> bool {
        let Some(abort_at) = self.abort_time() else {
            return false;
        };
        let elapsed = Utc::now() - abort_at;
        let grace = chrono::Duration::from_std(self.abort_grace).unwrap_or(chrono::Duration::zero());
        if elapsed <= grace {
            return false;
        }
        self.skip_subtask_abortable_check || self.registry.is_abortable(subtask_type)
    }

    /// The error string to persist on a record: truncated to the stored
    /// field's 3,000-char middle-truncation limit.
    pub fn record_error(&self, error: &TaskError) -> String {
        crate::redact::truncate_error_middle(&error.message())
    }
}
