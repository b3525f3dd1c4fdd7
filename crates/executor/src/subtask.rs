//! One unit of work inside a [`SubtaskGroup`](crate::group::SubtaskGroup):
//! wraps a user [`SubtaskBody`] plus its durable record and timing.
//! Authors never construct this directly — it's built internally when a
//! body is added to a group.
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use store::{TaskId, TaskRecord, TaskState};

use crate::bridge::block_on;
use crate::error::TaskError;
use crate::pool::{SubtaskHandle, WorkerPool};
use crate::registry::SubtaskBody;
use crate::shared::TaskShared;

pub struct RunnableSubtask {
    body: Box<dyn SubtaskBody>,
    record: TaskRecord,
    shared: Arc<TaskShared>,
    handle: Option<SubtaskHandle>,
}

impl RunnableSubtask {
    pub fn new(body: Box<dyn SubtaskBody>, record: TaskRecord, shared: Arc<TaskShared>) -> Self {
        Self { body, record, shared, handle: None }
    }

    pub fn id(&self) -> TaskId {
        self.record.id
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    /// Non-zero duration parsed from `payload.timeLimitMins`; `None` means
    /// unbounded.
    pub fn time_limit(&self) -> Option<Duration> {
        let minutes = self.record.payload.get("timeLimitMins")?.as_f64()?;
        if minutes <= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(minutes * 60.0))
        }
    }

    pub fn handle(&self) -> Option<&SubtaskHandle> {
        self.handle.as_ref()
    }

    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }

    /// Re-reads this subtask's record from the Task Store. The worker
    /// thread persists every state transition directly; this wrapper's own
    /// copy only reflects what was known at submission time until this is
    /// called.
    pub fn refresh_from_store(&mut self) {
        if let Ok(record) = block_on(self.shared.store.refresh(self.record.id)) {
            self.record = record;
        }
    }

    /// Called by the owning group's wait loop when it gives up on this
    /// member (its own time limit elapsed, or the parent's abort grace
    /// forced a cancellation) rather than waiting for a natural exit:
    /// transitions the record straight to `Aborted`, persists it, and fires
    /// the after-listener, the same way `execute_subtask_body` finalizes a
    /// natural exit. `cancel()` only asks the background job to stop; it
    /// keeps running and may still overwrite this with its own result, but
    /// the group's wait policy has already moved on.
    pub fn force_abort(&mut self, error: TaskError) {
        self.record.state = TaskState::Aborted;
        self.record.error = Some(self.shared.record_error(&error));
        self.record.completed_at = Some(Utc::now());
        if let Err(e) = block_on(self.shared.store.update(self.record.clone())) {
            tracing::warn!("failed to persist forced-abort record {}: {e}", self.record.id);
        }
        self.shared.listeners.run_after(&self.record, Some(&error));
    }

    /// Records `scheduled_at`, persists it, and submits the body to `pool`.
    /// A submission failure transitions the record to `Failure` and fires
    /// the after-listener before the error is surfaced to the caller.
    pub fn submit_to(&mut self, pool: &dyn WorkerPool) -> Result<(), TaskError> {
        self.record.scheduled_at = Some(Utc::now());
        if let Err(e) = block_on(self.shared.store.update(self.record.clone())) {
            return self.fail_submission(TaskError::Failure(e.to_string()));
        }

        let mut body = std::mem::replace(&mut self.body, Box::new(NullBody));
        let wait_start = self.record.scheduled_at.unwrap();
        let before_running = self.record.clone();
        let shared = self.shared.clone();

        let job: Box<dyn FnOnce() -> Result<(), TaskError> + Send> = Box::new(move || {
            execute_subtask_body(&mut body, before_running, shared, wait_start)
        });

        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.submit(job))) {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(_) => self.fail_submission(TaskError::Failure("submission panicked".into())),
        }
    }

    fn fail_submission(&mut self, error: TaskError) -> Result<(), TaskError> {
        self.record.state = TaskState::Failure;
        self.record.error = Some(self.shared.record_error(&error));
        self.record.completed_at = Some(Utc::now());
        let _ = block_on(self.shared.store.update(self.record.clone()));
        self.shared.listeners.run_after(&self.record, Some(&error));
        Err(error)
    }
}

struct NullBody;
impl SubtaskBody for NullBody {
    fn run(&mut self) -> Result<(), TaskError> {
        Ok(())
    }
}

/// The worker-side run body for a subtask: everything between "picked up
/// off the pool" and "result observable by the owning group's wait loop".
/// Runs synchronously on the worker thread `pool.submit` dispatched onto;
/// every exit path persists a terminal record, records the execution
/// duration, and fires the after-listener (finalize-on-all-exits).
fn execute_subtask_body(
    body: &mut Box<dyn SubtaskBody>,
    mut record: TaskRecord,
    shared: Arc<TaskShared>,
    wait_start: chrono::DateTime<Utc>,
) -> Result<(), TaskError> {
    let wait_duration = (Utc::now() - wait_start).to_std().unwrap_or(Duration::ZERO);
    shared.telemetry.record_wait_duration(&record.task_type, wait_duration);

    let exec_start = Instant::now();
    let finalize = |record: &mut TaskRecord, state: TaskState, error: Option<&TaskError>| {
        record.state = state;
        record.error = error.map(|e| shared.record_error(e));
        record.completed_at = Some(Utc::now());
        if let Err(e) = block_on(shared.store.update(record.clone())) {
            tracing::warn!("failed to persist subtask record {}: {e}", record.id);
        }
        let tag = match state {
            TaskState::Success => "success",
            TaskState::Failure => "failure",
            TaskState::Aborted => "aborted",
            _ => "unknown",
        };
        shared.telemetry.record_execution_duration(&format!("{}:{}", record.task_type, tag), exec_start.elapsed());
        shared.listeners.run_after(record, error);
    };

    if shared.abort_time().is_some() {
        let err = TaskError::Cancelled;
        finalize(&mut record, TaskState::Aborted, Some(&err));
        return Err(err);
    }

    if let Err(err) = shared.listeners.run_before(&record) {
        finalize(&mut record, TaskState::Aborted, Some(&err));
        return Err(err);
    }

    record.state = TaskState::Initializing;
    if let Err(e) = block_on(shared.store.update(record.clone())) {
        tracing::warn!("failed to persist subtask record {}: {e}", record.id);
    }

    record.state = TaskState::Running;
    record.started_at = Some(Utc::now());
    if let Err(e) = block_on(shared.store.update(record.clone())) {
        tracing::warn!("failed to persist subtask record {}: {e}", record.id);
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body.run()))
        .unwrap_or_else(|payload| Err(TaskError::Panic(panic_message(payload))));

    match result {
        Ok(()) => {
            finalize(&mut record, TaskState::Success, None);
            Ok(())
        }
        Err(err @ (TaskError::Cancelled | TaskError::Timeout)) => {
            finalize(&mut record, TaskState::Aborted, Some(&err));
            Err(err)
        }
        Err(err) => {
            finalize(&mut record, TaskState::Failure, Some(&err));
            Err(err)
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<&'static str>() {
        Ok(s) => s.to_string(),
        Err(payload) => match payload.downcast::<String>() {
            Ok(s) => *s,
            Err(_) => "Box<dyn Any>".to_string(),
        },
    }
}
