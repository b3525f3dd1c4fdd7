//! A runnable top-level task: owns a FIFO queue of [`SubtaskGroup`]s and the
//! abort time subtasks cooperatively watch for. User [`TaskBody`] code never
//! sees a bare record — it drives this wrapper via `add_group`/`run_groups`.
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use store::{TaskId, TaskRecord, TaskState};

use crate::bridge::block_on;
use crate::error::TaskError;
use crate::group::SubtaskGroup;
use crate::registry::TaskBody;
use crate::shared::TaskShared;

pub struct RunnableTask {
    record: TaskRecord,
    shared: Arc<TaskShared>,
    groups: VecDeque<SubtaskGroup>,
    next_position: i32,
}

impl RunnableTask {
    pub fn new(record: TaskRecord, shared: Arc<TaskShared>) -> Self {
        Self { record, shared, groups: VecDeque::new(), next_position: 0 }
    }

    pub fn id(&self) -> TaskId {
        self.record.id
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub(crate) fn into_record(self) -> TaskRecord {
        self.record
    }

    /// Queues `group`, assigning it the next monotonic position. The
    /// counter advances regardless of whether the group turns out to be
    /// empty, since attachment (and therefore position assignment) happens
    /// before a single member is known to exist.
    pub fn add_group(&mut self, mut group: SubtaskGroup) -> i32 {
        let position = self.next_position;
        self.next_position += 1;
        group.attach(self.record.id, position, &self.shared);
        self.groups.push_back(group);
        position
    }

    /// Queues `group` at an explicit `position`, overriding the monotonic
    /// counter (the counter itself is left untouched).
    pub fn add_group_at(&mut self, mut group: SubtaskGroup, position: i32) {
        group.attach(self.record.id, position, &self.shared);
        self.groups.push_back(group);
    }

    /// Runs every queued group in attachment order. A group whose error
    /// isn't ignored stops the queue: it has already waited for all of its
    /// own members before reporting the error, but groups after it never
    /// start.
    pub fn run_groups(&mut self) -> Result<(), TaskError> {
        while let Some(mut group) = self.groups.pop_front() {
            let pool_key = group.pool_key(&self.record.task_type);
            let pool = self.shared.provider.pool_for(pool_key);
            group.run(pool, &self.shared)?;
        }
        Ok(())
    }

    /// Clears the group queue and resets the position counter, used when a
    /// retryable task is replayed from the top. Subtask records already
    /// persisted from the previous attempt are left in the Task Store as
    /// history rather than deleted — the store has no delete operation, and
    /// the superseded records remain valid audit trail for the earlier run.
    pub fn reset(&mut self) {
        self.groups.clear();
        self.next_position = 0;
    }

    /// Marks the record dirty and writes it through, bumping its modified
    /// timestamp without changing state.
    pub fn heartbeat(&mut self) -> Result<(), TaskError> {
        self.record.touch();
        block_on(self.shared.store.mark_dirty(self.record.clone())).map_err(|e| TaskError::Failure(e.to_string()))
    }
}

/// The worker-side run body for a top-level task, mirroring
/// [`crate::subtask::execute_subtask_body`]'s finalize-on-all-exits shape:
/// transition to `Running`, invoke the user body, persist whichever
/// terminal state it produced, and call `on_complete` so the caller can
/// remove the task from the live-tasks map.
pub fn execute_task_body(
    mut body: Box<dyn TaskBody>,
    mut record: TaskRecord,
    shared: Arc<TaskShared>,
    on_complete: impl FnOnce(&TaskRecord) + Send + 'static,
) -> Result<(), TaskError> {
    record.state = TaskState::Initializing;
    if let Err(e) = block_on(shared.store.update(record.clone())) {
        tracing::warn!("failed to persist task record {}: {e}", record.id);
    }

    record.state = TaskState::Running;
    record.started_at = Some(Utc::now());
    if let Err(e) = block_on(shared.store.update(record.clone())) {
        tracing::warn!("failed to persist task record {}: {e}", record.id);
    }

    let mut task = RunnableTask::new(record, shared.clone());
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body.run(&mut task)))
        .unwrap_or_else(|payload| Err(TaskError::Panic(panic_message(payload))));
    let mut record = task.into_record();

    // A subtask `Timeout` (spec.md §8 scenario 5) fails the owning task, not
    // aborts it: only a true cooperative `Cancelled` (scenario 4) propagates
    // as an abort.
    let (state, error) = match &result {
        Ok(()) => (TaskState::Success, None),
        Err(err @ TaskError::Cancelled) => (TaskState::Aborted, Some(err.clone())),
        Err(err) => (TaskState::Failure, Some(err.clone())),
    };

    record.state = state;
    record.error = error.as_ref().map(|e| shared.record_error(e));
    record.completed_at = Some(Utc::now());
    if let Err(e) = block_on(shared.store.update(record.clone())) {
        tracing::warn!("failed to persist task record {}: {e}", record.id);
    }
    shared.listeners.run_after(&record, error.as_ref());
    on_complete(&record);

    result
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DefaultExecutorProvider;
    use crate::registry::{SubtaskBody, TaskRegistry};
    use store::InMemoryTaskStore;
    use telemetry::NoopTelemetrySink;

    fn shared() -> Arc<TaskShared> {
        Arc::new(TaskShared {
            abort_at: parking_lot::Mutex::new(None),
            listeners: crate::shared::Listeners::default(),
            telemetry: Arc::new(NoopTelemetrySink),
            store: Arc::new(InMemoryTaskStore::new()),
            registry: Arc::new(TaskRegistry::new()),
            provider: Arc::new(DefaultExecutorProvider::new(2)),
            redactor: crate::redact::PayloadRedactor::new(Vec::<String>::new()),
            owner: "test".into(),
            abort_grace: std::time::Duration::from_secs(60),
            spin_interval: std::time::Duration::from_millis(10),
            skip_subtask_abortable_check: true,
        })
    }

    struct Succeeds;
    impl SubtaskBody for Succeeds {
        fn run(&mut self) -> Result<(), TaskError> {
            Ok(())
        }
    }

    struct Fails;
    impl SubtaskBody for Fails {
        fn run(&mut self) -> Result<(), TaskError> {
            Err(TaskError::Failure("boom".into()))
        }
    }

    struct RunsOneGroup;
    impl TaskBody for RunsOneGroup {
        fn run(&mut self, task: &mut RunnableTask) -> Result<(), TaskError> {
            let mut group = SubtaskGroup::new();
            group.add("child", serde_json::json!({}), Succeeds);
            task.add_group(group);
            task.run_groups()
        }
    }

    struct RunsFailingGroup;
    impl TaskBody for RunsFailingGroup {
        fn run(&mut self, task: &mut RunnableTask) -> Result<(), TaskError> {
            let mut group = SubtaskGroup::new();
            group.add("child", serde_json::json!({}), Fails);
            task.add_group(group);
            task.run_groups()
        }
    }

    #[test]
    fn add_group_assigns_monotonic_positions_regardless_of_emptiness() {
        let shared = shared();
        let record = TaskRecord::new_top_level("demo", "test", serde_json::json!({}));
        let mut task = RunnableTask::new(record, shared);

        let empty = SubtaskGroup::new();
        let mut populated = SubtaskGroup::new();
        populated.add("child", serde_json::json!({}), Succeeds);

        assert_eq!(task.add_group(empty), 0);
        assert_eq!(task.add_group(populated), 1);
    }

    #[test]
    fn successful_task_ends_success_and_invokes_on_complete() {
        let shared = shared();
        let record = TaskRecord::new_top_level("demo", "test", serde_json::json!({}));
        let id = record.id;
        block_on(shared.store.save(record.clone())).unwrap();

        let completed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let completed_clone = completed.clone();

        let result = execute_task_body(Box::new(RunsOneGroup), record, shared.clone(), move |_| {
            completed_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        assert!(result.is_ok());
        assert!(completed.load(std::sync::atomic::Ordering::SeqCst));
        let stored = block_on(shared.store.get(id)).unwrap();
        assert_eq!(stored.state, TaskState::Success);
    }

    #[test]
    fn failing_group_fails_the_owning_task() {
        let shared = shared();
        let record = TaskRecord::new_top_level("demo", "test", serde_json::json!({}));
        let id = record.id;
        block_on(shared.store.save(record.clone())).unwrap();

        let result = execute_task_body(Box::new(RunsFailingGroup), record, shared.clone(), |_| {});

        assert!(result.is_err());
        let stored = block_on(shared.store.get(id)).unwrap();
        assert_eq!(stored.state, TaskState::Failure);
    }

    #[test]
    fn reset_clears_groups_and_restarts_position_counter() {
        let shared = shared();
        let record = TaskRecord::new_top_level("demo", "test", serde_json::json!({}));
        let mut task = RunnableTask::new(record, shared);

        let mut group = SubtaskGroup::new();
        group.add("child", serde_json::json!({}), Succeeds);
        task.add_group(group);
        assert_eq!(task.next_position, 1);

        task.reset();
        assert_eq!(task.next_position, 0);
        assert!(task.groups.is_empty());

        let mut group = SubtaskGroup::new();
        group.add("child", serde_json::json!({}), Succeeds);
        assert_eq!(task.add_group(group), 0);
    }

    #[test]
    fn heartbeat_bumps_updated_at() {
        let shared = shared();
        let record = TaskRecord::new_top_level("demo", "test", serde_json::json!({}));
        let id = record.id;
        block_on(shared.store.save(record.clone())).unwrap();
        let before = record.updated_at;

        let mut task = RunnableTask::new(record, shared.clone());
        std::thread::sleep(std::time::Duration::from_millis(5));
        task.heartbeat().unwrap();

        let stored = block_on(shared.store.get(id)).unwrap();
        assert!(stored.updated_at > before);
    }
}
