//! The Task Executor: the singleton facade that owns the live-tasks map,
//! the registry, and the external collaborators, and exposes the five
//! operations user code actually calls.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use store::{TaskId, TaskRecord, TaskState, TaskStore};
use telemetry::TelemetrySink;

use crate::bridge::block_on;
use crate::error::ExecutorError;
use crate::pool::{ExecutorProvider, SubtaskHandle};
use crate::redact::PayloadRedactor;
use crate::registry::{TaskBody, TaskRegistry};
use crate::shared::TaskShared;
use crate::task::execute_task_body;

struct LiveEntry {
    shared: Arc<TaskShared>,
    // kept alive for the task's duration; wait_for polls the store rather
    // than this handle, since the store write happens-before the handle's
    // result is observable.
    _handle: SubtaskHandle,
}

/// The live-tasks map: a sealable table of in-flight top-level tasks. Once
/// sealed, no further task can be inserted — this is the purpose-built
/// primitive the executor needs instead of a bare concurrent map, since
/// shutdown has to stop new submissions and then wait for exactly the set
/// of tasks that were in flight at that moment to drain.
#[derive(Default)]
struct LiveTasks {
    entries: DashMap<TaskId, LiveEntry>,
    sealed: AtomicBool,
}

impl LiveTasks {
    fn try_insert(&self, id: TaskId, entry: LiveEntry) -> Result<(), ()> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(());
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    fn remove(&self, id: TaskId) {
        self.entries.remove(&id);
    }

    fn contains(&self, id: TaskId) -> bool {
        self.entries.contains_key(&id)
    }

    fn shared_for(&self, id: TaskId) -> Option<Arc<TaskShared>> {
        self.entries.get(&id).map(|e| e.shared.clone())
    }

    fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    fn broadcast_abort(&self) {
        for entry in self.entries.iter() {
            entry.shared.set_abort_time_now();
        }
    }

    fn wait_until_empty(&self, timeout: Duration, poll: Duration) -> bool {
        let start = Instant::now();
        while !self.entries.is_empty() {
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(poll);
        }
        true
    }
}

/// Collaborators and policy a [`TaskExecutor`] is constructed with.
pub struct ExecutorConfig {
    pub owner: String,
    pub abort_grace: Duration,
    pub spin_interval: Duration,
    pub skip_subtask_abortable_check: bool,
    pub secret_payload_fields: Vec<String>,
}

pub struct TaskExecutor {
    live: Arc<LiveTasks>,
    shutdown: AtomicBool,
    store: Arc<dyn TaskStore>,
    telemetry: Arc<dyn TelemetrySink>,
    registry: Arc<TaskRegistry>,
    provider: Arc<dyn ExecutorProvider>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        config: ExecutorConfig,
        store: Arc<dyn TaskStore>,
        telemetry: Arc<dyn TelemetrySink>,
        registry: Arc<TaskRegistry>,
        provider: Arc<dyn ExecutorProvider>,
    ) -> Self {
        Self {
            live: Arc::new(LiveTasks::default()),
            shutdown: AtomicBool::new(false),
            store,
            telemetry,
            registry,
            provider,
            config,
        }
    }

    fn redactor(&self) -> PayloadRedactor {
        PayloadRedactor::new(self.config.secret_payload_fields.clone())
    }

    /// Looks up `task_type` in the registry, constructs and initializes the
    /// body, and persists a fresh `Created` record at position -1.
    pub fn create_runnable(
        &self,
        task_type: &str,
        params: serde_json::Value,
    ) -> Result<(Box<dyn TaskBody>, TaskRecord), ExecutorError> {
        let mut body = self.registry.create(task_type)?;
        body.initialize(params.clone()).map_err(|e| ExecutorError::TaskFailed(TaskId::nil(), e.message()))?;
        let redactor = self.redactor();
        let record = TaskRecord::new_top_level(task_type, self.config.owner.clone(), redactor.redact(&params));
        block_on(self.store.save(record.clone()))?;
        Ok((body, record))
    }

    /// Inserts the task into the live-tasks map and submits it to a pool
    /// chosen by the Executor Provider. A submission failure removes it
    /// from the map, transitions it to `Failure`, and surfaces the cause.
    pub fn submit(&self, body: Box<dyn TaskBody>, mut record: TaskRecord) -> Result<TaskId, ExecutorError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ExecutorError::ExecutorShuttingDown);
        }

        let id = record.id;
        record.scheduled_at = Some(Utc::now());
        block_on(self.store.update(record.clone()))?;

        let shared = Arc::new(TaskShared {
            abort_at: parking_lot::Mutex::new(None),
            listeners: crate::shared::Listeners::default(),
            telemetry: self.telemetry.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            provider: self.provider.clone(),
            redactor: self.redactor(),
            owner: self.config.owner.clone(),
            abort_grace: self.config.abort_grace,
            spin_interval: self.config.spin_interval,
            skip_subtask_abortable_check: self.config.skip_subtask_abortable_check,
        });

        let pool = self.provider.pool_for(&record.task_type);
        let live = self.live.clone();
        let record_for_job = record.clone();
        let shared_for_job = shared.clone();

        let job: Box<dyn FnOnce() -> Result<(), crate::error::TaskError> + Send> = Box::new(move || {
            execute_task_body(body, record_for_job, shared_for_job, move |final_record| {
                live.remove(final_record.id);
            })
        });

        let handle = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.submit(job))) {
            Ok(handle) => handle,
            Err(_) => {
                record.state = TaskState::Failure;
                record.error = Some("task submission panicked".to_string());
                record.completed_at = Some(Utc::now());
                let _ = block_on(self.store.update(record.clone()));
                return Err(ExecutorError::TaskFailed(id, "submission panicked".to_string()));
            }
        };

        if self.live.try_insert(id, LiveEntry { shared, _handle: handle }).is_err() {
            record.state = TaskState::Failure;
            record.error = Some("executor is shutting down".to_string());
            record.completed_at = Some(Utc::now());
            let _ = block_on(self.store.update(record.clone()));
            return Err(ExecutorError::ExecutorShuttingDown);
        }

        Ok(id)
    }

    /// Blocks until `id`'s top-level task has left the live-tasks map, then
    /// returns its final record. If `timeout` elapses first, the task keeps
    /// running in the background and the caller only unblocks.
    pub fn wait_for(&self, id: TaskId, timeout: Option<Duration>) -> Result<TaskRecord, ExecutorError> {
        let start = Instant::now();
        loop {
            if !self.live.contains(id) {
                let record = block_on(self.store.get(id))?;
                if let Some(error) = &record.error {
                    if record.state == TaskState::Failure {
                        return Err(ExecutorError::TaskFailed(id, error.clone()));
                    }
                }
                return Ok(record);
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(ExecutorError::Timeout(id));
                }
            }
            std::thread::sleep(self.config.spin_interval);
        }
    }

    /// Signals abort: sets the task's abort time (idempotent) and
    /// optimistically flips its record to `Aborted` if it's still in a
    /// non-terminal state. The task itself continues running until its own
    /// time limit or the abort grace elapses and a subtask notices.
    pub fn abort(&self, id: TaskId) -> Result<TaskRecord, ExecutorError> {
        let Some(shared) = self.live.shared_for(id) else {
            return Err(ExecutorError::UnknownTask(id));
        };

        let mut record = block_on(self.store.get(id))?;
        if !self.registry.is_abortable(&record.task_type) {
            return Err(ExecutorError::NotAbortable(record.task_type));
        }

        shared.set_abort_time_now();

        if matches!(record.state, TaskState::Created | TaskState::Initializing | TaskState::Running) {
            record.state = TaskState::Aborted;
            record.touch();
            block_on(self.store.update(record.clone()))?;
        }

        Ok(record)
    }

    /// Idempotent. Seals the live-tasks map against new submissions, then
    /// broadcasts an abort signal to every task still running, and waits up
    /// to `timeout` for the map to drain. Worker pools themselves are
    /// shut down separately by whoever owns the Executor Provider.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.store(true, Ordering::SeqCst);
        self.live.seal();
        self.live.broadcast_abort();
        self.live.wait_until_empty(timeout, self.config.spin_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::SubtaskGroup;
    use crate::pool::DefaultExecutorProvider;
    use crate::registry::SubtaskBody;
    use crate::task::RunnableTask;
    use store::InMemoryTaskStore;
    use telemetry::NoopTelemetrySink;

    fn executor() -> TaskExecutor {
        let mut registry = TaskRegistry::new();
        registry.register("noop", true, false, || NoopTask);
        registry.register("sleepy", true, false, || SleepyTask);

        TaskExecutor::new(
            ExecutorConfig {
                owner: "test".into(),
                abort_grace: Duration::from_millis(50),
                spin_interval: Duration::from_millis(5),
                skip_subtask_abortable_check: true,
                secret_payload_fields: Vec::new(),
            },
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(NoopTelemetrySink),
            Arc::new(registry),
            Arc::new(DefaultExecutorProvider::new(2)),
        )
    }

    struct AlwaysSucceeds;
    impl SubtaskBody for AlwaysSucceeds {
        fn run(&mut self) -> Result<(), crate::error::TaskError> {
            Ok(())
        }
    }

    struct NoopTask;
    impl TaskBody for NoopTask {
        fn run(&mut self, task: &mut RunnableTask) -> Result<(), crate::error::TaskError> {
            let mut group = SubtaskGroup::new();
            group.add("child", serde_json::json!({}), AlwaysSucceeds);
            task.add_group(group);
            task.run_groups()
        }
    }

    struct SleepyTask;
    impl TaskBody for SleepyTask {
        fn run(&mut self, _task: &mut RunnableTask) -> Result<(), crate::error::TaskError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }

    #[test]
    fn happy_path_create_submit_wait() {
        let executor = executor();
        let (body, record) = executor.create_runnable("noop", serde_json::json!({})).unwrap();
        let id = record.id;
        executor.submit(body, record).unwrap();

        let result = executor.wait_for(id, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(result.state, TaskState::Success);
    }

    #[test]
    fn unknown_task_type_is_rejected() {
        let executor = executor();
        let result = executor.create_runnable("nope", serde_json::json!({}));
        assert!(matches!(result, Err(ExecutorError::UnknownTaskType(_))));
    }

    #[test]
    fn abort_is_idempotent() {
        let executor = executor();
        let (body, record) = executor.create_runnable("sleepy", serde_json::json!({})).unwrap();
        let id = record.id;
        executor.submit(body, record).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let first = executor.abort(id).unwrap();
        let second = executor.abort(id).unwrap();
        assert_eq!(first.state, second.state);

        let _ = executor.wait_for(id, Some(Duration::from_secs(2)));
    }

    #[test]
    fn shutdown_drains_in_flight_tasks() {
        let executor = executor();
        let (body, record) = executor.create_runnable("sleepy", serde_json::json!({})).unwrap();
        let id = record.id;
        executor.submit(body, record).unwrap();

        let drained = executor.shutdown(Duration::from_secs(2));
        assert!(drained);

        let err = executor.create_runnable("noop", serde_json::json!({}));
        assert!(err.is_ok());
        let (body, record) = err.unwrap();
        let submit_err = executor.submit(body, record).unwrap_err();
        assert!(matches!(submit_err, ExecutorError::ExecutorShuttingDown));
        let _ = id;
    }
}
