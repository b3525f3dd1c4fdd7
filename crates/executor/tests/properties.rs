//! Idempotence properties that don't fit the six named scenarios, plus a
//! proptest sweep over the task state-transition graph.
use std::sync::Arc;
use std::time::Duration;

use executor::{
    DefaultExecutorProvider, ExecutorConfig, RunnableTask, SubtaskBody, SubtaskGroup, TaskBody,
    TaskError, TaskExecutor, TaskRegistry,
};
use proptest::prelude::*;
use store::{InMemoryTaskStore, TaskState};
use telemetry::NoopTelemetrySink;

fn fast_executor(registry: TaskRegistry) -> TaskExecutor {
    TaskExecutor::new(
        ExecutorConfig {
            owner: "property-test".into(),
            abort_grace: Duration::from_millis(80),
            spin_interval: Duration::from_millis(10),
            skip_subtask_abortable_check: true,
            secret_payload_fields: Vec::new(),
        },
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(NoopTelemetrySink),
        Arc::new(registry),
        Arc::new(DefaultExecutorProvider::new(4)),
    )
}

struct SleepAwhile;
impl SubtaskBody for SleepAwhile {
    fn run(&mut self) -> Result<(), TaskError> {
        std::thread::sleep(Duration::from_secs(5));
        Ok(())
    }
}

struct SleepyTask;
impl TaskBody for SleepyTask {
    fn run(&mut self, task: &mut RunnableTask) -> Result<(), TaskError> {
        let mut group = SubtaskGroup::new();
        group.add("sleep", serde_json::json!({}), SleepAwhile);
        task.add_group(group);
        task.run_groups()
    }
}

#[test]
fn abort_is_idempotent_and_only_sets_the_abort_time_once() {
    let mut registry = TaskRegistry::new();
    registry.register("sleepy", true, false, || SleepyTask);
    let executor = fast_executor(registry);

    let (body, record) = executor.create_runnable("sleepy", serde_json::json!({})).unwrap();
    let id = record.id;
    executor.submit(body, record).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let first = executor.abort(id).unwrap();
    let second = executor.abort(id).unwrap();
    assert_eq!(first.state, second.state);

    let result = executor.wait_for(id, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(result.state, TaskState::Aborted);
}

#[test]
fn shutdown_is_idempotent() {
    let registry = TaskRegistry::new();
    let executor = fast_executor(registry);
    assert!(executor.shutdown(Duration::from_secs(1)));
    assert!(executor.shutdown(Duration::from_secs(1)));
}

proptest! {
    /// The state machine never allows a transition out of a terminal state,
    /// and every legal non-terminal transition lands in exactly one of the
    /// documented successor states.
    #[test]
    fn terminal_states_admit_no_further_transition(
        state_idx in 0..6usize,
        next_idx in 0..6usize,
    ) {
        let states = [
            TaskState::Created,
            TaskState::Initializing,
            TaskState::Running,
            TaskState::Success,
            TaskState::Failure,
            TaskState::Aborted,
        ];
        let state = states[state_idx];
        let next = states[next_idx];

        if state.is_terminal() {
            prop_assert!(!state.can_transition_to(next));
        }
        if state.can_transition_to(next) {
            prop_assert!(!state.is_terminal());
            prop_assert!(matches!(
                next,
                TaskState::Initializing | TaskState::Running | TaskState::Success | TaskState::Failure | TaskState::Aborted
            ));
        }
    }
}
