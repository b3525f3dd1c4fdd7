//! The Task Registry: a static mapping from task-type tag to a factory that
//! builds a fresh task object, plus the flat capability descriptors
//! (abortable / retryable) the executor consults at abort and resubmission
//! time. An explicit registration table, not reflection: this avoids
//! scanning type hierarchies for capability annotations and gives a
//! diagnosable error for a missing entry instead of a runtime class-cast
//! failure.
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ExecutorError, TaskError};
use crate::task::RunnableTask;

/// A user task body. Authors implement this for each task type and
/// register it with a [`TaskRegistry`]; the executor never constructs one
/// directly except through the registered factory.
pub trait TaskBody: Send {
    /// Called once right after construction, before the task is submitted.
    fn initialize(&mut self, params: serde_json::Value) -> Result<(), TaskError> {
        let _ = params;
        Ok(())
    }

    /// The task's sequential body: declaratively add groups to `task` and
    /// call [`RunnableTask::run_groups`] to dispatch them.
    fn run(&mut self, task: &mut RunnableTask) -> Result<(), TaskError>;
}

/// A user subtask body, run inside a worker by the owning
/// [`RunnableSubtask`](crate::subtask::RunnableSubtask).
pub trait SubtaskBody: Send {
    fn run(&mut self) -> Result<(), TaskError>;
}

/// Capability markers and factory for one registered task type.
#[derive(Clone)]
pub struct TaskDescriptor {
    factory: Arc<dyn Fn() -> Box<dyn TaskBody> + Send + Sync>,
    pub abortable: bool,
    pub retryable: bool,
}

impl TaskDescriptor {
    pub fn build(&self) -> Box<dyn TaskBody> {
        (self.factory)()
    }
}

/// Maps task-type tags to [`TaskDescriptor`]s. Populated by explicit
/// `.register(...)` calls at startup, not by scanning or attribute
/// discovery.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    descriptors: HashMap<String, TaskDescriptor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task type under `tag`. `abortable`/`retryable` default
    /// to false when unmarked, per the spec; callers opt in explicitly.
    pub fn register<F, T>(&mut self, tag: impl Into<String>, abortable: bool, retryable: bool, factory: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: TaskBody + 'static,
    {
        self.descriptors.insert(
            tag.into(),
            TaskDescriptor {
                factory: Arc::new(move || Box::new(factory())),
                abortable,
                retryable,
            },
        );
    }

    pub fn descriptor(&self, tag: &str) -> Option<&TaskDescriptor> {
        self.descriptors.get(tag)
    }

    pub fn is_abortable(&self, tag: &str) -> bool {
        self.descriptors.get(tag).map(|d| d.abortable).unwrap_or(false)
    }

    pub fn is_retryable(&self, tag: &str) -> bool {
        self.descriptors.get(tag).map(|d| d.retryable).unwrap_or(false)
    }

    pub fn create(&self, tag: &str) -> Result<Box<dyn TaskBody>, ExecutorError> {
        self.descriptor(tag)
            .map(|d| d.build())
            .ok_or_else(|| ExecutorError::UnknownTaskType(tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl TaskBody for Noop {
        fn run(&mut self, _task: &mut RunnableTask) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn unknown_tag_fails_lookup() {
        let registry = TaskRegistry::new();
        let result = registry.create("nope");
        assert!(matches!(result, Err(ExecutorError::UnknownTaskType(_))));
    }

    #[test]
    fn unmarked_capabilities_default_false() {
        let mut registry = TaskRegistry::new();
        registry.register("demo", false, false, || Noop);
        assert!(!registry.is_abortable("demo"));
        assert!(!registry.is_retryable("demo"));
    }

    #[test]
    fn registered_capabilities_are_flat_per_type() {
        let mut registry = TaskRegistry::new();
        registry.register("abortable-demo", true, false, || Noop);
        registry.register("retryable-demo", false, true, || Noop);
        assert!(registry.is_abortable("abortable-demo"));
        assert!(!registry.is_retryable("abortable-demo"));
        assert!(registry.is_retryable("retryable-demo"));
    }

    #[test]
    fn create_builds_a_fresh_instance_each_time() {
        let mut registry = TaskRegistry::new();
        registry.register("demo", false, false, || Noop);
        assert!(registry.create("demo").is_ok());
        assert!(registry.create("demo").is_ok());
    }
}
