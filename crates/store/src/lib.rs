//! The Task Store contract: durable persistence for [`TaskRecord`]s, kept
//! outside the executor so a real deployment can swap in a database-backed
//! implementation without touching the engine. [`InMemoryTaskStore`] is the
//! reference implementation used by tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(uuid::Uuid::nil())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a [`TaskRecord`] sits in the state machine from the data model.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Initializing,
    Running,
    Success,
    Failure,
    Aborted,
}

impl TaskState {
    /// Whether this is one of the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure | TaskState::Aborted)
    }

    /// Whether `next` is a legal transition out of `self`: `Created ->
    /// Initializing -> Running -> {Success, Failure, Aborted}`, with
    /// `Created`/`Initializing` allowed to jump straight to `Aborted` or
    /// `Failure` (pre-start cancellation / submission error).
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Created, Initializing)
                | (Created | Initializing, Aborted | Failure)
                | (Initializing, Running)
                | (Running, Running)
                | (Running, Success | Failure | Aborted)
        )
    }
}

/// The position of a record within its parent's group sequence. `-1` marks a
/// top-level task; a non-negative value is the zero-based index of the
/// owning group for a subtask.
pub const TOP_LEVEL_POSITION: i32 = -1;

/// The durable record backing one runnable task or one runnable subtask.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskRecord {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    pub task_type: String,
    pub state: TaskState,
    pub position: i32,
    pub group_type_tag: Option<String>,
    pub owner: String,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new_top_level(
        task_type: impl Into<String>,
        owner: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            parent_id: None,
            task_type: task_type.into(),
            state: TaskState::Created,
            position: TOP_LEVEL_POSITION,
            group_type_tag: None,
            owner: owner.into(),
            payload,
            error: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn new_subtask(
        task_type: impl Into<String>,
        owner: impl Into<String>,
        parent_id: TaskId,
        position: i32,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            parent_id: Some(parent_id),
            task_type: task_type.into(),
            state: TaskState::Created,
            position,
            group_type_tag: None,
            owner: owner.into(),
            payload,
            error: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no task record for id {0}")]
    NotFound(TaskId),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence boundary the executor submits [`TaskRecord`] mutations
/// through: `save`/`update`/`refresh`/`mark_dirty`/`get`, matching the
/// external Task Store contract. A production implementation typically
/// wraps a database; [`InMemoryTaskStore`] is the in-process reference used
/// for tests and local runs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, record: TaskRecord) -> Result<(), StoreError>;

    async fn update(&self, record: TaskRecord) -> Result<(), StoreError>;

    /// Re-reads the record with the given id from the backing store.
    async fn refresh(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    /// Persists a record whose only guaranteed-changed field is its
    /// liveness timestamp (`touch`'d by the caller before this is called).
    async fn mark_dirty(&self, record: TaskRecord) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError>;
}

/// In-memory [`TaskStore`]. Each record gets its own lock rather than one
/// lock guarding the whole table, so updates to unrelated tasks never
/// contend with each other.
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<TaskId, Arc<RwLock<TaskRecord>>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: TaskId) -> Result<Arc<RwLock<TaskRecord>>, StoreError> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(record.id, Arc::new(RwLock::new(record)));
        Ok(())
    }

    async fn update(&self, record: TaskRecord) -> Result<(), StoreError> {
        let slot = self.slot(record.id)?;
        *slot.write() = record;
        Ok(())
    }

    async fn refresh(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.get(id).await
    }

    async fn mark_dirty(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.update(record).await
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        Ok(self.slot(id)?.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_graph_rejects_skipping_initializing() {
        assert!(!TaskState::Created.can_transition_to(TaskState::Running));
        assert!(TaskState::Created.can_transition_to(TaskState::Initializing));
    }

    #[test]
    fn terminal_states_are_sticky() {
        assert!(!TaskState::Success.can_transition_to(TaskState::Running));
        assert!(!TaskState::Aborted.can_transition_to(TaskState::Failure));
    }

    #[test]
    fn created_or_initializing_may_jump_to_aborted_or_failure() {
        assert!(TaskState::Created.can_transition_to(TaskState::Aborted));
        assert!(TaskState::Initializing.can_transition_to(TaskState::Failure));
    }

    #[tokio::test]
    async fn save_then_update_roundtrips() {
        let store = InMemoryTaskStore::new();
        let mut record = TaskRecord::new_top_level("demo", "owner-1", serde_json::json!({}));
        let id = record.id;
        store.save(record.clone()).await.unwrap();

        record.state = TaskState::Initializing;
        store.update(record.clone()).await.unwrap();

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.state, TaskState::Initializing);
    }

    #[tokio::test]
    async fn update_of_unknown_record_errors() {
        let store = InMemoryTaskStore::new();
        let record = TaskRecord::new_top_level("demo", "owner-1", serde_json::json!({}));
        let err = store.update(record).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn subtask_position_matches_owning_group_index() {
        let store = InMemoryTaskStore::new();
        let parent = TaskRecord::new_top_level("demo", "owner-1", serde_json::json!({}));
        let parent_id = parent.id;
        store.save(parent).await.unwrap();

        let child = TaskRecord::new_subtask("demo-child", "owner-1", parent_id, 2, serde_json::json!({}));
        assert_eq!(child.position, 2);
        assert_eq!(child.parent_id, Some(parent_id));
    }
}
