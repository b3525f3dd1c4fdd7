//! An ordered, in-memory member of a [`RunnableTask`](crate::task::RunnableTask):
//! a named set of [`RunnableSubtask`]s that run concurrently and are waited
//! on together.
use std::sync::Arc;
use std::time::Instant;

use store::{TaskId, TaskRecord, TaskState};

use crate::bridge::block_on;
use crate::error::TaskError;
use crate::pool::WorkerPool;
use crate::registry::SubtaskBody;
use crate::shared::TaskShared;
use crate::subtask::RunnableSubtask;

struct PendingMember {
    body: Box<dyn SubtaskBody>,
    task_type: String,
    payload: serde_json::Value,
}

/// A subtask group and its group-level policy: whether member failures
/// propagate to the owning task, the phase tag stamped on every member's
/// record, and an optional explicit worker pool (falls back to the
/// provider's choice for the parent task's type if unset).
pub struct SubtaskGroup {
    group_type_tag: Option<String>,
    ignore_errors: bool,
    pool: Option<Arc<dyn WorkerPool>>,
    pending: Vec<PendingMember>,
    members: Vec<RunnableSubtask>,
    position: Option<i32>,
}

impl SubtaskGroup {
    pub fn new() -> Self {
        Self {
            group_type_tag: None,
            ignore_errors: false,
            pool: None,
            pending: Vec::new(),
            members: Vec::new(),
            position: None,
        }
    }

    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    pub fn group_type_tag(mut self, tag: impl Into<String>) -> Self {
        self.group_type_tag = Some(tag.into());
        self
    }

    pub fn pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Queues a subtask body for this group. The member's record isn't
    /// created until the group is attached to its parent task, since the
    /// record needs the parent's id and the group's position.
    pub fn add(
        &mut self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        body: impl SubtaskBody + 'static,
    ) -> &mut Self {
        self.pending.push(PendingMember {
            body: Box::new(body),
            task_type: task_type.into(),
            payload,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn position(&self) -> Option<i32> {
        self.position
    }

    /// The task-type key used to resolve a fallback worker pool when this
    /// group has no explicit pool of its own: the group's own tag if set,
    /// else the owning task's type.
    pub(crate) fn pool_key<'a>(&'a self, owning_task_type: &'a str) -> &'a str {
        self.group_type_tag.as_deref().unwrap_or(owning_task_type)
    }

    /// Assigns `position`, writes every queued member's parent-link and
    /// position to the Task Store, and makes the group ready to run.
    pub(crate) fn attach(&mut self, parent_id: TaskId, position: i32, shared: &Arc<TaskShared>) {
        self.position = Some(position);
        for pending in self.pending.drain(..) {
            let payload = shared.redactor.redact(&pending.payload);
            let mut record =
                TaskRecord::new_subtask(pending.task_type, shared.owner.clone(), parent_id, position, payload);
            record.group_type_tag = self.group_type_tag.clone();
            if let Err(e) = block_on(shared.store.save(record.clone())) {
                tracing::warn!("failed to persist subtask record {}: {e}", record.id);
            }
            self.members.push(RunnableSubtask::new(pending.body, record, shared.clone()));
        }
    }

    /// Runs this group's members per the wait policy: submit all, then
    /// round-robin poll with a fixed spin interval until every member has
    /// terminated, honoring per-member time limits and the parent's abort
    /// grace. Returns the first observed error unless `ignore_errors` is
    /// set, in which case failures are logged and absorbed.
    pub(crate) fn run(&mut self, fallback_pool: Arc<dyn WorkerPool>, shared: &Arc<TaskShared>) -> Result<(), TaskError> {
        if self.members.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone().unwrap_or(fallback_pool);

        for member in &mut self.members {
            if let Err(e) = member.submit_to(pool.as_ref()) {
                tracing::warn!(
                    "subtask {} failed at submission: {e} (payload: {})",
                    member.id(),
                    crate::redact::truncate_payload_excerpt(&member.record().payload)
                );
            }
        }

        let wait_started = Instant::now();
        let mut in_flight: Vec<usize> = (0..self.members.len()).collect();
        let mut first_error: Option<TaskError> = None;

        while !in_flight.is_empty() {
            let mut still_in_flight = Vec::with_capacity(in_flight.len());

            for idx in in_flight {
                let member = &mut self.members[idx];

                if let Some(result) = member.handle().and_then(|h| h.poll()) {
                    member.refresh_from_store();
                    if let Err(e) = result {
                        self.note_error(&mut first_error, e);
                    }
                    continue;
                }

                if let Some(limit) = member.time_limit() {
                    if wait_started.elapsed() > limit {
                        member.cancel();
                        member.force_abort(TaskError::Timeout);
                        self.note_error(&mut first_error, TaskError::Timeout);
                        continue;
                    }
                }

                if shared.should_force_cancel(&member.record().task_type) {
                    member.cancel();
                    member.force_abort(TaskError::Cancelled);
                    self.note_error(&mut first_error, TaskError::Cancelled);
                    continue;
                }

                still_in_flight.push(idx);
            }

            in_flight = still_in_flight;
            if !in_flight.is_empty() {
                std::thread::sleep(shared.spin_interval);
            }
        }

        tracing::debug!(
            "group finished: {}/{} members completed, all_succeeded={}",
            self.completed_count(),
            self.member_count(),
            self.all_succeeded()
        );

        if !self.ignore_errors {
            if let Some(e) = first_error {
                return Err(e);
            }
        } else if let Some(e) = first_error {
            tracing::info!("group absorbed subtask error (ignore_errors): {e}");
        }

        Ok(())
    }

    fn note_error(&self, first_error: &mut Option<TaskError>, error: TaskError) {
        if first_error.is_none() {
            *first_error = Some(error);
        }
    }

    pub(crate) fn completed_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| matches!(m.record().state, TaskState::Success | TaskState::Failure | TaskState::Aborted))
            .count()
    }

    pub(crate) fn member_count(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn all_succeeded(&self) -> bool {
        self.members.iter().all(|m| m.record().state == TaskState::Success)
    }
}

impl Default for SubtaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
