//! Per-host provisioning request and its task state machine
//!
//! ```text
//! PENDING --(first task dispatched)--> IN_PROGRESS
//! IN_PROGRESS --(task succeeds, more remain)--> IN_PROGRESS
//! IN_PROGRESS --(last task succeeds)--> COMPLETED
//! IN_PROGRESS --(any task fails)--> FAILED   (until retried)
//! ```

use chrono::{DateTime, Utc};
use clusterforge_models::{
    HostRequestId, HostRequestStatus, HostRequestSummary, RequestId, TaskKind, TaskOutcome,
};
use serde::{Deserialize, Serialize};

use crate::error::{RecoveryInconsistency, TaskFailure, TransitionError};

/// A task that has been handed to its collaborator and not yet confirmed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskAttempt {
    pub kind: TaskKind,
    pub attempt: u32,
}

/// Result of applying a completion to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Task succeeded and `next` is ready to dispatch
    Advanced { next: TaskKind },
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRequest {
    id: HostRequestId,
    request_id: RequestId,
    cluster_id: String,
    hostname: String,
    host_group: String,
    topology_revision: u32,
    tasks: Vec<TaskKind>,
    next_task: usize,
    status: HostRequestStatus,
    in_flight: Option<TaskAttempt>,
    attempts: u32,
    last_error: Option<TaskFailure>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl HostRequest {
    pub fn new(
        id: HostRequestId,
        request_id: RequestId,
        cluster_id: impl Into<String>,
        hostname: impl Into<String>,
        host_group: impl Into<String>,
        topology_revision: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            request_id,
            cluster_id: cluster_id.into(),
            hostname: hostname.into(),
            host_group: host_group.into(),
            topology_revision,
            tasks: TaskKind::PIPELINE.to_vec(),
            next_task: 0,
            status: HostRequestStatus::Pending,
            in_flight: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> HostRequestId {
        self.id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn host_group(&self) -> &str {
        &self.host_group
    }

    pub fn topology_revision(&self) -> u32 {
        self.topology_revision
    }

    pub fn status(&self) -> HostRequestStatus {
        self.status
    }

    pub fn in_flight(&self) -> Option<TaskAttempt> {
        self.in_flight
    }

    pub fn last_error(&self) -> Option<&TaskFailure> {
        self.last_error.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Tasks whose success has been confirmed, in order
    pub fn completed_tasks(&self) -> &[TaskKind] {
        &self.tasks[..self.next_task]
    }

    /// The next task to dispatch, if the current one (if any) has succeeded
    /// and the request is not terminal.
    pub fn advance(&self) -> Option<TaskKind> {
        if self.status.is_terminal() || self.in_flight.is_some() {
            return None;
        }
        self.tasks.get(self.next_task).copied()
    }

    /// Mark the next task as in flight under a fresh attempt number.
    pub fn start_next(&mut self) -> Result<TaskAttempt, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        let kind = self.advance().ok_or(TransitionError::NothingToDispatch)?;
        self.attempts += 1;
        let attempt = TaskAttempt {
            kind,
            attempt: self.attempts,
        };
        self.in_flight = Some(attempt);
        self.status = HostRequestStatus::InProgress;
        self.touch();
        Ok(attempt)
    }

    /// Apply a completion report for the in-flight task.
    pub fn complete(&mut self, kind: TaskKind, outcome: TaskOutcome) -> Result<Transition, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        let in_flight = self.in_flight.ok_or(TransitionError::NoTaskInFlight(kind))?;
        if in_flight.kind != kind {
            return Err(TransitionError::UnexpectedTask {
                expected: in_flight.kind,
                actual: kind,
            });
        }

        self.in_flight = None;
        self.touch();
        match outcome {
            TaskOutcome::Success => {
                self.next_task += 1;
                match self.tasks.get(self.next_task) {
                    Some(next) => Ok(Transition::Advanced { next: *next }),
                    None => {
                        self.status = HostRequestStatus::Completed;
                        Ok(Transition::Completed)
                    }
                }
            }
            TaskOutcome::Failure { message } => {
                self.status = HostRequestStatus::Failed;
                self.last_error = Some(TaskFailure::Reported { kind, message });
                Ok(Transition::Failed)
            }
        }
    }

    /// Fail the request without a completion report, e.g. when dispatch itself was rejected.
    pub fn fail(&mut self, failure: TaskFailure) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        self.in_flight = None;
        self.status = HostRequestStatus::Failed;
        self.last_error = Some(failure);
        self.touch();
        Ok(())
    }

    /// Cancel a non-terminal request. Any in-flight outcome is discarded when it arrives.
    /// Returns `false` when the request was already terminal.
    pub fn abort(&mut self, reason: &str) -> bool {
        self.fail(TaskFailure::Cancelled(reason.to_string())).is_ok()
    }

    pub fn mark_orphaned(&mut self, inconsistency: &RecoveryInconsistency) {
        self.in_flight = None;
        self.status = HostRequestStatus::Failed;
        self.last_error = Some(TaskFailure::Orphaned(inconsistency.to_string()));
        self.touch();
    }

    /// Return a failed request to PENDING so the failed task runs again.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        if self.status != HostRequestStatus::Failed {
            return Err(TransitionError::NotFailed(self.status));
        }
        if matches!(self.last_error, Some(TaskFailure::Orphaned(_))) {
            return Err(TransitionError::Orphaned);
        }
        self.status = HostRequestStatus::Pending;
        self.in_flight = None;
        self.last_error = None;
        self.touch();
        Ok(())
    }

    /// Forget an unconfirmed dispatch so the same task is dispatched again.
    /// Used after restart, when the original attempt's fate is unknown.
    pub fn reset_in_flight(&mut self) -> Option<TaskAttempt> {
        let previous = self.in_flight.take();
        if previous.is_some() {
            self.touch();
        }
        previous
    }

    pub fn summary(&self) -> HostRequestSummary {
        HostRequestSummary {
            id: self.id,
            request_id: self.request_id,
            cluster_id: self.cluster_id.clone(),
            hostname: self.hostname.clone(),
            host_group: self.host_group.clone(),
            status: self.status,
            next_task: self.tasks.get(self.next_task).copied(),
            completed_tasks: self.completed_tasks().to_vec(),
            attempt: self.attempts,
            last_error: self.last_error.as_ref().map(ToString::to_string),
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request() -> HostRequest {
        HostRequest::new(1, Uuid::new_v4(), "c1", "h1", "master", 1)
    }

    #[test]
    fn test_new_request_is_pending_at_resource_creation() {
        let req = request();
        assert_eq!(req.status(), HostRequestStatus::Pending);
        assert_eq!(req.advance(), Some(TaskKind::ResourceCreation));
        assert!(req.completed_tasks().is_empty());
    }

    #[test]
    fn test_runs_pipeline_in_order() {
        let mut req = request();
        for (i, kind) in TaskKind::PIPELINE.iter().enumerate() {
            let attempt = req.start_next().unwrap();
            assert_eq!(attempt.kind, *kind);
            assert_eq!(req.status(), HostRequestStatus::InProgress);
            // No second dispatch while the task is in flight
            assert_eq!(req.advance(), None);

            let transition = req.complete(*kind, TaskOutcome::Success).unwrap();
            if i + 1 < TaskKind::PIPELINE.len() {
                assert_eq!(transition, Transition::Advanced { next: TaskKind::PIPELINE[i + 1] });
            } else {
                assert_eq!(transition, Transition::Completed);
            }
        }
        assert_eq!(req.status(), HostRequestStatus::Completed);
        assert_eq!(req.completed_tasks(), TaskKind::PIPELINE);
        assert_eq!(req.advance(), None);
        assert!(matches!(req.start_next(), Err(TransitionError::AlreadyTerminal(_))));
    }

    #[test]
    fn test_failure_is_terminal_and_halts_pipeline() {
        let mut req = request();
        req.start_next().unwrap();
        req.complete(TaskKind::ResourceCreation, TaskOutcome::Success).unwrap();
        req.start_next().unwrap();

        let transition = req
            .complete(TaskKind::Configure, TaskOutcome::failure("bad config"))
            .unwrap();
        assert_eq!(transition, Transition::Failed);
        assert_eq!(req.status(), HostRequestStatus::Failed);
        assert_eq!(req.completed_tasks(), [TaskKind::ResourceCreation]);
        assert_eq!(req.advance(), None);
        assert_eq!(
            req.last_error(),
            Some(&TaskFailure::Reported {
                kind: TaskKind::Configure,
                message: "bad config".to_string()
            })
        );
        assert!(matches!(
            req.complete(TaskKind::Configure, TaskOutcome::Success),
            Err(TransitionError::AlreadyTerminal(HostRequestStatus::Failed))
        ));
    }

    #[test]
    fn test_rejects_mismatched_or_unexpected_completion() {
        let mut req = request();
        assert_eq!(
            req.complete(TaskKind::ResourceCreation, TaskOutcome::Success),
            Err(TransitionError::NoTaskInFlight(TaskKind::ResourceCreation))
        );

        req.start_next().unwrap();
        assert_eq!(
            req.complete(TaskKind::Install, TaskOutcome::Success),
            Err(TransitionError::UnexpectedTask {
                expected: TaskKind::ResourceCreation,
                actual: TaskKind::Install
            })
        );
        assert_eq!(req.in_flight().map(|a| a.kind), Some(TaskKind::ResourceCreation));
    }

    #[test]
    fn test_retry_resumes_failed_task_with_new_attempt() {
        let mut req = request();
        req.start_next().unwrap();
        req.complete(TaskKind::ResourceCreation, TaskOutcome::Success).unwrap();
        let first = req.start_next().unwrap();
        req.complete(TaskKind::Configure, TaskOutcome::failure("timeout")).unwrap();

        req.retry().unwrap();
        assert_eq!(req.status(), HostRequestStatus::Pending);
        assert_eq!(req.last_error(), None);

        let second = req.start_next().unwrap();
        assert_eq!(second.kind, TaskKind::Configure);
        assert!(second.attempt > first.attempt);
        assert_eq!(req.retry(), Err(TransitionError::NotFailed(HostRequestStatus::InProgress)));
    }

    #[test]
    fn test_abort_discards_in_flight() {
        let mut req = request();
        req.start_next().unwrap();
        assert!(req.abort("operator abort"));
        assert_eq!(req.status(), HostRequestStatus::Failed);
        assert_eq!(req.in_flight(), None);
        assert!(!req.abort("again"));
        assert_eq!(
            req.last_error(),
            Some(&TaskFailure::Cancelled("operator abort".to_string()))
        );
    }

    #[test]
    fn test_orphaned_cannot_be_retried() {
        let mut req = request();
        req.mark_orphaned(&RecoveryInconsistency {
            host_request_id: 1,
            hostname: "h1".to_string(),
            cluster_id: "c1".to_string(),
        });
        assert_eq!(req.status(), HostRequestStatus::Failed);
        assert_eq!(req.retry(), Err(TransitionError::Orphaned));
    }

    #[test]
    fn test_reset_in_flight_redispatches_same_task() {
        let mut req = request();
        req.start_next().unwrap();
        req.complete(TaskKind::ResourceCreation, TaskOutcome::Success).unwrap();
        req.start_next().unwrap();

        let restored: HostRequest = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        let mut restored = restored;
        assert_eq!(restored.reset_in_flight().map(|a| a.kind), Some(TaskKind::Configure));
        assert_eq!(restored.advance(), Some(TaskKind::Configure));
        assert_eq!(restored.completed_tasks(), [TaskKind::ResourceCreation]);
    }
}
