//! Error types for the topology engine

use clusterforge_models::{HostRequestId, HostRequestStatus, RequestId, TaskKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One structural problem found while building a topology
#[derive(Debug, Clone, Error, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Violation {
    #[error("cluster id must not be empty")]
    EmptyClusterId,

    #[error("cluster template targets blueprint '{template}' but blueprint is '{blueprint}'")]
    BlueprintMismatch { template: String, blueprint: String },

    #[error("topology for cluster '{actual}' cannot replace topology of cluster '{expected}'")]
    ClusterMismatch { expected: String, actual: String },

    #[error("duplicate service '{0}'")]
    DuplicateService(String),

    #[error("duplicate host group '{0}'")]
    DuplicateHostGroup(String),

    #[error("host group '{group}' references unknown service '{service}'")]
    UnknownService { group: String, service: String },

    #[error("host group '{group}' references component '{component}' which service '{service}' does not provide")]
    UnknownComponent {
        group: String,
        service: String,
        component: String,
    },

    #[error("host group '{group}' inherits configuration from unknown host group '{parent}'")]
    UnknownParent { group: String, parent: String },

    #[error("configuration inheritance cycle: {}", .0.join(" -> "))]
    ConfigCycle(Vec<String>),

    #[error("cluster template references unknown host group '{0}'")]
    UnknownTemplateGroup(String),

    #[error("cluster template lists host group '{0}' more than once")]
    DuplicateTemplateGroup(String),
}

/// Every violation found in a blueprint/template pair
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid topology ({} violation(s)): {}", .violations.len(), join(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a provisioning task did not succeed
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskFailure {
    #[error("resource creation rejected: {0}")]
    ResourceCreation(String),

    #[error("dispatch rejected: {0}")]
    Dispatch(String),

    #[error("{kind} task failed on host: {message}")]
    Reported { kind: TaskKind, message: String },

    #[error("host group '{0}' is not part of the cluster topology")]
    MissingHostGroup(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("orphaned: {0}")]
    Orphaned(String),
}

/// A registration that refers to a cluster or group that no longer exists
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationRace {
    #[error("host '{hostname}' registered for cluster '{cluster_id}' which no longer exists")]
    ClusterGone { hostname: String, cluster_id: String },

    #[error("host '{hostname}' is assigned to host group '{group}' which the topology of cluster '{cluster_id}' does not define")]
    UnknownHostGroup {
        hostname: String,
        cluster_id: String,
        group: String,
    },
}

/// Persisted host request whose topology has disappeared
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("host request {host_request_id} for '{hostname}' references missing topology of cluster '{cluster_id}'")]
pub struct RecoveryInconsistency {
    pub host_request_id: HostRequestId,
    pub hostname: String,
    pub cluster_id: String,
}

/// Failure of a persistence or resource adapter
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record rejected: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("dispatch of {kind} to '{hostname}' failed: {reason}")]
pub struct DispatchError {
    pub hostname: String,
    pub kind: TaskKind,
    pub reason: String,
}

/// Illegal host request state transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("request is already {0}")]
    AlreadyTerminal(HostRequestStatus),

    #[error("no task is ready to dispatch")]
    NothingToDispatch,

    #[error("completion for {0} received but no task is in flight")]
    NoTaskInFlight(TaskKind),

    #[error("completion for {actual} received while {expected} is in flight")]
    UnexpectedTask { expected: TaskKind, actual: TaskKind },

    #[error("only failed requests can be retried (status {0})")]
    NotFailed(HostRequestStatus),

    #[error("orphaned requests cannot be retried")]
    Orphaned,
}

/// Errors surfaced by [`crate::TopologyManager`]
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Durable state cannot be read or written; the manager cannot continue safely
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("unknown provisioning request {0}")]
    UnknownRequest(RequestId),

    #[error("no host provisioning request for '{0}'")]
    UnknownHost(String),

    #[error("cluster '{cluster_id}' already has active provisioning request {request_id}")]
    ActiveRequest {
        cluster_id: String,
        request_id: RequestId,
    },

    #[error("topology revision {submitted} of cluster '{cluster_id}' is not newer than revision {current}")]
    StaleRevision {
        cluster_id: String,
        submitted: u32,
        current: u32,
    },

    #[error("provisioning request {0} is still active")]
    RequestActive(RequestId),

    #[error("provisioning request {0} was aborted")]
    RequestAborted(RequestId),

    #[error("host '{hostname}': {source}")]
    Transition {
        hostname: String,
        #[source]
        source: TransitionError,
    },
}

impl TopologyError {
    /// Whether the manager's durable state can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, TopologyError::Persistence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_violation() {
        let err = ValidationError {
            violations: vec![
                Violation::DuplicateHostGroup("master".to_string()),
                Violation::ConfigCycle(vec!["a".to_string(), "b".to_string(), "a".to_string()]),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("2 violation(s)"));
        assert!(message.contains("duplicate host group 'master'"));
        assert!(message.contains("a -> b -> a"));
    }

    #[test]
    fn test_only_persistence_is_fatal() {
        assert!(TopologyError::Persistence(StoreError::Unavailable("down".to_string())).is_fatal());
        assert!(!TopologyError::UnknownHost("h1".to_string()).is_fatal());
    }
}
