//! Cluster provisioning requests: the durable record and its in-memory view

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clusterforge_models::{HostRequestStatus, Progress, RequestId, RequestStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::host_request::HostRequest;
use crate::topology::ClusterTopology;

/// Persisted form of one cluster provisioning request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRequestRecord {
    pub id: RequestId,
    pub cluster_id: String,
    pub topology_revision: u32,
    pub status: RequestStatus,
    /// Target host count per group, `None` for open-ended groups
    pub expected: BTreeMap<String, Option<u32>>,
    /// Abort or orphan reason
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterRequestRecord {
    pub fn new(topology: &ClusterTopology) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cluster_id: topology.cluster_id().to_string(),
            topology_revision: topology.revision(),
            status: RequestStatus::Pending,
            expected: topology
                .host_groups()
                .iter()
                .map(|group| (group.name().to_string(), group.host_count()))
                .collect(),
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_status(&mut self, status: RequestStatus, reason: Option<String>) {
        self.status = status;
        if reason.is_some() {
            self.reason = reason;
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HostSnapshot {
    pub status: HostRequestStatus,
}

/// A cluster request plus the last observed status of each of its hosts.
/// Progress queries read only this, never the host requests themselves.
#[derive(Debug, Clone)]
pub(crate) struct ClusterRequest {
    pub record: ClusterRequestRecord,
    pub hosts: BTreeMap<String, HostSnapshot>,
}

impl ClusterRequest {
    pub fn new(record: ClusterRequestRecord) -> Self {
        Self {
            record,
            hosts: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.record.id
    }

    pub fn cluster_id(&self) -> &str {
        &self.record.cluster_id
    }

    pub fn status(&self) -> RequestStatus {
        self.record.status
    }

    pub fn observe(&mut self, request: &HostRequest) {
        self.hosts.insert(
            request.hostname().to_string(),
            HostSnapshot {
                status: request.status(),
            },
        );
    }

    fn count(&self, status: HostRequestStatus) -> usize {
        self.hosts.values().filter(|h| h.status == status).count()
    }

    fn has_open_ended_group(&self) -> bool {
        self.record.expected.values().any(Option::is_none)
    }

    /// Every bounded slot is filled and every host is terminal. A request
    /// whose groups are all open-ended waits for at least one host.
    fn is_finished(&self, outstanding: u32) -> bool {
        if outstanding > 0 {
            return false;
        }
        if self.hosts.is_empty() {
            return !self.has_open_ended_group();
        }
        self.hosts.values().all(|h| h.status.is_terminal())
    }

    /// Recompute the request status from its hosts. Returns the new status
    /// when it changed. Aborted requests never change.
    pub fn refresh(&mut self, outstanding: u32) -> Option<RequestStatus> {
        let current = self.record.status;
        if current == RequestStatus::Aborted {
            return None;
        }

        let next = if self.is_finished(outstanding) {
            if self.count(HostRequestStatus::Failed) > 0 {
                RequestStatus::Failed
            } else {
                RequestStatus::Completed
            }
        } else if current == RequestStatus::Pending
            && self.hosts.values().all(|h| h.status == HostRequestStatus::Pending)
        {
            RequestStatus::Pending
        } else {
            RequestStatus::InProgress
        };

        if next == current {
            return None;
        }
        self.record.set_status(next, None);
        Some(next)
    }

    pub fn progress(&self, outstanding: u32) -> Progress {
        Progress {
            request_id: self.record.id,
            cluster_id: self.record.cluster_id.clone(),
            status: self.record.status,
            total: self.hosts.len(),
            pending: self.count(HostRequestStatus::Pending),
            in_progress: self.count(HostRequestStatus::InProgress),
            completed: self.count(HostRequestStatus::Completed),
            failed: self.count(HostRequestStatus::Failed),
            outstanding_hosts: outstanding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterforge_models::{TaskKind, TaskOutcome};

    fn request(expected: &[(&str, Option<u32>)]) -> ClusterRequest {
        let now = Utc::now();
        ClusterRequest::new(ClusterRequestRecord {
            id: Uuid::new_v4(),
            cluster_id: "c1".to_string(),
            topology_revision: 1,
            status: RequestStatus::Pending,
            expected: expected
                .iter()
                .map(|(name, count)| (name.to_string(), *count))
                .collect(),
            reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn host(id: u64, hostname: &str) -> HostRequest {
        HostRequest::new(id, Uuid::nil(), "c1", hostname, "master", 1)
    }

    #[test]
    fn test_refresh_follows_hosts() {
        let mut cluster = request(&[("master", Some(1))]);
        let mut h1 = host(1, "h1");

        assert_eq!(cluster.refresh(1), None);
        cluster.observe(&h1);
        assert_eq!(cluster.refresh(0), None);

        h1.start_next().unwrap();
        cluster.observe(&h1);
        assert_eq!(cluster.refresh(0), Some(RequestStatus::InProgress));

        h1.complete(TaskKind::ResourceCreation, TaskOutcome::failure("quota")).unwrap();
        cluster.observe(&h1);
        assert_eq!(cluster.refresh(0), Some(RequestStatus::Failed));

        let progress = cluster.progress(0);
        assert_eq!(progress.total, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.status, RequestStatus::Failed);

        // A retried host reopens the request
        h1.retry().unwrap();
        cluster.observe(&h1);
        assert_eq!(cluster.refresh(0), Some(RequestStatus::InProgress));
    }

    #[test]
    fn test_outstanding_slots_block_completion() {
        let mut cluster = request(&[("master", Some(2))]);
        let mut h1 = host(1, "h1");
        h1.abort("stop");
        cluster.observe(&h1);
        assert_eq!(cluster.refresh(1), Some(RequestStatus::InProgress));
        assert_eq!(cluster.refresh(0), Some(RequestStatus::Failed));
    }

    #[test]
    fn test_open_ended_request_waits_for_a_host() {
        let mut cluster = request(&[("worker", None)]);
        assert_eq!(cluster.refresh(0), None);

        let mut empty = request(&[("master", Some(0))]);
        assert_eq!(empty.refresh(0), Some(RequestStatus::Completed));
    }

    #[test]
    fn test_aborted_request_is_frozen() {
        let mut cluster = request(&[("master", Some(1))]);
        cluster.record.set_status(RequestStatus::Aborted, Some("operator".to_string()));
        cluster.observe(&host(1, "h1"));
        assert_eq!(cluster.refresh(0), None);
        assert_eq!(cluster.record.reason.as_deref(), Some("operator"));
    }
}
