//! Startup recovery
//!
//! Rebuilds in-memory state from the store and re-dispatches the next task
//! of every non-terminal host request. Re-dispatch is safe because tasks are
//! idempotent per attempt and resource creation tolerates existing records.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use clusterforge_models::{RequestId, RequestStatus};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::request::{ClusterRequest, ClusterRequestRecord};
use super::{HostEntry, TopologyManager};
use crate::error::{RecoveryInconsistency, TopologyError};
use crate::host_request::HostRequest;
use crate::ports::TopologyEvent;
use crate::topology::ClusterTopology;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Cluster requests restored into memory
    pub requests: usize,
    pub redispatched: usize,
    /// Host requests failed because their topology is gone
    pub orphaned: usize,
}

type Redispatch = (Arc<Mutex<HostRequest>>, Arc<ClusterTopology>);

impl TopologyManager {
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport, TopologyError> {
        let mut records: BTreeMap<RequestId, ClusterRequestRecord> = self
            .store
            .load_open_cluster_requests()
            .await?
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
        let open_hosts = self.store.load_non_terminal_host_requests().await?;

        let request_ids: BTreeSet<RequestId> = records
            .keys()
            .copied()
            .chain(open_hosts.iter().map(HostRequest::request_id))
            .collect();

        let mut report = RecoveryReport::default();
        let mut redispatch: Vec<Redispatch> = Vec::new();
        let mut restored = Vec::new();
        let mut max_id = 0;

        for request_id in request_ids {
            if self.state.read().await.requests.contains_key(&request_id) {
                continue;
            }
            let hosts = self.store.load_host_requests(request_id).await?;
            max_id = hosts.iter().map(HostRequest::id).fold(max_id, u64::max);

            let record = records.remove(&request_id);
            let Some(cluster_id) = record
                .as_ref()
                .map(|record| record.cluster_id.clone())
                .or_else(|| hosts.first().map(|host| host.cluster_id().to_string()))
            else {
                continue;
            };

            match self.store.load_topology(&cluster_id).await? {
                Some(topology) => {
                    let record = record.unwrap_or_else(|| adopted_record(request_id, &topology, &hosts));
                    let topology = Arc::new(topology);
                    redispatch.extend(self.restore(record, topology, hosts).await);
                    restored.push(request_id);
                }
                None => {
                    let record = record.unwrap_or_else(|| orphan_record(request_id, &cluster_id, &hosts));
                    report.orphaned += self.orphan(record, hosts).await?;
                }
            }
            report.requests += 1;
        }

        self.next_host_request_id
            .fetch_max(max_id.saturating_add(1), Ordering::SeqCst);

        let results = join_all(redispatch.into_iter().map(|(shared, topology)| async move {
            let mut request = shared.lock().await;
            if let Some(previous) = request.reset_in_flight() {
                info!(
                    hostname = %request.hostname(),
                    task = %previous.kind,
                    attempt = previous.attempt,
                    "Re-dispatching unconfirmed task"
                );
            }
            self.drive(&mut request, &topology).await
        }))
        .await;
        for result in results {
            result?;
            report.redispatched += 1;
        }

        for request_id in restored {
            self.refresh_request(request_id).await?;
        }

        info!(
            requests = report.requests,
            redispatched = report.redispatched,
            orphaned = report.orphaned,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Put a request and its hosts back into memory; returns the hosts to re-dispatch
    async fn restore(
        &self,
        record: ClusterRequestRecord,
        topology: Arc<ClusterTopology>,
        hosts: Vec<HostRequest>,
    ) -> Vec<Redispatch> {
        let request_id = record.id;
        let cluster_id = record.cluster_id.clone();
        let mut cluster_request = ClusterRequest::new(record);
        let mut redispatch = Vec::new();

        let mut state = self.state.write().await;
        state
            .registrations
            .open_request(&cluster_id, request_id, cluster_request.record.expected.clone());

        for host in hosts {
            let hostname = host.hostname().to_string();
            state.registrations.record_registration(&cluster_id, &hostname);
            state
                .registrations
                .try_claim(&cluster_id, host.host_group(), &hostname);
            cluster_request.observe(&host);

            let active = !host.is_terminal();
            let entry = HostEntry {
                id: host.id(),
                request_id,
                topology: topology.clone(),
                request: Arc::new(Mutex::new(host)),
            };
            if active {
                redispatch.push((entry.request.clone(), topology.clone()));
            }
            if active || !state.hosts.contains_key(&hostname) {
                state.hosts.insert(hostname, entry);
            }
        }

        let newer = state
            .topologies
            .get(&cluster_id)
            .map_or(true, |known| known.revision() <= topology.revision());
        if newer {
            state.topologies.insert(cluster_id, topology);
        }
        state.requests.insert(request_id, cluster_request);
        redispatch
    }

    /// Fail every open host of a request whose topology is gone; returns how many
    async fn orphan(&self, mut record: ClusterRequestRecord, hosts: Vec<HostRequest>) -> Result<usize, TopologyError> {
        let mut cluster_request_hosts = Vec::with_capacity(hosts.len());
        let mut orphaned = 0;

        for mut host in hosts {
            if !host.is_terminal() {
                let inconsistency = RecoveryInconsistency {
                    host_request_id: host.id(),
                    hostname: host.hostname().to_string(),
                    cluster_id: host.cluster_id().to_string(),
                };
                error!(error = %inconsistency, "Marking host request orphaned");
                host.mark_orphaned(&inconsistency);
                self.store.save_host_request(&host).await?;
                self.notifier
                    .notify(TopologyEvent::HostRequestUpdated(host.summary()));
                orphaned += 1;
            }
            cluster_request_hosts.push(host);
        }

        let reason = format!("topology of cluster '{}' no longer exists", record.cluster_id);
        record.set_status(RequestStatus::Failed, Some(reason));
        let request_id = record.id;
        let mut cluster_request = ClusterRequest::new(record);
        for host in &cluster_request_hosts {
            cluster_request.observe(host);
        }
        let progress = cluster_request.progress(0);
        self.state.write().await.requests.insert(request_id, cluster_request);

        self.persist_request(request_id).await?;
        self.notifier.notify(TopologyEvent::RequestFinished(progress));
        Ok(orphaned)
    }
}

/// Record for host requests whose cluster request was never persisted
fn adopted_record(request_id: RequestId, topology: &ClusterTopology, hosts: &[HostRequest]) -> ClusterRequestRecord {
    let mut record = ClusterRequestRecord::new(topology);
    record.id = request_id;
    record.status = RequestStatus::InProgress;
    if let Some(first) = hosts.first() {
        record.topology_revision = first.topology_revision();
    }
    record
}

fn orphan_record(request_id: RequestId, cluster_id: &str, hosts: &[HostRequest]) -> ClusterRequestRecord {
    let now = Utc::now();
    ClusterRequestRecord {
        id: request_id,
        cluster_id: cluster_id.to_string(),
        topology_revision: hosts.first().map_or(0, HostRequest::topology_revision),
        status: RequestStatus::InProgress,
        expected: BTreeMap::new(),
        reason: None,
        created_at: now,
        updated_at: now,
    }
}
