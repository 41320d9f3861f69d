//! Topology manager
//!
//! Process-wide coordinator of cluster provisioning. It pairs topology
//! submissions with host registrations, creates one [`HostRequest`] per
//! claimed host and drives each through the task pipeline as completions
//! arrive.
//!
//! Locking: every host request sits behind its own mutex, which serializes
//! completions for that host. The shared maps sit behind one `RwLock` that is
//! only held for map updates, never across I/O or while waiting for a host
//! mutex. When both are needed the host mutex is taken first.

mod recovery;
mod registrations;
mod request;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clusterforge_models::{
    HostRequestId, HostRequestStatus, HostRequestSummary, Progress, RequestId, RequestStatus, TaskKind,
    TaskOutcome,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{RegistrationRace, TopologyError};
use crate::host_request::{HostRequest, Transition};
use crate::ports::{
    AgentDispatcher, HostAssignment, HostDirectory, ProgressNotifier, ResourceProvider, TopologyEvent,
    TopologyStore,
};
use crate::tasks::{TaskContext, TopologyTask};
use crate::topology::ClusterTopology;

pub use recovery::RecoveryReport;
pub use request::ClusterRequestRecord;

use registrations::{Claim, PendingRegistrations};
use request::ClusterRequest;

/// External collaborators, handed in once at construction
pub struct Collaborators {
    pub store: Arc<dyn TopologyStore>,
    pub dispatcher: Arc<dyn AgentDispatcher>,
    pub resources: Arc<dyn ResourceProvider>,
    pub directory: Arc<dyn HostDirectory>,
    pub notifier: Arc<dyn ProgressNotifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// A host request was created and its first task dispatched
    Provisioning {
        request_id: RequestId,
        host_request_id: HostRequestId,
    },
    /// Remembered; no active request wants this host yet
    Recorded,
    AlreadyProvisioning {
        request_id: RequestId,
        host_request_id: HostRequestId,
    },
    Discarded(RegistrationRace),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Advanced { next: TaskKind },
    Completed,
    Failed,
    /// The host request was already terminal, e.g. aborted
    Discarded,
}

#[derive(Clone)]
struct HostEntry {
    id: HostRequestId,
    request_id: RequestId,
    topology: Arc<ClusterTopology>,
    request: Arc<Mutex<HostRequest>>,
}

#[derive(Default)]
struct ManagerState {
    requests: HashMap<RequestId, ClusterRequest>,
    /// Latest host request per hostname
    hosts: HashMap<String, HostEntry>,
    registrations: PendingRegistrations,
    /// Latest topology revision per cluster
    topologies: HashMap<String, Arc<ClusterTopology>>,
}

impl ManagerState {
    fn host_status(&self, entry: &HostEntry, hostname: &str) -> Option<HostRequestStatus> {
        self.requests
            .get(&entry.request_id)
            .and_then(|request| request.hosts.get(hostname))
            .map(|snapshot| snapshot.status)
    }

    fn active_request_for(&self, cluster_id: &str) -> Option<RequestId> {
        self.requests
            .values()
            .find(|request| request.cluster_id() == cluster_id && !request.status().is_terminal())
            .map(ClusterRequest::id)
    }

    /// Recompute a request's status; on change returns the new progress.
    /// A finished request keeps its slots: a late host for an open-ended
    /// group still claims one and reopens the request.
    fn refresh(&mut self, request_id: RequestId) -> Option<Progress> {
        let request = self.requests.get_mut(&request_id)?;
        let outstanding = self.registrations.outstanding(request_id);
        request.refresh(outstanding)?;
        Some(request.progress(outstanding))
    }

    /// Reason recorded on the owning request when it was aborted
    fn abort_reason(&self, request_id: RequestId) -> Option<String> {
        self.requests
            .get(&request_id)
            .filter(|request| request.status() == RequestStatus::Aborted)
            .map(|request| {
                request
                    .record
                    .reason
                    .clone()
                    .unwrap_or_else(|| "provisioning request aborted".to_string())
            })
    }
}

pub struct TopologyManager {
    store: Arc<dyn TopologyStore>,
    dispatcher: Arc<dyn AgentDispatcher>,
    resources: Arc<dyn ResourceProvider>,
    directory: Arc<dyn HostDirectory>,
    notifier: Arc<dyn ProgressNotifier>,
    state: RwLock<ManagerState>,
    /// Serializes cluster request saves so the newest record always lands last
    record_writes: Mutex<()>,
    next_host_request_id: AtomicU64,
}

impl TopologyManager {
    pub fn new(collaborators: Collaborators) -> Self {
        // Seeded from the clock so ids stay unique across restarts
        let seed = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(1);
        Self {
            store: collaborators.store,
            dispatcher: collaborators.dispatcher,
            resources: collaborators.resources,
            directory: collaborators.directory,
            notifier: collaborators.notifier,
            state: RwLock::new(ManagerState::default()),
            record_writes: Mutex::new(()),
            next_host_request_id: AtomicU64::new(seed),
        }
    }

    /// Accept a topology and start provisioning every host already
    /// registered against it. Groups still waiting for hosts get a slot.
    pub async fn submit_topology(&self, topology: ClusterTopology) -> Result<RequestId, TopologyError> {
        let cluster_id = topology.cluster_id().to_string();
        let stored_revision = self
            .store
            .load_topology(&cluster_id)
            .await?
            .map(|stored| stored.revision());
        let topology = Arc::new(topology);
        let record = ClusterRequestRecord::new(&topology);
        let request_id = record.id;

        {
            let mut state = self.state.write().await;
            if let Some(active) = state.active_request_for(&cluster_id) {
                return Err(TopologyError::ActiveRequest {
                    cluster_id,
                    request_id: active,
                });
            }
            let current = state
                .topologies
                .get(&cluster_id)
                .map(|known| known.revision())
                .max(stored_revision);
            if let Some(current) = current {
                if topology.revision() <= current {
                    return Err(TopologyError::StaleRevision {
                        cluster_id,
                        submitted: topology.revision(),
                        current,
                    });
                }
            }

            state
                .registrations
                .open_request(&cluster_id, request_id, record.expected.clone());
            state.topologies.insert(cluster_id.clone(), topology.clone());
            state.requests.insert(request_id, ClusterRequest::new(record));
        }

        self.store.save_topology(&topology).await?;
        self.persist_request(request_id).await?;
        info!(
            request_id = %request_id,
            cluster_id = %cluster_id,
            revision = topology.revision(),
            host_groups = topology.host_groups().len(),
            "Provisioning request accepted"
        );

        self.offer_registered_hosts(&cluster_id).await?;
        self.refresh_request(request_id).await?;
        Ok(request_id)
    }

    /// Offer every recorded registration of a cluster to its active request
    /// again, e.g. once the directory has learned new host assignments.
    pub async fn offer_registered_hosts(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<(String, RegistrationOutcome)>, TopologyError> {
        let registered = self.state.read().await.registrations.registered_hosts(cluster_id);
        let mut outcomes = Vec::with_capacity(registered.len());
        for hostname in registered {
            let outcome = self.on_host_registered(&hostname, cluster_id).await?;
            debug!(hostname = %hostname, outcome = ?outcome, "Matched earlier registration");
            outcomes.push((hostname, outcome));
        }
        Ok(outcomes)
    }

    /// React to a host becoming known. Whichever of registration and
    /// submission arrives second creates the host request.
    pub async fn on_host_registered(
        &self,
        hostname: &str,
        cluster_id: &str,
    ) -> Result<RegistrationOutcome, TopologyError> {
        let host_group = match self.directory.resolve(hostname, cluster_id).await {
            HostAssignment::Assigned(group) => group,
            HostAssignment::Unassigned => {
                self.state
                    .write()
                    .await
                    .registrations
                    .record_registration(cluster_id, hostname);
                debug!(hostname = %hostname, cluster_id = %cluster_id, "Host registered without a host group");
                return Ok(RegistrationOutcome::Recorded);
            }
            HostAssignment::UnknownCluster => {
                self.state
                    .write()
                    .await
                    .registrations
                    .forget_registration(cluster_id, hostname);
                let race = RegistrationRace::ClusterGone {
                    hostname: hostname.to_string(),
                    cluster_id: cluster_id.to_string(),
                };
                warn!(error = %race, "Discarding host registration");
                return Ok(RegistrationOutcome::Discarded(race));
            }
        };

        let (entry, mut request) = {
            let mut state = self.state.write().await;
            state.registrations.record_registration(cluster_id, hostname);

            if let Some(existing) = state.hosts.get(hostname) {
                let active = state
                    .host_status(existing, hostname)
                    .map_or(false, |status| !status.is_terminal());
                if active {
                    return Ok(RegistrationOutcome::AlreadyProvisioning {
                        request_id: existing.request_id,
                        host_request_id: existing.id,
                    });
                }
            }

            let request_id = match state.registrations.try_claim(cluster_id, &host_group, hostname) {
                Claim::Claimed(request_id) => request_id,
                Claim::AlreadyClaimed(request_id) => {
                    let host_request_id = state.hosts.get(hostname).map_or(0, |existing| existing.id);
                    return Ok(RegistrationOutcome::AlreadyProvisioning {
                        request_id,
                        host_request_id,
                    });
                }
                Claim::Full(request_id) => {
                    debug!(
                        hostname = %hostname,
                        request_id = %request_id,
                        host_group = %host_group,
                        "Host group already has its target host count"
                    );
                    return Ok(RegistrationOutcome::Recorded);
                }
                Claim::NoRequest => return Ok(RegistrationOutcome::Recorded),
                Claim::UnknownGroup(_) => {
                    state.registrations.forget_registration(cluster_id, hostname);
                    let race = RegistrationRace::UnknownHostGroup {
                        hostname: hostname.to_string(),
                        cluster_id: cluster_id.to_string(),
                        group: host_group,
                    };
                    warn!(error = %race, "Discarding host registration");
                    return Ok(RegistrationOutcome::Discarded(race));
                }
            };

            let Some(topology) = state.topologies.get(cluster_id).cloned() else {
                let race = RegistrationRace::ClusterGone {
                    hostname: hostname.to_string(),
                    cluster_id: cluster_id.to_string(),
                };
                warn!(error = %race, "Discarding host registration");
                return Ok(RegistrationOutcome::Discarded(race));
            };

            let id = self.next_host_request_id.fetch_add(1, Ordering::SeqCst);
            let shared = Arc::new(Mutex::new(HostRequest::new(
                id,
                request_id,
                cluster_id,
                hostname,
                host_group.as_str(),
                topology.revision(),
            )));
            // Not yet visible to anyone else, so this cannot wait
            let guard = shared.clone().lock_owned().await;
            if let Some(cluster_request) = state.requests.get_mut(&request_id) {
                cluster_request.observe(&guard);
            }
            let entry = HostEntry {
                id,
                request_id,
                topology,
                request: shared,
            };
            state.hosts.insert(hostname.to_string(), entry.clone());
            (entry, guard)
        };

        self.store.save_host_request(&request).await?;
        info!(
            hostname = %hostname,
            request_id = %entry.request_id,
            host_request_id = entry.id,
            host_group = %request.host_group(),
            "Host provisioning request created"
        );
        self.publish(&request).await?;
        self.drive(&mut request, &entry.topology).await?;

        Ok(RegistrationOutcome::Provisioning {
            request_id: entry.request_id,
            host_request_id: entry.id,
        })
    }

    /// Apply an agent's completion report and dispatch the next task
    pub async fn on_task_completed(
        &self,
        hostname: &str,
        kind: TaskKind,
        outcome: TaskOutcome,
    ) -> Result<CompletionOutcome, TopologyError> {
        let entry = self.host_entry(hostname).await?;
        let mut request = entry.request.lock().await;

        // The request may be aborted while its hosts are not yet cancelled
        if self.cancel_if_aborted(&mut request).await? {
            debug!(hostname = %hostname, task = %kind, "Discarding completion for aborted request");
            return Ok(CompletionOutcome::Discarded);
        }
        if request.is_terminal() {
            debug!(
                hostname = %hostname,
                task = %kind,
                status = %request.status(),
                "Discarding completion for finished host request"
            );
            return Ok(CompletionOutcome::Discarded);
        }

        let transition = request
            .complete(kind, outcome)
            .map_err(|source| TopologyError::Transition {
                hostname: hostname.to_string(),
                source,
            })?;
        self.store.save_host_request(&request).await?;

        let outcome = match transition {
            Transition::Advanced { next } => {
                info!(hostname = %hostname, task = %kind, next = %next, "Task succeeded");
                self.drive(&mut request, &entry.topology).await?;
                if request.is_terminal() {
                    CompletionOutcome::Failed
                } else {
                    CompletionOutcome::Advanced { next }
                }
            }
            Transition::Completed => {
                info!(hostname = %hostname, request_id = %entry.request_id, "Host provisioning completed");
                self.publish(&request).await?;
                CompletionOutcome::Completed
            }
            Transition::Failed => {
                warn!(
                    hostname = %hostname,
                    task = %kind,
                    error = ?request.last_error().map(ToString::to_string),
                    "Host provisioning failed"
                );
                self.publish(&request).await?;
                CompletionOutcome::Failed
            }
        };
        Ok(outcome)
    }

    pub async fn get_progress(&self, request_id: RequestId) -> Result<Progress, TopologyError> {
        let state = self.state.read().await;
        let request = state
            .requests
            .get(&request_id)
            .ok_or(TopologyError::UnknownRequest(request_id))?;
        Ok(request.progress(state.registrations.outstanding(request_id)))
    }

    /// Progress of every request still held in memory, oldest first
    pub async fn list_requests(&self) -> Vec<Progress> {
        let state = self.state.read().await;
        let mut requests: Vec<&ClusterRequest> = state.requests.values().collect();
        requests.sort_by_key(|request| request.record.created_at);
        requests
            .into_iter()
            .map(|request| request.progress(state.registrations.outstanding(request.id())))
            .collect()
    }

    /// Latest host request of a host
    pub async fn host_request(&self, hostname: &str) -> Result<HostRequestSummary, TopologyError> {
        let entry = self.host_entry(hostname).await?;
        let request = entry.request.lock().await;
        Ok(request.summary())
    }

    /// Every host request of a cluster request, read from the store
    pub async fn host_requests(&self, request_id: RequestId) -> Result<Vec<HostRequestSummary>, TopologyError> {
        if !self.state.read().await.requests.contains_key(&request_id) {
            return Err(TopologyError::UnknownRequest(request_id));
        }
        let requests = self.store.load_host_requests(request_id).await?;
        Ok(requests.iter().map(HostRequest::summary).collect())
    }

    /// Latest topology revision of a cluster
    pub async fn topology(&self, cluster_id: &str) -> Result<Option<ClusterTopology>, TopologyError> {
        if let Some(topology) = self.state.read().await.topologies.get(cluster_id) {
            return Ok(Some(topology.as_ref().clone()));
        }
        Ok(self.store.load_topology(cluster_id).await?)
    }

    /// Latest topology of every cluster known in memory, e.g. after recovery
    pub async fn topologies(&self) -> Vec<ClusterTopology> {
        let state = self.state.read().await;
        let mut topologies: Vec<ClusterTopology> =
            state.topologies.values().map(|topology| topology.as_ref().clone()).collect();
        topologies.sort_by(|a, b| a.cluster_id().cmp(b.cluster_id()));
        topologies
    }

    /// Fail every non-terminal host request of a cluster request. Tasks
    /// already in flight are not rolled back; their outcomes are discarded.
    pub async fn abort_request(&self, request_id: RequestId, reason: &str) -> Result<Progress, TopologyError> {
        let hosts: Vec<Arc<Mutex<HostRequest>>> = {
            let mut state = self.state.write().await;
            let outstanding = state.registrations.outstanding(request_id);
            let request = state
                .requests
                .get_mut(&request_id)
                .ok_or(TopologyError::UnknownRequest(request_id))?;
            if request.status().is_terminal() {
                return Ok(request.progress(outstanding));
            }
            request
                .record
                .set_status(RequestStatus::Aborted, Some(reason.to_string()));
            state.registrations.close_request(request_id);
            state
                .hosts
                .values()
                .filter(|entry| entry.request_id == request_id)
                .map(|entry| entry.request.clone())
                .collect()
        };

        self.persist_request(request_id).await?;
        warn!(request_id = %request_id, reason = %reason, "Provisioning request aborted");

        for host in hosts {
            let mut request = host.lock().await;
            if request.abort(reason) {
                self.store.save_host_request(&request).await?;
                self.publish(&request).await?;
            }
        }

        let progress = self.get_progress(request_id).await?;
        self.notifier
            .notify(TopologyEvent::RequestFinished(progress.clone()));
        Ok(progress)
    }

    /// Return a failed host request to PENDING and dispatch the failed task
    /// again under a new attempt.
    pub async fn retry_host(&self, hostname: &str) -> Result<HostRequestSummary, TopologyError> {
        let entry = {
            let state = self.state.read().await;
            let entry = state
                .hosts
                .get(hostname)
                .cloned()
                .ok_or_else(|| TopologyError::UnknownHost(hostname.to_string()))?;
            let status = state.requests.get(&entry.request_id).map(ClusterRequest::status);
            if status == Some(RequestStatus::Aborted) {
                return Err(TopologyError::RequestAborted(entry.request_id));
            }
            let cluster_id = entry.topology.cluster_id();
            if let Some(current) = state.topologies.get(cluster_id) {
                if current.revision() != entry.topology.revision() {
                    return Err(TopologyError::StaleRevision {
                        cluster_id: cluster_id.to_string(),
                        submitted: entry.topology.revision(),
                        current: current.revision(),
                    });
                }
            }
            entry
        };

        let mut request = entry.request.lock().await;
        request.retry().map_err(|source| TopologyError::Transition {
            hostname: hostname.to_string(),
            source,
        })?;
        self.store.save_host_request(&request).await?;
        info!(hostname = %hostname, request_id = %entry.request_id, "Retrying host provisioning");

        self.publish(&request).await?;
        self.drive(&mut request, &entry.topology).await?;
        Ok(request.summary())
    }

    /// Drop a finished request and its host requests from memory. Durable
    /// records are kept.
    pub async fn purge_request(&self, request_id: RequestId) -> Result<(), TopologyError> {
        let mut state = self.state.write().await;
        let request = state
            .requests
            .get(&request_id)
            .ok_or(TopologyError::UnknownRequest(request_id))?;
        if !request.status().is_terminal() {
            return Err(TopologyError::RequestActive(request_id));
        }

        state.requests.remove(&request_id);
        state.hosts.retain(|_, entry| entry.request_id != request_id);
        state.registrations.close_request(request_id);
        info!(request_id = %request_id, "Provisioning request purged");
        Ok(())
    }

    async fn host_entry(&self, hostname: &str) -> Result<HostEntry, TopologyError> {
        self.state
            .read()
            .await
            .hosts
            .get(hostname)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownHost(hostname.to_string()))
    }

    /// Dispatch the request's next task, if any. The in-flight attempt is
    /// saved before the task runs.
    async fn drive(&self, request: &mut HostRequest, topology: &ClusterTopology) -> Result<(), TopologyError> {
        if self.cancel_if_aborted(request).await? {
            return Ok(());
        }
        let Ok(attempt) = request.start_next() else {
            return Ok(());
        };
        self.store.save_host_request(request).await?;

        let task = TopologyTask::for_kind(attempt.kind);
        let result = {
            let ctx = TaskContext {
                topology,
                request: &*request,
                attempt,
                resources: self.resources.as_ref(),
                dispatcher: self.dispatcher.as_ref(),
            };
            task.run(&ctx).await
        };

        match result {
            Ok(handle) => {
                info!(
                    hostname = %request.hostname(),
                    task = %attempt.kind,
                    attempt = attempt.attempt,
                    handle = %handle,
                    "Task dispatched"
                );
            }
            Err(failure) => {
                warn!(
                    hostname = %request.hostname(),
                    task = %attempt.kind,
                    error = %failure,
                    "Task failed before reaching the agent"
                );
                let hostname = request.hostname().to_string();
                request
                    .fail(failure)
                    .map_err(|source| TopologyError::Transition { hostname, source })?;
                self.store.save_host_request(request).await?;
            }
        }

        self.publish(request).await
    }

    /// Cancel a host request whose cluster request was aborted. Returns
    /// whether the owning request is aborted.
    async fn cancel_if_aborted(&self, request: &mut HostRequest) -> Result<bool, TopologyError> {
        let Some(reason) = self.state.read().await.abort_reason(request.request_id()) else {
            return Ok(false);
        };
        if request.abort(&reason) {
            self.store.save_host_request(request).await?;
            self.publish(request).await?;
        }
        Ok(true)
    }

    /// Fold a host request's new state into its cluster request and notify
    async fn publish(&self, request: &HostRequest) -> Result<(), TopologyError> {
        let changed = {
            let mut state = self.state.write().await;
            let observed = match state.requests.get_mut(&request.request_id()) {
                Some(cluster_request) => {
                    cluster_request.observe(request);
                    true
                }
                None => false,
            };
            if observed {
                state.refresh(request.request_id())
            } else {
                None
            }
        };
        self.notifier
            .notify(TopologyEvent::HostRequestUpdated(request.summary()));
        self.announce(changed).await
    }

    async fn refresh_request(&self, request_id: RequestId) -> Result<(), TopologyError> {
        let changed = self.state.write().await.refresh(request_id);
        self.announce(changed).await
    }

    async fn announce(&self, changed: Option<Progress>) -> Result<(), TopologyError> {
        let Some(progress) = changed else {
            return Ok(());
        };
        self.persist_request(progress.request_id).await?;

        if progress.status.is_terminal() {
            info!(
                request_id = %progress.request_id,
                cluster_id = %progress.cluster_id,
                status = %progress.status,
                completed = progress.completed,
                failed = progress.failed,
                "Provisioning request finished"
            );
            self.notifier.notify(TopologyEvent::RequestFinished(progress));
        } else {
            debug!(request_id = %progress.request_id, status = %progress.status, "Provisioning request status changed");
        }
        Ok(())
    }

    async fn persist_request(&self, request_id: RequestId) -> Result<(), TopologyError> {
        let _writes = self.record_writes.lock().await;
        let record = self
            .state
            .read()
            .await
            .requests
            .get(&request_id)
            .map(|request| request.record.clone());
        if let Some(record) = record {
            self.store.save_cluster_request(&record).await?;
        }
        Ok(())
    }
}
