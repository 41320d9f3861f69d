use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use clusterforge_models::{HostRequestId, RequestId, ServiceComponent};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::host_request::HostRequest;
use crate::manager::ClusterRequestRecord;
use crate::ports::{HostAssignment, HostDirectory, ResourceCreation, ResourceProvider, TopologyStore};
use crate::topology::ClusterTopology;

/// Process-local store. Clones of the `Arc` share state, which lets tests
/// "restart" a manager over the same records.
#[derive(Default)]
pub struct InMemoryTopologyStore {
    host_requests: RwLock<HashMap<HostRequestId, HostRequest>>,
    topologies: RwLock<HashMap<String, ClusterTopology>>,
    cluster_requests: RwLock<HashMap<RequestId, ClusterRequestRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, simulating a lost database
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn host_request(&self, id: HostRequestId) -> Option<HostRequest> {
        self.host_requests.read().await.get(&id).cloned()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TopologyStore for InMemoryTopologyStore {
    async fn save_host_request(&self, request: &HostRequest) -> Result<(), StoreError> {
        self.check()?;
        self.host_requests
            .write()
            .await
            .insert(request.id(), request.clone());
        Ok(())
    }

    async fn load_non_terminal_host_requests(&self) -> Result<Vec<HostRequest>, StoreError> {
        self.check()?;
        let mut requests: Vec<HostRequest> = self
            .host_requests
            .read()
            .await
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        requests.sort_by_key(HostRequest::id);
        Ok(requests)
    }

    async fn load_host_requests(&self, request_id: RequestId) -> Result<Vec<HostRequest>, StoreError> {
        self.check()?;
        let mut requests: Vec<HostRequest> = self
            .host_requests
            .read()
            .await
            .values()
            .filter(|r| r.request_id() == request_id)
            .cloned()
            .collect();
        requests.sort_by_key(HostRequest::id);
        Ok(requests)
    }

    async fn save_topology(&self, topology: &ClusterTopology) -> Result<(), StoreError> {
        self.check()?;
        let mut topologies = self.topologies.write().await;
        let newer = topologies
            .get(topology.cluster_id())
            .map_or(true, |current| current.revision() <= topology.revision());
        if newer {
            topologies.insert(topology.cluster_id().to_string(), topology.clone());
        }
        Ok(())
    }

    async fn load_topology(&self, cluster_id: &str) -> Result<Option<ClusterTopology>, StoreError> {
        self.check()?;
        Ok(self.topologies.read().await.get(cluster_id).cloned())
    }

    async fn save_cluster_request(&self, request: &ClusterRequestRecord) -> Result<(), StoreError> {
        self.check()?;
        self.cluster_requests
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn load_open_cluster_requests(&self) -> Result<Vec<ClusterRequestRecord>, StoreError> {
        self.check()?;
        let mut requests: Vec<ClusterRequestRecord> = self
            .cluster_requests
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }
}

/// Component records keyed by (cluster, host, service, component)
#[derive(Default)]
pub struct InMemoryResourceProvider {
    records: RwLock<BTreeSet<(String, String, ServiceComponent)>>,
}

impl InMemoryResourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self, cluster_id: &str, hostname: &str) -> Vec<ServiceComponent> {
        self.records
            .read()
            .await
            .iter()
            .filter(|(c, h, _)| c == cluster_id && h == hostname)
            .map(|(_, _, sc)| sc.clone())
            .collect()
    }

    pub async fn total_records(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ResourceProvider for InMemoryResourceProvider {
    async fn create_host_resources(
        &self,
        cluster_id: &str,
        hostname: &str,
        components: &[ServiceComponent],
    ) -> Result<ResourceCreation, StoreError> {
        let mut records = self.records.write().await;
        let mut outcome = ResourceCreation::default();
        for sc in components {
            if records.insert((cluster_id.to_string(), hostname.to_string(), sc.clone())) {
                outcome.created += 1;
            } else {
                outcome.existing += 1;
            }
        }
        Ok(outcome)
    }
}

/// Host-to-group assignments maintained by the surrounding service
#[derive(Default)]
pub struct StaticHostDirectory {
    clusters: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl StaticHostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_cluster(&self, cluster_id: &str) {
        self.clusters
            .write()
            .await
            .entry(cluster_id.to_string())
            .or_default();
    }

    pub async fn remove_cluster(&self, cluster_id: &str) {
        self.clusters.write().await.remove(cluster_id);
    }

    /// Assign a host to a group, creating the cluster entry if needed
    pub async fn assign(&self, cluster_id: &str, hostname: &str, host_group: &str) {
        self.clusters
            .write()
            .await
            .entry(cluster_id.to_string())
            .or_default()
            .insert(hostname.to_string(), host_group.to_string());
    }
}

#[async_trait]
impl HostDirectory for StaticHostDirectory {
    async fn resolve(&self, hostname: &str, cluster_id: &str) -> HostAssignment {
        match self.clusters.read().await.get(cluster_id) {
            None => HostAssignment::UnknownCluster,
            Some(hosts) => match hosts.get(hostname) {
                Some(group) => HostAssignment::Assigned(group.clone()),
                None => HostAssignment::Unassigned,
            },
        }
    }
}
