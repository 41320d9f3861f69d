//! Boundary contracts to the collaborators the engine drives
//!
//! The engine never owns persistence, agent transport, host-to-group
//! assignment or the operator-facing resource layer; it talks to them through
//! these traits. Implementations live in [`crate::adapters`].

use async_trait::async_trait;
use clusterforge_models::{
    HostRequestId, HostRequestSummary, Progress, RequestId, ServiceComponent, TaskKind, TaskParameters,
};

use crate::error::{DispatchError, StoreError};
use crate::host_request::HostRequest;
use crate::manager::ClusterRequestRecord;
use crate::topology::ClusterTopology;

/// Durable state of the engine. Must give read-your-writes within one process.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn save_host_request(&self, request: &HostRequest) -> Result<(), StoreError>;

    async fn load_non_terminal_host_requests(&self) -> Result<Vec<HostRequest>, StoreError>;

    /// Every host request of one cluster request, terminal or not
    async fn load_host_requests(&self, request_id: RequestId) -> Result<Vec<HostRequest>, StoreError>;

    async fn save_topology(&self, topology: &ClusterTopology) -> Result<(), StoreError>;

    /// Latest revision of the cluster's topology
    async fn load_topology(&self, cluster_id: &str) -> Result<Option<ClusterTopology>, StoreError>;

    async fn save_cluster_request(&self, request: &ClusterRequestRecord) -> Result<(), StoreError>;

    async fn load_open_cluster_requests(&self) -> Result<Vec<ClusterRequestRecord>, StoreError>;
}

/// Outcome of materializing per-host component records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCreation {
    pub created: usize,
    /// Records that were already present; not an error
    pub existing: usize,
}

/// The resource layer that owns durable host/component records
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create_host_resources(
        &self,
        cluster_id: &str,
        hostname: &str,
        components: &[ServiceComponent],
    ) -> Result<ResourceCreation, StoreError>;
}

/// Everything an agent needs to execute one task attempt
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub request_id: RequestId,
    pub host_request_id: HostRequestId,
    pub hostname: String,
    pub kind: TaskKind,
    pub attempt: u32,
    pub parameters: TaskParameters,
}

/// Opaque reference to dispatched work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchHandle(pub String);

impl std::fmt::Display for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fire-and-forget submission of work to the agent on a host. Completion
/// arrives later through [`crate::TopologyManager::on_task_completed`].
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchHandle, DispatchError>;
}

/// Answer of the external host directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAssignment {
    Assigned(String),
    /// Host belongs to the cluster but no group claims it
    Unassigned,
    /// The cluster itself is unknown, e.g. deleted mid-registration
    UnknownCluster,
}

#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn resolve(&self, hostname: &str, cluster_id: &str) -> HostAssignment;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    HostRequestUpdated(HostRequestSummary),
    RequestFinished(Progress),
}

/// Sink for progress events consumed by the resource-provider layer
pub trait ProgressNotifier: Send + Sync {
    fn notify(&self, event: TopologyEvent);
}
