use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flat `config-type/property` -> value configuration
pub type PropertyMap = BTreeMap<String, String>;

/// Identifier of a cluster-provisioning request
pub type RequestId = Uuid;

/// Identifier of a single host provisioning request
pub type HostRequestId = u64;

/// Status of a single host provisioning request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "host_request_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl HostRequestStatus {
    pub const ALL: [HostRequestStatus; 4] = [
        HostRequestStatus::Pending,
        HostRequestStatus::InProgress,
        HostRequestStatus::Completed,
        HostRequestStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, HostRequestStatus::Completed | HostRequestStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostRequestStatus::Pending => "PENDING",
            HostRequestStatus::InProgress => "IN_PROGRESS",
            HostRequestStatus::Completed => "COMPLETED",
            HostRequestStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for HostRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a whole cluster-provisioning request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Waiting for expected hosts, nothing dispatched yet
    Pending,
    InProgress,
    Completed,
    /// Finished with at least one failed host
    Failed,
    Aborted,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Aborted
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Provisioning task kinds, in pipeline order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ResourceCreation,
    Configure,
    Install,
    Start,
}

impl TaskKind {
    /// The fixed per-host pipeline. Resource records must exist before any
    /// later step reads them back.
    pub const PIPELINE: [TaskKind; 4] = [
        TaskKind::ResourceCreation,
        TaskKind::Configure,
        TaskKind::Install,
        TaskKind::Start,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::ResourceCreation => "resource-creation",
            TaskKind::Configure => "configure",
            TaskKind::Install => "install",
            TaskKind::Start => "start",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource-creation" | "resource_creation" | "RESOURCE_CREATION" => Ok(TaskKind::ResourceCreation),
            "configure" | "CONFIGURE" => Ok(TaskKind::Configure),
            "install" | "INSTALL" => Ok(TaskKind::Install),
            "start" | "START" => Ok(TaskKind::Start),
            other => Err(format!("unknown task kind '{}'", other)),
        }
    }
}

/// Completion report for a dispatched task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure { message: String },
}

impl TaskOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        TaskOutcome::Failure { message: message.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

// ============================================================================
// Blueprint / cluster template input
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceComponent {
    pub service: String,
    pub component: String,
}

impl ServiceComponent {
    pub fn new(service: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            component: component.into(),
        }
    }
}

impl fmt::Display for ServiceComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.component)
    }
}

/// A service known to the stack and the components it provides
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDefinition {
    pub name: String,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostGroupDefinition {
    pub name: String,
    pub components: Vec<ServiceComponent>,
    /// Another host group whose configuration overrides apply underneath this one
    #[serde(default)]
    pub inherits: Option<String>,
    #[serde(default)]
    pub configuration: PropertyMap,
}

/// Declarative description of a cluster's host groups
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blueprint {
    pub name: String,
    pub services: Vec<ServiceDefinition>,
    pub host_groups: Vec<HostGroupDefinition>,
    /// Cluster-wide defaults
    #[serde(default)]
    pub configuration: PropertyMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostGroupTemplate {
    pub name: String,
    /// Number of hosts expected to register for this group
    #[serde(default)]
    pub host_count: Option<u32>,
    /// Hosts explicitly assigned to this group
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub configuration: PropertyMap,
}

/// Operator request binding a blueprint to a concrete cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterTemplate {
    pub cluster_id: String,
    pub blueprint: String,
    #[serde(default)]
    pub configuration: PropertyMap,
    #[serde(default)]
    pub host_groups: Vec<HostGroupTemplate>,
}

// ============================================================================
// Agent commands
// ============================================================================

/// Work handed to the agent on a managed host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskParameters {
    pub cluster_id: String,
    pub host_group: String,
    pub components: Vec<ServiceComponent>,
    #[serde(default)]
    pub configuration: PropertyMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCommand {
    pub handle: String,
    pub request_id: RequestId,
    pub hostname: String,
    pub kind: TaskKind,
    pub attempt: u32,
    pub parameters: TaskParameters,
}

// ============================================================================
// Progress / API
// ============================================================================

/// Aggregate status of one cluster-provisioning request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub request_id: RequestId,
    pub cluster_id: String,
    pub status: RequestStatus,
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// Hosts still expected to register for bounded host groups
    pub outstanding_hosts: u32,
}

impl Progress {
    pub fn count(&self, status: HostRequestStatus) -> usize {
        match status {
            HostRequestStatus::Pending => self.pending,
            HostRequestStatus::InProgress => self.in_progress,
            HostRequestStatus::Completed => self.completed,
            HostRequestStatus::Failed => self.failed,
        }
    }

    /// Share of host requests in `status`, 0.0 - 100.0
    pub fn percent(&self, status: HostRequestStatus) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(status) as f64 * 100.0 / self.total as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRequestSummary {
    pub id: HostRequestId,
    pub request_id: RequestId,
    pub cluster_id: String,
    pub hostname: String,
    pub host_group: String,
    pub status: HostRequestStatus,
    pub next_task: Option<TaskKind>,
    pub completed_tasks: Vec<TaskKind>,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitClusterRequest {
    pub blueprint: Blueprint,
    pub template: ClusterTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitClusterResponse {
    pub request_id: RequestId,
    pub cluster_id: String,
    pub revision: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterHostRequest {
    pub hostname: String,
    pub cluster_id: String,
    #[serde(default)]
    pub host_group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub reason: Option<String>,
}
