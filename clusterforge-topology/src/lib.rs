//! ClusterForge Topology - orchestration engine for blueprint-based cluster provisioning
//!
//! This crate validates blueprints into immutable cluster topologies, tracks one
//! provisioning request per host and drives each host through the
//! resource-creation → configure → install → start pipeline. Persistence, agent
//! transport, host-to-group assignment and progress consumers are collaborators
//! behind the traits in [`ports`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use clusterforge_topology::adapters::{
//!     BroadcastNotifier, InMemoryResourceProvider, InMemoryTopologyStore, QueueDispatcher,
//!     StaticHostDirectory,
//! };
//! use clusterforge_topology::{build_topology, Collaborators, TopologyManager};
//!
//! # async fn example(
//! #     blueprint: clusterforge_models::Blueprint,
//! #     template: clusterforge_models::ClusterTemplate,
//! # ) -> anyhow::Result<()> {
//! let manager = TopologyManager::new(Collaborators {
//!     store: Arc::new(InMemoryTopologyStore::new()),
//!     dispatcher: Arc::new(QueueDispatcher::new()),
//!     resources: Arc::new(InMemoryResourceProvider::new()),
//!     directory: Arc::new(StaticHostDirectory::new()),
//!     notifier: Arc::new(BroadcastNotifier::default()),
//! });
//! manager.recover_on_startup().await?;
//!
//! let request_id = manager.submit_topology(build_topology(&blueprint, &template)?).await?;
//! manager.on_host_registered("h1", &template.cluster_id).await?;
//! println!("{:?}", manager.get_progress(request_id).await?);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod error;
pub mod host_request;
pub mod manager;
pub mod ports;
pub mod tasks;
pub mod topology;

pub use error::{
    RecoveryInconsistency, RegistrationRace, StoreError, TaskFailure, TopologyError, TransitionError,
    ValidationError, Violation,
};
pub use host_request::{HostRequest, TaskAttempt, Transition};
pub use manager::{
    ClusterRequestRecord, Collaborators, CompletionOutcome, RecoveryReport, RegistrationOutcome,
    TopologyManager,
};
pub use tasks::{TaskContext, TopologyTask};
pub use topology::{build_topology, rebuild_topology, resolve_config, ClusterTopology, HostGroup};
