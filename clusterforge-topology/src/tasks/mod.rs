//! Provisioning tasks
//!
//! The pipeline is a closed set of task kinds. Every kind performs its side
//! effect through a collaborator and hands the host's share of the work to the
//! agent; the outcome is reported back asynchronously.

pub mod configure;
pub mod install;
pub mod resource_creation;
pub mod start;

use clusterforge_models::{PropertyMap, ServiceComponent, TaskKind, TaskParameters};

use crate::error::TaskFailure;
use crate::host_request::{HostRequest, TaskAttempt};
use crate::ports::{AgentDispatcher, DispatchHandle, DispatchRequest, ResourceProvider};
use crate::topology::{ClusterTopology, HostGroup};

/// Everything a task attempt may read or call
pub struct TaskContext<'a> {
    pub topology: &'a ClusterTopology,
    pub request: &'a HostRequest,
    pub attempt: TaskAttempt,
    pub resources: &'a dyn ResourceProvider,
    pub dispatcher: &'a dyn AgentDispatcher,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn host_group(&self) -> Result<&'a HostGroup, TaskFailure> {
        self.topology
            .host_group(self.request.host_group())
            .ok_or_else(|| TaskFailure::MissingHostGroup(self.request.host_group().to_string()))
    }

    pub(crate) fn components(&self) -> Result<Vec<ServiceComponent>, TaskFailure> {
        Ok(self.host_group()?.components().cloned().collect())
    }

    pub(crate) fn parameters(
        &self,
        components: Vec<ServiceComponent>,
        configuration: PropertyMap,
    ) -> TaskParameters {
        TaskParameters {
            cluster_id: self.request.cluster_id().to_string(),
            host_group: self.request.host_group().to_string(),
            components,
            configuration,
        }
    }

    pub(crate) async fn dispatch(&self, parameters: TaskParameters) -> Result<DispatchHandle, TaskFailure> {
        self.dispatcher
            .dispatch(DispatchRequest {
                request_id: self.request.request_id(),
                host_request_id: self.request.id(),
                hostname: self.request.hostname().to_string(),
                kind: self.attempt.kind,
                attempt: self.attempt.attempt,
                parameters,
            })
            .await
            .map_err(|e| TaskFailure::Dispatch(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyTask {
    ResourceCreation,
    Configure,
    Install,
    Start,
}

impl TopologyTask {
    pub fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::ResourceCreation => TopologyTask::ResourceCreation,
            TaskKind::Configure => TopologyTask::Configure,
            TaskKind::Install => TopologyTask::Install,
            TaskKind::Start => TopologyTask::Start,
        }
    }

    pub fn kind(self) -> TaskKind {
        match self {
            TopologyTask::ResourceCreation => TaskKind::ResourceCreation,
            TopologyTask::Configure => TaskKind::Configure,
            TopologyTask::Install => TaskKind::Install,
            TopologyTask::Start => TaskKind::Start,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TopologyTask::ResourceCreation => resource_creation::NAME,
            TopologyTask::Configure => configure::NAME,
            TopologyTask::Install => install::NAME,
            TopologyTask::Start => start::NAME,
        }
    }

    /// Run one attempt. Safe to repeat for the same attempt: resource
    /// creation tolerates existing records and agents key work by handle.
    pub async fn run(self, ctx: &TaskContext<'_>) -> Result<DispatchHandle, TaskFailure> {
        match self {
            TopologyTask::ResourceCreation => resource_creation::run(ctx).await,
            TopologyTask::Configure => configure::run(ctx).await,
            TopologyTask::Install => install::run(ctx).await,
            TopologyTask::Start => start::run(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryResourceProvider, QueueDispatcher};
    use crate::topology::build_topology;
    use crate::topology::tests::{hdfs_blueprint, template};
    use uuid::Uuid;

    struct Fixture {
        topology: ClusterTopology,
        request: HostRequest,
        resources: InMemoryResourceProvider,
        dispatcher: QueueDispatcher,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                topology: build_topology(&hdfs_blueprint(), &template("c1", &[("master", Some(1))])).unwrap(),
                request: HostRequest::new(7, Uuid::new_v4(), "c1", "h1", "master", 1),
                resources: InMemoryResourceProvider::new(),
                dispatcher: QueueDispatcher::new(),
            }
        }

        fn ctx(&self, kind: TaskKind, attempt: u32) -> TaskContext<'_> {
            TaskContext {
                topology: &self.topology,
                request: &self.request,
                attempt: TaskAttempt { kind, attempt },
                resources: &self.resources,
                dispatcher: &self.dispatcher,
            }
        }
    }

    #[test]
    fn test_task_for_every_kind() {
        for kind in TaskKind::PIPELINE {
            let task = TopologyTask::for_kind(kind);
            assert_eq!(task.kind(), kind);
            assert!(task.name().ends_with(kind.as_str()));
        }
    }

    #[tokio::test]
    async fn test_resource_creation_twice_creates_records_once() {
        let fixture = Fixture::new();
        let task = TopologyTask::ResourceCreation;

        task.run(&fixture.ctx(TaskKind::ResourceCreation, 1)).await.unwrap();
        let after_first = fixture.resources.records("c1", "h1").await;
        task.run(&fixture.ctx(TaskKind::ResourceCreation, 1)).await.unwrap();
        let after_second = fixture.resources.records("c1", "h1").await;

        assert_eq!(after_first.len(), 2);
        assert_eq!(after_first, after_second);
        assert_eq!(fixture.resources.total_records().await, 2);
    }

    #[tokio::test]
    async fn test_configure_carries_resolved_configuration() {
        let fixture = Fixture::new();
        let handle = TopologyTask::Configure
            .run(&fixture.ctx(TaskKind::Configure, 3))
            .await
            .unwrap();

        let commands = fixture.dispatcher.drain("h1").await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].handle, handle.0);
        assert_eq!(commands[0].kind, TaskKind::Configure);
        assert_eq!(commands[0].attempt, 3);
        assert_eq!(commands[0].parameters.configuration["hdfs-site/dfs.replication"], "3");
    }

    #[tokio::test]
    async fn test_unknown_host_group_fails_task() {
        let mut fixture = Fixture::new();
        fixture.request = HostRequest::new(8, Uuid::new_v4(), "c1", "h2", "gateway", 1);
        let err = TopologyTask::Install
            .run(&fixture.ctx(TaskKind::Install, 1))
            .await
            .unwrap_err();
        assert_eq!(err, TaskFailure::MissingHostGroup("gateway".to_string()));
        assert!(fixture.dispatcher.drain("h2").await.is_empty());
    }
}
