use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use clusterforge_models::AgentCommand;
use tokio::sync::Mutex;

use crate::error::DispatchError;
use crate::ports::{AgentDispatcher, DispatchHandle, DispatchRequest};

/// Per-host command queues drained by agents on their next heartbeat
#[derive(Default)]
pub struct QueueDispatcher {
    queues: Mutex<HashMap<String, VecDeque<AgentCommand>>>,
    max_queued_per_host: Option<usize>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject dispatch once a host has this many undrained commands
    pub fn with_max_queued_per_host(mut self, limit: usize) -> Self {
        self.max_queued_per_host = Some(limit);
        self
    }

    /// Take every queued command for a host, oldest first
    pub async fn drain(&self, hostname: &str) -> Vec<AgentCommand> {
        self.queues
            .lock()
            .await
            .remove(hostname)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub async fn queued(&self, hostname: &str) -> usize {
        self.queues.lock().await.get(hostname).map_or(0, VecDeque::len)
    }
}

/// Stable for one (request, host request, kind, attempt); a repeated
/// dispatch of the same attempt carries the same handle.
fn handle_for(request: &DispatchRequest) -> DispatchHandle {
    DispatchHandle(format!(
        "{}-{}-{}-{}",
        request.request_id, request.host_request_id, request.kind, request.attempt
    ))
}

#[async_trait]
impl AgentDispatcher for QueueDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchHandle, DispatchError> {
        let handle = handle_for(&request);
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(request.hostname.clone()).or_default();

        if queue.iter().any(|command| command.handle == handle.0) {
            return Ok(handle);
        }
        if let Some(limit) = self.max_queued_per_host {
            if queue.len() >= limit {
                return Err(DispatchError {
                    hostname: request.hostname,
                    kind: request.kind,
                    reason: format!("{} commands already queued", queue.len()),
                });
            }
        }

        tracing::debug!(hostname = %request.hostname, handle = %handle, "Queued agent command");
        queue.push_back(AgentCommand {
            handle: handle.0.clone(),
            request_id: request.request_id,
            hostname: request.hostname,
            kind: request.kind,
            attempt: request.attempt,
            parameters: request.parameters,
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterforge_models::{PropertyMap, TaskKind, TaskParameters};
    use uuid::Uuid;

    fn request(kind: TaskKind, attempt: u32) -> DispatchRequest {
        DispatchRequest {
            request_id: Uuid::nil(),
            host_request_id: 1,
            hostname: "h1".to_string(),
            kind,
            attempt,
            parameters: TaskParameters {
                cluster_id: "c1".to_string(),
                host_group: "master".to_string(),
                components: Vec::new(),
                configuration: PropertyMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_same_attempt_is_queued_once() {
        let dispatcher = QueueDispatcher::new();
        let first = dispatcher.dispatch(request(TaskKind::Install, 1)).await.unwrap();
        let again = dispatcher.dispatch(request(TaskKind::Install, 1)).await.unwrap();
        assert_eq!(first, again);
        dispatcher.dispatch(request(TaskKind::Install, 2)).await.unwrap();

        let commands = dispatcher.drain("h1").await;
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].attempt, 1);
        assert_eq!(commands[1].attempt, 2);
        assert_eq!(dispatcher.queued("h1").await, 0);
    }

    #[tokio::test]
    async fn test_queue_limit_rejects_dispatch() {
        let dispatcher = QueueDispatcher::new().with_max_queued_per_host(1);
        dispatcher.dispatch(request(TaskKind::Install, 1)).await.unwrap();
        let err = dispatcher.dispatch(request(TaskKind::Start, 2)).await.unwrap_err();
        assert_eq!(err.kind, TaskKind::Start);
        assert_eq!(err.hostname, "h1");
    }
}
