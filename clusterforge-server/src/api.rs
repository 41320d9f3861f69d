use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use tokio::sync::Notify;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use clusterforge_models::{
    AbortRequest, AgentCommand, HostRequestSummary, Progress, RegisterHostRequest, SubmitClusterRequest,
    SubmitClusterResponse, TaskKind, TaskOutcome,
};
use clusterforge_topology::adapters::{QueueDispatcher, StaticHostDirectory};
use clusterforge_topology::{
    build_topology, rebuild_topology, CompletionOutcome, RegistrationOutcome, TopologyError, TopologyManager,
};

use crate::engine::{self, Engine};

const DEFAULT_ABORT_REASON: &str = "aborted by operator";

/// Shared API state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TopologyManager>,
    pub dispatcher: Arc<QueueDispatcher>,
    pub directory: Arc<StaticHostDirectory>,
    /// Signalled when durable state is lost and the server must stop
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            manager: engine.manager,
            dispatcher: engine.dispatcher,
            directory: engine.directory,
            shutdown: Arc::new(Notify::new()),
        }
    }

    fn fail(&self, err: TopologyError) -> AppError {
        if err.is_fatal() {
            tracing::error!(error = %err, "Durable state unavailable, shutting down");
            self.shutdown.notify_one();
        }
        AppError::from(err)
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/clusters", post(submit_cluster))
        .route("/api/requests", get(list_requests))
        .route("/api/requests/:id", get(get_request).delete(purge_request))
        .route("/api/requests/:id/abort", post(abort_request))
        .route("/api/hosts", post(register_host))
        .route("/api/hosts/:hostname", get(get_host))
        .route("/api/hosts/:hostname/retry", post(retry_host))
        .route("/api/agents/:hostname/commands", get(agent_commands))
        .route("/api/agents/:hostname/tasks/:kind", post(task_completed))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Start the API server; returns once the server has shut down
pub async fn start_server(host: &str, port: u16, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("✓ API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C, shutting down"),
                _ = shutdown.notified() => {}
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

// ============================================================================
// Health Check
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "clusterforge",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ============================================================================
// Clusters and requests
// ============================================================================

async fn submit_cluster(
    State(state): State<AppState>,
    Json(body): Json<SubmitClusterRequest>,
) -> Result<(StatusCode, Json<SubmitClusterResponse>), AppError> {
    let cluster_id = body.template.cluster_id.clone();
    let previous = state
        .manager
        .topology(&cluster_id)
        .await
        .map_err(|e| state.fail(e))?;
    let topology = match previous {
        Some(previous) => rebuild_topology(&previous, &body.blueprint, &body.template)?,
        None => build_topology(&body.blueprint, &body.template)?,
    };
    let revision = topology.revision();

    // Template assignments are recorded only once the topology is accepted
    state.directory.add_cluster(&cluster_id).await;
    let request_id = state
        .manager
        .submit_topology(topology.clone())
        .await
        .map_err(|e| state.fail(e))?;
    tracing::info!(%request_id, %cluster_id, revision, "Topology submitted");

    if engine::assign_topology_hosts(&state.directory, &topology).await > 0 {
        state
            .manager
            .offer_registered_hosts(&cluster_id)
            .await
            .map_err(|e| state.fail(e))?;
    }

    Ok((
        StatusCode::CREATED,
        Json(SubmitClusterResponse {
            request_id,
            cluster_id,
            revision,
        }),
    ))
}

async fn list_requests(State(state): State<AppState>) -> Json<Vec<Progress>> {
    Json(state.manager.list_requests().await)
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let progress = state.manager.get_progress(id).await.map_err(|e| state.fail(e))?;
    let hosts = state.manager.host_requests(id).await.map_err(|e| state.fail(e))?;

    Ok(Json(serde_json::json!({
        "progress": progress,
        "hosts": hosts,
    })))
}

async fn abort_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AbortRequest>,
) -> Result<Json<Progress>, AppError> {
    let reason = body.reason.as_deref().unwrap_or(DEFAULT_ABORT_REASON);
    let progress = state
        .manager
        .abort_request(id, reason)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(progress))
}

async fn purge_request(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, AppError> {
    state.manager.purge_request(id).await.map_err(|e| state.fail(e))?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Hosts
// ============================================================================

async fn register_host(
    State(state): State<AppState>,
    Json(body): Json<RegisterHostRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(group) = &body.host_group {
        state.directory.assign(&body.cluster_id, &body.hostname, group).await;
    }

    let outcome = state
        .manager
        .on_host_registered(&body.hostname, &body.cluster_id)
        .await
        .map_err(|e| state.fail(e))?;

    let response = match outcome {
        RegistrationOutcome::Provisioning {
            request_id,
            host_request_id,
        } => serde_json::json!({
            "outcome": "provisioning",
            "request_id": request_id,
            "host_request_id": host_request_id,
        }),
        RegistrationOutcome::AlreadyProvisioning {
            request_id,
            host_request_id,
        } => serde_json::json!({
            "outcome": "already_provisioning",
            "request_id": request_id,
            "host_request_id": host_request_id,
        }),
        RegistrationOutcome::Recorded => serde_json::json!({ "outcome": "recorded" }),
        RegistrationOutcome::Discarded(race) => serde_json::json!({
            "outcome": "discarded",
            "reason": race.to_string(),
        }),
    };
    Ok(Json(response))
}

async fn get_host(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<HostRequestSummary>, AppError> {
    let summary = state.manager.host_request(&hostname).await.map_err(|e| state.fail(e))?;
    Ok(Json(summary))
}

async fn retry_host(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<HostRequestSummary>, AppError> {
    let summary = state.manager.retry_host(&hostname).await.map_err(|e| state.fail(e))?;
    Ok(Json(summary))
}

// ============================================================================
// Agents
// ============================================================================

async fn agent_commands(State(state): State<AppState>, Path(hostname): Path<String>) -> Json<Vec<AgentCommand>> {
    Json(state.dispatcher.drain(&hostname).await)
}

async fn task_completed(
    State(state): State<AppState>,
    Path((hostname, kind)): Path<(String, String)>,
    Json(outcome): Json<TaskOutcome>,
) -> Result<Json<serde_json::Value>, AppError> {
    let kind: TaskKind = kind.parse().map_err(AppError::BadRequest)?;

    let outcome = state
        .manager
        .on_task_completed(&hostname, kind, outcome)
        .await
        .map_err(|e| state.fail(e))?;

    let response = match outcome {
        CompletionOutcome::Advanced { next } => serde_json::json!({ "outcome": "advanced", "next": next }),
        CompletionOutcome::Completed => serde_json::json!({ "outcome": "completed" }),
        CompletionOutcome::Failed => serde_json::json!({ "outcome": "failed" }),
        CompletionOutcome::Discarded => serde_json::json!({ "outcome": "discarded" }),
    };
    Ok(Json(response))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<TopologyError> for AppError {
    fn from(err: TopologyError) -> Self {
        let message = err.to_string();
        match err {
            TopologyError::Validation(_) => AppError::BadRequest(message),
            TopologyError::UnknownRequest(_) | TopologyError::UnknownHost(_) => AppError::NotFound(message),
            TopologyError::ActiveRequest { .. }
            | TopologyError::StaleRevision { .. }
            | TopologyError::RequestActive(_)
            | TopologyError::RequestAborted(_)
            | TopologyError::Transition { .. } => AppError::Conflict(message),
            TopologyError::Persistence(_) => AppError::Internal(message),
        }
    }
}

impl From<clusterforge_topology::ValidationError> for AppError {
    fn from(err: clusterforge_topology::ValidationError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use clusterforge_topology::ports::{HostAssignment, HostDirectory};

    use crate::config::Config;

    async fn test_state() -> AppState {
        let config = Config {
            database_url: None,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            max_queued_per_host: None,
        };
        AppState::new(engine::initialize(&config).await.unwrap())
    }

    fn submission(cluster_id: &str) -> Value {
        json!({
            "blueprint": {
                "name": "hdfs-bp",
                "services": [{ "name": "HDFS", "components": ["NAMENODE", "DATANODE"] }],
                "host_groups": [
                    { "name": "master", "components": [{ "service": "HDFS", "component": "NAMENODE" }] }
                ]
            },
            "template": {
                "cluster_id": cluster_id,
                "blueprint": "hdfs-bp",
                "host_groups": [{ "name": "master", "hosts": ["m1"] }]
            }
        })
    }

    async fn call(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = test_state().await;
        let (status, body) = call(&state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "clusterforge");
    }

    #[tokio::test]
    async fn test_host_provisioned_through_agent_endpoints() {
        let state = test_state().await;

        let (status, body) = call(&state, Method::POST, "/api/clusters", Some(submission("c1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["revision"], 1);
        let request_id = body["request_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/hosts",
            Some(json!({ "hostname": "m1", "cluster_id": "c1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "provisioning");

        for kind in ["resource-creation", "configure", "install", "start"] {
            let (_, commands) = call(&state, Method::GET, "/api/agents/m1/commands", None).await;
            assert_eq!(commands[0]["kind"], kind.replace('-', "_"));

            let uri = format!("/api/agents/m1/tasks/{}", kind);
            let (status, _) = call(&state, Method::POST, &uri, Some(json!({ "result": "success" }))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = call(&state, Method::GET, &format!("/api/requests/{}", request_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["progress"]["status"], "COMPLETED");
        assert_eq!(body["hosts"][0]["hostname"], "m1");
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let state = test_state().await;

        let mut invalid = submission("c1");
        invalid["template"]["host_groups"][0]["name"] = json!("missing");
        let (status, body) = call(&state, Method::POST, "/api/clusters", Some(invalid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("violation"));

        let (status, _) = call(&state, Method::POST, "/api/clusters", Some(submission("c1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let mut rejected = submission("c1");
        rejected["template"]["host_groups"][0]["hosts"] = json!(["m1", "x1"]);
        let (status, _) = call(&state, Method::POST, "/api/clusters", Some(rejected)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        // A rejected submission leaves host assignments untouched
        assert_eq!(state.directory.resolve("x1", "c1").await, HostAssignment::Unassigned);

        let (status, _) = call(&state, Method::GET, "/api/hosts/nobody", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/agents/m1/tasks/reboot",
            Some(json!({ "result": "success" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_registered_host_claimed_by_template_assignment() {
        let state = test_state().await;
        state.directory.add_cluster("c1").await;

        let (_, body) = call(
            &state,
            Method::POST,
            "/api/hosts",
            Some(json!({ "hostname": "m1", "cluster_id": "c1" })),
        )
        .await;
        assert_eq!(body["outcome"], "recorded");

        let (status, _) = call(&state, Method::POST, "/api/clusters", Some(submission("c1"))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&state, Method::GET, "/api/hosts/m1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "IN_PROGRESS");
        assert_eq!(body["host_group"], "master");
    }

    #[tokio::test]
    async fn test_abort_then_purge() {
        let state = test_state().await;
        let (_, body) = call(&state, Method::POST, "/api/clusters", Some(submission("c1"))).await;
        let request_id = body["request_id"].as_str().unwrap().to_string();

        let uri = format!("/api/requests/{}", request_id);
        let (status, _) = call(&state, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&state, Method::POST, &format!("{}/abort", uri), Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ABORTED");

        let (status, _) = call(&state, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, Method::GET, "/api/requests", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
