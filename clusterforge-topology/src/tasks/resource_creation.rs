//! Materialize durable per-host component records

use clusterforge_models::PropertyMap;

use super::TaskContext;
use crate::error::TaskFailure;
use crate::ports::DispatchHandle;

/// Task name for logging and dispatch
pub const NAME: &str = "clusterforge-topology::task::resource-creation";

pub(crate) async fn run(ctx: &TaskContext<'_>) -> Result<DispatchHandle, TaskFailure> {
    let hostname = ctx.request.hostname();
    tracing::info!(hostname, attempt = ctx.attempt.attempt, "Executing RESOURCE_CREATION task");

    let components = ctx.components()?;

    // Existing records count as success so a re-dispatched attempt is harmless
    let outcome = ctx
        .resources
        .create_host_resources(ctx.request.cluster_id(), hostname, &components)
        .await
        .map_err(|e| TaskFailure::ResourceCreation(e.to_string()))?;

    tracing::info!(
        hostname,
        created = outcome.created,
        existing = outcome.existing,
        "Host resources materialized"
    );

    ctx.dispatch(ctx.parameters(components, PropertyMap::new())).await
}
