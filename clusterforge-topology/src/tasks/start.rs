//! Start the host group's installed components

use clusterforge_models::PropertyMap;

use super::TaskContext;
use crate::error::TaskFailure;
use crate::ports::DispatchHandle;

/// Task name for logging and dispatch
pub const NAME: &str = "clusterforge-topology::task::start";

pub(crate) async fn run(ctx: &TaskContext<'_>) -> Result<DispatchHandle, TaskFailure> {
    let components = ctx.components()?;
    tracing::info!(hostname = ctx.request.hostname(), "Dispatching START task");
    ctx.dispatch(ctx.parameters(components, PropertyMap::new())).await
}
