//! Install the host group's components

use clusterforge_models::PropertyMap;

use super::TaskContext;
use crate::error::TaskFailure;
use crate::ports::DispatchHandle;

/// Task name for logging and dispatch
pub const NAME: &str = "clusterforge-topology::task::install";

pub(crate) async fn run(ctx: &TaskContext<'_>) -> Result<DispatchHandle, TaskFailure> {
    let components = ctx.components()?;
    tracing::info!(
        hostname = ctx.request.hostname(),
        components = components.len(),
        "Dispatching INSTALL task"
    );
    ctx.dispatch(ctx.parameters(components, PropertyMap::new())).await
}
