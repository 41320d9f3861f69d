//! Apply the host group's resolved configuration

use super::TaskContext;
use crate::error::TaskFailure;
use crate::ports::DispatchHandle;

/// Task name for logging and dispatch
pub const NAME: &str = "clusterforge-topology::task::configure";

pub(crate) async fn run(ctx: &TaskContext<'_>) -> Result<DispatchHandle, TaskFailure> {
    let group = ctx.host_group()?;
    let configuration = ctx
        .topology
        .resolve_config(group.name())
        .ok_or_else(|| TaskFailure::MissingHostGroup(group.name().to_string()))?;

    tracing::info!(
        hostname = ctx.request.hostname(),
        host_group = group.name(),
        properties = configuration.len(),
        "Dispatching CONFIGURE task"
    );

    ctx.dispatch(ctx.parameters(ctx.components()?, configuration)).await
}
