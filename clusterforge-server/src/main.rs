use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cli;
mod commands;
mod config;
mod db;
mod engine;

use cli::{Args, Mode};

/// Initialize tracing:
/// 1. File output (~/.clusterforge/server.log) - always
/// 2. Console output (stderr) - only while serving
fn initialize_tracing(console: bool) -> Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,\
         clusterforge_server=debug,\
         clusterforge_topology=debug,\
         tower_http=debug,\
         sqlx::query=warn"
            .into()
    });

    let home = config::home_dir();
    std::fs::create_dir_all(&home).ok();

    let file_appender = tracing_appender::rolling::never(&home, "server.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops file logging
    std::mem::forget(guard);

    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);
    let console_layer = console.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    if console {
        eprintln!("✓ Tracing initialized");
        eprintln!("  - File: {}", home.join("server.log").display());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    initialize_tracing(matches!(args.mode, Mode::Serve { .. }))?;

    match args.mode {
        Mode::Serve { port } => commands::server::run_serve(port).await,
        Mode::Validate { blueprint, template } => commands::cluster::run_validate(&blueprint, &template).await,
        Mode::Submit { blueprint, template } => commands::cluster::run_submit(&blueprint, &template).await,
        Mode::Register {
            hostname,
            cluster,
            group,
        } => commands::host::run_register(hostname, cluster, group).await,
        Mode::Requests { output } => commands::cluster::run_requests(output).await,
        Mode::Progress { request_id, output } => commands::cluster::run_progress(request_id, output).await,
        Mode::Abort { request_id, reason } => commands::cluster::run_abort(request_id, reason).await,
        Mode::Host { hostname, output } => commands::host::run_host(hostname, output).await,
        Mode::Retry { hostname } => commands::host::run_retry(hostname).await,
        Mode::Logs { tail, filter } => commands::server::logs(tail, filter).await,
    }
}
