use std::path::Path;

use anyhow::{Context, Result};

use crate::api::{self, AppState};
use crate::config::{self, Config};
use crate::engine;

/// Run the API and topology engine in the foreground until Ctrl+C
pub async fn run_serve(port: Option<u16>) -> Result<()> {
    let config = Config::load()?;
    let port = port.unwrap_or(config.server_port);

    tracing::info!("Starting ClusterForge server");
    tracing::info!("API port: {}", port);

    let engine = engine::initialize(&config).await?;
    let state = AppState::new(engine);

    api::start_server(&config.server_host, port, state).await?;

    tracing::info!("Server stopped");
    Ok(())
}

pub async fn logs(tail: usize, filter: Option<String>) -> Result<()> {
    let log_file = config::home_dir().join("server.log");
    if !log_file.exists() {
        println!("✗ No log file found at: {}", log_file.display());
        println!("  Server may not have been started yet");
        return Ok(());
    }

    for line in read_tail(&log_file, tail, filter.as_deref()).await? {
        println!("{}", line);
    }
    Ok(())
}

async fn read_tail(log_file: &Path, tail: usize, filter: Option<&str>) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(log_file)
        .await
        .with_context(|| format!("Failed to read {}", log_file.display()))?;

    let matching: Vec<&str> = contents
        .lines()
        .filter(|line| filter.map_or(true, |text| line.contains(text)))
        .collect();
    let skip = matching.len().saturating_sub(tail);
    Ok(matching[skip..].iter().map(|line| line.to_string()).collect())
}

/// Fail fast with a hint when the API is not reachable
pub async fn ensure_server_running(api_url: &str) -> Result<()> {
    if let Ok(response) = reqwest::get(format!("{}/health", api_url)).await {
        if response.status().is_success() {
            return Ok(());
        }
    }

    if api_url.starts_with("http://localhost") || api_url.starts_with("http://127.0.0.1") {
        anyhow::bail!(
            "ClusterForge server is not running at {}\nStart it with: clusterforge-server serve",
            api_url
        );
    }
    anyhow::bail!("Cannot connect to remote API: {}\nPlease ensure the server is running.", api_url)
}
