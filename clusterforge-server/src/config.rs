use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// In-memory state when unset
    pub database_url: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    /// Queued commands per host before dispatch is rejected
    pub max_queued_per_host: Option<usize>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            server_host: std::env::var("SERVER_HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            max_queued_per_host: std::env::var("CLUSTERFORGE_MAX_QUEUED_PER_HOST")
                .ok()
                .map(|limit| limit.parse())
                .transpose()
                .context("CLUSTERFORGE_MAX_QUEUED_PER_HOST must be a number")?,
        })
    }
}

/// Directory for logs, `~/.clusterforge` unless CLUSTERFORGE_HOME is set
pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("CLUSTERFORGE_HOME") {
        return PathBuf::from(home);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".clusterforge")
}

/// Base URL used by client commands
pub fn api_url() -> String {
    std::env::var("CLUSTERFORGE_API_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}
