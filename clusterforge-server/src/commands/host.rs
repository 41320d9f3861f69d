use anyhow::Result;

use clusterforge_models::{HostRequestSummary, RegisterHostRequest};

use crate::commands::check;
use crate::commands::server::ensure_server_running;
use crate::config;

pub async fn run_register(hostname: String, cluster_id: String, host_group: Option<String>) -> Result<()> {
    let api_url = config::api_url();
    ensure_server_running(&api_url).await?;

    let response = reqwest::Client::new()
        .post(format!("{}/api/hosts", api_url))
        .json(&RegisterHostRequest {
            hostname: hostname.clone(),
            cluster_id: cluster_id.clone(),
            host_group,
        })
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to API: {}", e))?;
    let body: serde_json::Value = check(response).await?.json().await?;

    match body["outcome"].as_str().unwrap_or("-") {
        "provisioning" => {
            println!("✓ Host '{}' is being provisioned", hostname);
            println!("  Request ID: {}", body["request_id"].as_str().unwrap_or("-"));
        }
        "already_provisioning" => {
            println!("Host '{}' is already being provisioned", hostname);
            println!("  Request ID: {}", body["request_id"].as_str().unwrap_or("-"));
        }
        "recorded" => {
            println!("✓ Host '{}' registered with cluster '{}'", hostname, cluster_id);
            println!("  Provisioning starts once a topology claims it");
        }
        _ => {
            anyhow::bail!(
                "Registration discarded: {}",
                body["reason"].as_str().unwrap_or("unknown reason")
            );
        }
    }

    Ok(())
}

pub async fn run_host(hostname: String, output: String) -> Result<()> {
    let api_url = config::api_url();
    ensure_server_running(&api_url).await?;

    let response = reqwest::get(format!("{}/api/hosts/{}", api_url, hostname))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to API: {}", e))?;
    let summary: HostRequestSummary = check(response).await?.json().await?;

    if output == "json" {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

pub async fn run_retry(hostname: String) -> Result<()> {
    let api_url = config::api_url();
    ensure_server_running(&api_url).await?;

    let response = reqwest::Client::new()
        .post(format!("{}/api/hosts/{}/retry", api_url, hostname))
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to API: {}", e))?;
    let summary: HostRequestSummary = check(response).await?.json().await?;

    println!("✓ Retrying host '{}'", summary.hostname);
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &HostRequestSummary) {
    let completed: Vec<String> = summary.completed_tasks.iter().map(ToString::to_string).collect();
    let age = chrono::Utc::now().signed_duration_since(summary.updated_at);

    println!("Host:       {}", summary.hostname);
    println!("Cluster:    {} ({})", summary.cluster_id, summary.host_group);
    println!("Request:    {}", summary.request_id);
    println!("Status:     {}", summary.status);
    println!(
        "Next task:  {}",
        summary
            .next_task
            .map(|kind| format!("{} (attempt {})", kind, summary.attempt))
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "Completed:  {}",
        if completed.is_empty() { "-".to_string() } else { completed.join(", ") }
    );
    if let Some(error) = &summary.last_error {
        println!("Error:      {}", error);
    }
    println!("Updated:    {}s ago", age.num_seconds().max(0));
}
