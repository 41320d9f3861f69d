use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use clusterforge_models::{
    AbortRequest, Blueprint, ClusterTemplate, HostRequestStatus, HostRequestSummary, Progress, SubmitClusterRequest,
    SubmitClusterResponse,
};
use clusterforge_topology::{build_topology, ClusterTopology};

use crate::commands::check;
use crate::commands::server::ensure_server_running;
use crate::config;

/// Read a blueprint or template; YAML is a superset of JSON so both parse
pub(crate) fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn load(blueprint: &Path, template: &Path) -> Result<(Blueprint, ClusterTemplate)> {
    Ok((read_document(blueprint)?, read_document(template)?))
}

pub async fn run_validate(blueprint: &Path, template: &Path) -> Result<()> {
    let (blueprint, template) = load(blueprint, template)?;

    match build_topology(&blueprint, &template) {
        Ok(topology) => {
            print_topology(&topology);
            Ok(())
        }
        Err(err) => {
            println!("✗ Blueprint '{}' is invalid for cluster '{}'", blueprint.name, template.cluster_id);
            for violation in &err.violations {
                println!("  - {}", violation);
            }
            anyhow::bail!("{} violation(s) found", err.violations.len())
        }
    }
}

fn print_topology(topology: &ClusterTopology) {
    println!(
        "✓ Blueprint '{}' is valid for cluster '{}'",
        topology.blueprint(),
        topology.cluster_id()
    );
    println!();
    println!("{:<20} {:<8} {}", "HOST GROUP", "HOSTS", "COMPONENTS");
    println!("{}", "-".repeat(70));
    for group in topology.host_groups() {
        let count = group
            .host_count()
            .map(|count| count.to_string())
            .unwrap_or_else(|| "any".to_string());
        let components: Vec<String> = group.components().map(ToString::to_string).collect();
        println!("{:<20} {:<8} {}", group.name(), count, components.join(", "));
    }
}

pub async fn run_submit(blueprint: &Path, template: &Path) -> Result<()> {
    let (blueprint, template) = load(blueprint, template)?;

    let api_url = config::api_url();
    ensure_server_running(&api_url).await?;

    println!("Submitting blueprint '{}' for cluster '{}'...", blueprint.name, template.cluster_id);

    let response = reqwest::Client::new()
        .post(format!("{}/api/clusters", api_url))
        .json(&SubmitClusterRequest { blueprint, template })
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to API: {}", e))?;
    let submitted: SubmitClusterResponse = check(response).await?.json().await?;

    println!("✓ Provisioning request created");
    println!("  Request ID: {}", submitted.request_id);
    println!("  Cluster:    {}", submitted.cluster_id);
    println!("  Revision:   {}", submitted.revision);
    println!();
    println!("Track progress with: clusterforge-server progress {}", submitted.request_id);

    Ok(())
}

pub async fn run_requests(output: String) -> Result<()> {
    let api_url = config::api_url();
    ensure_server_running(&api_url).await?;

    let response = reqwest::get(format!("{}/api/requests", api_url))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to API: {}", e))?;
    let requests: Vec<Progress> = check(response).await?.json().await?;

    if output == "json" {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }

    println!(
        "{:<38} {:<15} {:<12} {:>6} {:>10} {:>7}",
        "REQUEST", "CLUSTER", "STATUS", "HOSTS", "COMPLETED", "FAILED"
    );
    println!("{}", "-".repeat(93));
    for progress in &requests {
        println!(
            "{:<38} {:<15} {:<12} {:>6} {:>9.0}% {:>7}",
            progress.request_id,
            progress.cluster_id,
            progress.status,
            progress.total,
            progress.percent(HostRequestStatus::Completed),
            progress.failed
        );
    }
    println!();
    println!("{} request(s) found", requests.len());

    Ok(())
}

pub async fn run_progress(request_id: Uuid, output: String) -> Result<()> {
    let api_url = config::api_url();
    ensure_server_running(&api_url).await?;

    let response = reqwest::get(format!("{}/api/requests/{}", api_url, request_id))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to API: {}", e))?;
    let body: serde_json::Value = check(response).await?.json().await?;

    if output == "json" {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let progress: Progress = serde_json::from_value(body["progress"].clone())?;
    let hosts: Vec<HostRequestSummary> = serde_json::from_value(body["hosts"].clone())?;

    print_progress(&progress);
    if !hosts.is_empty() {
        println!();
        println!("{:<25} {:<15} {:<12} {:<18} {}", "HOST", "GROUP", "STATUS", "NEXT TASK", "ERROR");
        println!("{}", "-".repeat(90));
        for host in &hosts {
            println!(
                "{:<25} {:<15} {:<12} {:<18} {}",
                host.hostname,
                host.host_group,
                host.status,
                host.next_task.map(|kind| kind.to_string()).unwrap_or_else(|| "-".to_string()),
                host.last_error.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(())
}

fn print_progress(progress: &Progress) {
    println!("Request:  {}", progress.request_id);
    println!("Cluster:  {}", progress.cluster_id);
    println!("Status:   {}", progress.status);
    println!("Hosts:    {}", progress.total);
    for status in [
        HostRequestStatus::Pending,
        HostRequestStatus::InProgress,
        HostRequestStatus::Completed,
        HostRequestStatus::Failed,
    ] {
        println!(
            "  {:<12} {:>4} ({:.0}%)",
            status,
            progress.count(status),
            progress.percent(status)
        );
    }
    if progress.outstanding_hosts > 0 {
        println!("Waiting for {} more host(s) to register", progress.outstanding_hosts);
    }
}

pub async fn run_abort(request_id: Uuid, reason: Option<String>) -> Result<()> {
    let api_url = config::api_url();
    ensure_server_running(&api_url).await?;

    let response = reqwest::Client::new()
        .post(format!("{}/api/requests/{}/abort", api_url, request_id))
        .json(&AbortRequest { reason })
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to API: {}", e))?;
    let progress: Progress = check(response).await?.json().await?;

    println!("✓ Request {} is {}", progress.request_id, progress.status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_document_accepts_yaml_and_json() {
        let dir = std::env::temp_dir().join(format!("clusterforge-docs-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let yaml = dir.join("template.yaml");
        std::fs::write(
            &yaml,
            "cluster_id: c1\nblueprint: hdfs-bp\nhost_groups:\n  - name: master\n    host_count: 1\n",
        )
        .unwrap();
        let template: ClusterTemplate = read_document(&yaml).unwrap();
        assert_eq!(template.cluster_id, "c1");
        assert_eq!(template.host_groups[0].host_count, Some(1));

        let json = dir.join("blueprint.json");
        std::fs::write(
            &json,
            r#"{"name": "hdfs-bp", "services": [], "host_groups": []}"#,
        )
        .unwrap();
        let blueprint: Blueprint = read_document(&json).unwrap();
        assert_eq!(blueprint.name, "hdfs-bp");

        assert!(read_document::<Blueprint>(&dir.join("missing.yaml")).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
