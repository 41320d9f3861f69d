use anyhow::{Context, Result};
use sqlx::PgPool;

const TABLES: [&str; 4] = ["topologies", "cluster_requests", "host_requests", "host_components"];

/// Initialize the clusterforge schema in the database
pub async fn initialize_schema(pool: &PgPool) -> Result<()> {
    clusterforge_topology::adapters::initialize_schema(pool)
        .await
        .context("Failed to initialize clusterforge schema")
}

/// Verify that every clusterforge table exists
pub async fn verify_tables(pool: &PgPool) -> Result<()> {
    let existing: Vec<(String,)> = sqlx::query_as(
        "SELECT table_name::text FROM information_schema.tables
         WHERE table_schema = 'clusterforge'",
    )
    .fetch_all(pool)
    .await
    .context("Failed to check if clusterforge tables exist")?;

    let missing: Vec<&str> = TABLES
        .iter()
        .copied()
        .filter(|table| !existing.iter().any(|(name,)| name == table))
        .collect();

    if missing.is_empty() {
        tracing::info!("✓ clusterforge tables verified");
        Ok(())
    } else {
        anyhow::bail!(
            "clusterforge tables not found: {}\n\
             The server creates them on startup; check that the database user may create tables.",
            missing.join(", ")
        )
    }
}
