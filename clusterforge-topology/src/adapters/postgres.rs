use async_trait::async_trait;
use clusterforge_models::{HostRequestStatus, RequestId, ServiceComponent};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::error::StoreError;
use crate::host_request::HostRequest;
use crate::manager::ClusterRequestRecord;
use crate::ports::{ResourceCreation, ResourceProvider, TopologyStore};
use crate::topology::ClusterTopology;

/// Create the `clusterforge` schema, enum types and tables if missing
pub async fn initialize_schema(pool: &PgPool) -> Result<(), StoreError> {
    let statements = [
        "CREATE SCHEMA IF NOT EXISTS clusterforge",
        r#"
        DO $$ BEGIN
            CREATE TYPE host_request_status AS ENUM ('pending', 'in_progress', 'completed', 'failed');
        EXCEPTION WHEN duplicate_object THEN NULL;
        END $$
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS clusterforge.topologies (
            cluster_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            document JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (cluster_id, revision)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS clusterforge.cluster_requests (
            id UUID PRIMARY KEY,
            cluster_id TEXT NOT NULL,
            terminal BOOLEAN NOT NULL,
            document JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS clusterforge.host_requests (
            id BIGINT PRIMARY KEY,
            request_id UUID NOT NULL,
            cluster_id TEXT NOT NULL,
            hostname TEXT NOT NULL,
            status host_request_status NOT NULL,
            document JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_host_requests_status ON clusterforge.host_requests (status)",
        "CREATE INDEX IF NOT EXISTS idx_host_requests_request ON clusterforge.host_requests (request_id)",
        r#"
        CREATE TABLE IF NOT EXISTS clusterforge.host_components (
            cluster_id TEXT NOT NULL,
            hostname TEXT NOT NULL,
            service TEXT NOT NULL,
            component TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (cluster_id, hostname, service, component)
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("✓ clusterforge schema ready");
    Ok(())
}

/// Topology state in PostgreSQL, one JSONB document per record
#[derive(Clone)]
pub struct PgTopologyStore {
    pool: PgPool,
}

impl PgTopologyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn host_requests_from(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<HostRequest>, StoreError> {
    rows.into_iter()
        .map(|row| {
            let Json(request): Json<HostRequest> = row.try_get("document")?;
            Ok(request)
        })
        .collect()
}

#[async_trait]
impl TopologyStore for PgTopologyStore {
    async fn save_host_request(&self, request: &HostRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO clusterforge.host_requests
            (id, request_id, cluster_id, hostname, status, document)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(request.id() as i64)
        .bind(request.request_id())
        .bind(request.cluster_id())
        .bind(request.hostname())
        .bind(request.status())
        .bind(Json(request))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_non_terminal_host_requests(&self) -> Result<Vec<HostRequest>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT document
            FROM clusterforge.host_requests
            WHERE status IN ($1, $2)
            ORDER BY id
            "#,
        )
        .bind(HostRequestStatus::Pending)
        .bind(HostRequestStatus::InProgress)
        .fetch_all(&self.pool)
        .await?;
        host_requests_from(rows)
    }

    async fn load_host_requests(&self, request_id: RequestId) -> Result<Vec<HostRequest>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT document
            FROM clusterforge.host_requests
            WHERE request_id = $1
            ORDER BY id
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        host_requests_from(rows)
    }

    async fn save_topology(&self, topology: &ClusterTopology) -> Result<(), StoreError> {
        // Revisions are immutable; a replayed save is a no-op
        sqlx::query(
            r#"
            INSERT INTO clusterforge.topologies (cluster_id, revision, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (cluster_id, revision) DO NOTHING
            "#,
        )
        .bind(topology.cluster_id())
        .bind(topology.revision() as i32)
        .bind(Json(topology))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_topology(&self, cluster_id: &str) -> Result<Option<ClusterTopology>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT document
            FROM clusterforge.topologies
            WHERE cluster_id = $1
            ORDER BY revision DESC
            LIMIT 1
            "#,
        )
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let Json(topology): Json<ClusterTopology> = row.try_get("document")?;
                Ok(Some(topology))
            }
            None => Ok(None),
        }
    }

    async fn save_cluster_request(&self, request: &ClusterRequestRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO clusterforge.cluster_requests (id, cluster_id, terminal, document)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET terminal = EXCLUDED.terminal,
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(request.id)
        .bind(&request.cluster_id)
        .bind(request.status.is_terminal())
        .bind(Json(request))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_open_cluster_requests(&self) -> Result<Vec<ClusterRequestRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT document
            FROM clusterforge.cluster_requests
            WHERE NOT terminal
            ORDER BY updated_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let Json(request): Json<ClusterRequestRecord> = row.try_get("document")?;
                Ok(request)
            })
            .collect()
    }
}

/// Host component records in PostgreSQL
#[derive(Clone)]
pub struct PgResourceProvider {
    pool: PgPool,
}

impl PgResourceProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResourceProvider for PgResourceProvider {
    async fn create_host_resources(
        &self,
        cluster_id: &str,
        hostname: &str,
        components: &[ServiceComponent],
    ) -> Result<ResourceCreation, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ResourceCreation::default();

        for sc in components {
            let result = sqlx::query(
                r#"
                INSERT INTO clusterforge.host_components (cluster_id, hostname, service, component)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (cluster_id, hostname, service, component) DO NOTHING
                "#,
            )
            .bind(cluster_id)
            .bind(hostname)
            .bind(&sc.service)
            .bind(&sc.component)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                outcome.created += 1;
            } else {
                outcome.existing += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }
}
