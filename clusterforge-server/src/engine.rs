use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use clusterforge_topology::adapters::{
    BroadcastNotifier, InMemoryResourceProvider, InMemoryTopologyStore, PgResourceProvider,
    PgTopologyStore, QueueDispatcher, StaticHostDirectory,
};
use clusterforge_topology::ports::{ResourceProvider, TopologyEvent, TopologyStore};
use clusterforge_topology::{ClusterTopology, Collaborators, TopologyManager};

use crate::config::Config;
use crate::db;

/// The topology manager together with the adapters the API talks to directly
pub struct Engine {
    pub manager: Arc<TopologyManager>,
    pub dispatcher: Arc<QueueDispatcher>,
    pub directory: Arc<StaticHostDirectory>,
}

/// Build the collaborators, recover durable state and start the event logger
pub async fn initialize(config: &Config) -> Result<Engine> {
    let (store, resources): (Arc<dyn TopologyStore>, Arc<dyn ResourceProvider>) =
        match &config.database_url {
            Some(url) => {
                info!("Connecting to PostgreSQL store");
                let store = PgTopologyStore::connect(url)
                    .await
                    .context("Failed to connect to database")?;
                db::initialize_schema(store.pool()).await?;
                db::verify_tables(store.pool()).await?;
                let resources = PgResourceProvider::new(store.pool().clone());
                (Arc::new(store), Arc::new(resources))
            }
            None => {
                warn!("DATABASE_URL not set, provisioning state is kept in memory only");
                (
                    Arc::new(InMemoryTopologyStore::new()),
                    Arc::new(InMemoryResourceProvider::new()),
                )
            }
        };

    let dispatcher = match config.max_queued_per_host {
        Some(limit) => QueueDispatcher::new().with_max_queued_per_host(limit),
        None => QueueDispatcher::new(),
    };
    let dispatcher = Arc::new(dispatcher);
    let directory = Arc::new(StaticHostDirectory::new());
    let notifier = Arc::new(BroadcastNotifier::default());

    let manager = Arc::new(TopologyManager::new(Collaborators {
        store,
        dispatcher: dispatcher.clone(),
        resources,
        directory: directory.clone(),
        notifier: notifier.clone(),
    }));

    // Subscribe before recovery so its events are logged too
    spawn_event_logger(notifier.subscribe());

    let report = manager
        .recover_on_startup()
        .await
        .context("Failed to recover provisioning state")?;
    info!(
        requests = report.requests,
        redispatched = report.redispatched,
        orphaned = report.orphaned,
        "✓ Topology engine recovered"
    );

    let assigned = seed_directory(&manager, &directory).await;
    debug!(assigned, "Host directory restored from recovered topologies");

    Ok(Engine {
        manager,
        dispatcher,
        directory,
    })
}

/// Record the hosts a topology's template assigns by name
pub async fn assign_topology_hosts(directory: &StaticHostDirectory, topology: &ClusterTopology) -> usize {
    let mut assigned = 0;
    directory.add_cluster(topology.cluster_id()).await;
    for group in topology.host_groups() {
        for hostname in group.hosts() {
            directory.assign(topology.cluster_id(), hostname, group.name()).await;
            assigned += 1;
        }
    }
    assigned
}

/// Re-learn template host assignments of every topology the manager holds
async fn seed_directory(manager: &TopologyManager, directory: &StaticHostDirectory) -> usize {
    let mut assigned = 0;
    for topology in manager.topologies().await {
        assigned += assign_topology_hosts(directory, &topology).await;
    }
    assigned
}

fn spawn_event_logger(mut events: broadcast::Receiver<TopologyEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TopologyEvent::HostRequestUpdated(summary)) => {
                    debug!(
                        hostname = %summary.hostname,
                        request_id = %summary.request_id,
                        status = %summary.status,
                        next_task = ?summary.next_task,
                        "Host request updated"
                    );
                }
                Ok(TopologyEvent::RequestFinished(progress)) => {
                    info!(
                        request_id = %progress.request_id,
                        cluster_id = %progress.cluster_id,
                        status = %progress.status,
                        completed = progress.completed,
                        failed = progress.failed,
                        "Provisioning request finished"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
