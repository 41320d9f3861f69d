//! Collaborator implementations: in-memory (tests, single-process), PostgreSQL
//! persistence, agent command queues and broadcast notifications.

mod broadcast;
mod memory;
mod postgres;
mod queue;

pub use broadcast::BroadcastNotifier;
pub use memory::{InMemoryResourceProvider, InMemoryTopologyStore, StaticHostDirectory};
pub use postgres::{initialize_schema, PgResourceProvider, PgTopologyStore};
pub use queue::QueueDispatcher;
