use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// ClusterForge - blueprint-based cluster provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the provisioning server (API + topology engine)
    Serve {
        /// API port (default: SERVER_PORT or 8080)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate a blueprint against a cluster template without a server
    Validate {
        /// Blueprint file (YAML or JSON)
        blueprint: PathBuf,

        /// Cluster template file (YAML or JSON)
        template: PathBuf,
    },

    /// Submit a blueprint and cluster template for provisioning
    Submit {
        /// Blueprint file (YAML or JSON)
        blueprint: PathBuf,

        /// Cluster template file (YAML or JSON)
        template: PathBuf,
    },

    /// Register a host with a cluster
    Register {
        hostname: String,

        /// Cluster the host belongs to
        cluster: String,

        /// Host group to assign the host to
        #[arg(short, long)]
        group: Option<String>,
    },

    /// List provisioning requests
    Requests {
        /// Output format
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Show progress of a provisioning request
    Progress {
        request_id: Uuid,

        /// Output format
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Abort a provisioning request
    Abort {
        request_id: Uuid,

        /// Reason recorded on every cancelled host
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Show the provisioning state of a host
    Host {
        hostname: String,

        /// Output format
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Retry a failed host from its failed task
    Retry { hostname: String },

    /// View server logs
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "100")]
        tail: usize,

        /// Only show lines containing this text, e.g. a hostname
        #[arg(long)]
        filter: Option<String>,
    },
}
