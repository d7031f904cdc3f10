//! Server configuration from CLI arguments and environment variables

use clap::Parser;
use std::net::SocketAddr;

/// Approval engine server
#[derive(Parser, Debug, Clone)]
#[command(name = "approvals")]
#[command(about = "Artifact approval engine server")]
#[command(version)]
pub struct Config {
    /// SQLite connection string
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:approvals.db?mode=rwc")]
    pub database_url: String,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Maximum pooled database connections
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Do not run embedded migrations at startup (schema managed elsewhere)
    #[arg(long, env = "SKIP_MIGRATIONS")]
    pub skip_migrations: bool,

    /// Buffered approval events per subscriber
    #[arg(long, env = "EVENT_BUFFER", default_value_t = 256)]
    pub event_buffer: usize,
}
