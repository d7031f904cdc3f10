//! Artifact approval engine - multi-step quorum/veto review workflows

pub mod api;
pub mod approval;
pub mod config;
pub mod error;
pub mod models;
pub mod store;

use sqlx::migrate::Migrator;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::approval::ApprovalEngine;

/// Schema migrations, embedded at compile time
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Application state shared across handlers
pub struct AppState {
    pub engine: ApprovalEngine,
}

impl AppState {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Self::with_engine(ApprovalEngine::new(store::Store::new(pool)))
    }

    pub fn with_engine(engine: ApprovalEngine) -> Arc<Self> {
        Arc::new(Self { engine })
    }
}
