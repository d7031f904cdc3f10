//! Approval engine server

use approvals::approval::ApprovalEngine;
use approvals::config::Config;
use approvals::store::Store;
use approvals::{api, AppState, MIGRATOR};
use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "approvals=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    // Database connection
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;

    if config.skip_migrations {
        tracing::info!("Skipping migrations");
    } else {
        MIGRATOR.run(&pool).await?;
    }

    let store = Store::new(pool);
    let caps = store.capabilities().await?;
    if !caps.approval_tables {
        tracing::warn!("Approval tables missing, every artifact will report no workflow");
    }

    let engine = ApprovalEngine::with_event_capacity(store, config.event_buffer);
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(?event, "Approval event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Approval event log lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let state = AppState::with_engine(engine);

    // Build router
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
