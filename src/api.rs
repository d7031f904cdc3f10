//! HTTP handlers over the approval engine

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::approval::{CanAct, ProgressSnapshot};
use crate::error::{AppError, Result};
use crate::models::{DecideRequest, Decision, StatusTriple};
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/artifacts/:artifact_id/decisions",
            post(decide).get(list_decisions),
        )
        .route("/artifacts/:artifact_id/progress", get(progress))
        .route("/artifacts/:artifact_id/can-act", get(can_act))
        .route("/artifacts/:artifact_id/reconcile", post(reconcile))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn decide(
    State(state): State<Arc<AppState>>,
    Path(artifact_id): Path<Uuid>,
    Json(request): Json<DecideRequest>,
) -> Result<Json<StatusTriple>> {
    let actor_user_id = request
        .actor_user_id
        .ok_or_else(|| AppError::Validation("Missing actor_user_id".to_string()))?;
    let reason = request.reason.as_deref();

    let outcome = match request.step_id {
        Some(step_id) => {
            state
                .engine
                .decide_on_step(
                    artifact_id,
                    step_id,
                    actor_user_id,
                    &request.decision,
                    reason,
                )
                .await?
        }
        None => {
            state
                .engine
                .decide(artifact_id, actor_user_id, &request.decision, reason)
                .await?
        }
    };
    Ok(Json(outcome))
}

async fn list_decisions(
    State(state): State<Arc<AppState>>,
    Path(artifact_id): Path<Uuid>,
) -> Result<Json<Vec<Decision>>> {
    Ok(Json(state.engine.list_decisions(artifact_id).await?))
}

#[derive(Debug, Deserialize)]
struct ProgressQuery {
    caller: Option<Uuid>,
}

async fn progress(
    State(state): State<Arc<AppState>>,
    Path(artifact_id): Path<Uuid>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<Option<ProgressSnapshot>>> {
    Ok(Json(
        state.engine.get_progress(artifact_id, query.caller).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct CanActQuery {
    actor: Uuid,
}

async fn can_act(
    State(state): State<Arc<AppState>>,
    Path(artifact_id): Path<Uuid>,
    Query(query): Query<CanActQuery>,
) -> Result<Json<CanAct>> {
    Ok(Json(state.engine.can_act(artifact_id, query.actor).await?))
}

async fn reconcile(
    State(state): State<Arc<AppState>>,
    Path(artifact_id): Path<Uuid>,
) -> Result<Json<Option<StatusTriple>>> {
    Ok(Json(state.engine.reconcile(artifact_id).await?))
}
