//! Approval engine
//!
//! The entry point request handlers call. It composes the gate, the decision
//! recorder and the recompute engine, and publishes the resulting status
//! transitions:
//! - `decide`: authorize, record the vote, recompute
//! - `decide_on_step`: same, pinned to the step the caller saw
//! - `can_act`: authorize without recording
//! - `get_progress`: read-only snapshot
//! - `reconcile`: recompute from the ledger without a new vote

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::gate::{AuthorizationGate, CanAct};
use super::progress::{ProgressReporter, ProgressSnapshot};
use super::recompute::{Recomputed, RecomputeEngine, Verdict};
use super::recorder::{parse_decision, DecisionRecorder, NewDecision};
use crate::error::{AppError, Result};
use crate::models::{ChainStatus, Decision, DecisionValue, StatusTriple};
use crate::store::Store;

/// Events emitted after committed changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalEvent {
    /// A vote was written (or overwritten) in the ledger
    DecisionRecorded {
        artifact_id: Uuid,
        chain_id: Uuid,
        step_id: Uuid,
        approver_user_id: Uuid,
        actor_user_id: Uuid,
        decision: DecisionValue,
    },
    StepApproved {
        artifact_id: Uuid,
        chain_id: Uuid,
        step_id: Uuid,
    },
    StepRejected {
        artifact_id: Uuid,
        chain_id: Uuid,
        step_id: Uuid,
    },
    /// The next step became pending
    StepActivated {
        artifact_id: Uuid,
        chain_id: Uuid,
        step_id: Uuid,
        step_order: i64,
        name: String,
    },
    ChainApproved {
        artifact_id: Uuid,
        chain_id: Uuid,
    },
    ChainRejected {
        artifact_id: Uuid,
        chain_id: Uuid,
    },
}

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct ApprovalEngine {
    store: Store,
    gate: AuthorizationGate,
    recorder: DecisionRecorder,
    recompute: RecomputeEngine,
    progress: ProgressReporter,
    event_tx: broadcast::Sender<ApprovalEvent>,
}

impl ApprovalEngine {
    pub fn new(store: Store) -> Self {
        Self::with_event_capacity(store, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(store: Store, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        let gate = AuthorizationGate::new(store.clone());
        Self {
            recorder: DecisionRecorder::new(store.clone()),
            recompute: RecomputeEngine::new(store.clone()),
            progress: ProgressReporter::new(store.clone(), gate.clone()),
            gate,
            store,
            event_tx,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Subscribe to approval events
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.event_tx.subscribe()
    }

    /// Record `actor`'s decision on the artifact's pending step.
    ///
    /// The pending step is looked up on every call. If a response is lost
    /// after the cascade activated the next step, a blind retry lands on that
    /// next step when the actor is bound to it too. Callers that retry should
    /// use [`decide_on_step`](Self::decide_on_step) instead.
    pub async fn decide(
        &self,
        artifact_id: Uuid,
        actor_user_id: Uuid,
        decision: &str,
        reason: Option<&str>,
    ) -> Result<StatusTriple> {
        self.decide_at(artifact_id, actor_user_id, decision, reason, Utc::now())
            .await
    }

    pub async fn decide_at(
        &self,
        artifact_id: Uuid,
        actor_user_id: Uuid,
        decision: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<StatusTriple> {
        self.record_and_recompute(artifact_id, None, actor_user_id, decision, reason, now)
            .await
    }

    /// Like `decide`, but only while `step_id` is the pending step.
    ///
    /// Fails with `StepNotPending` once the chain has moved on, so a
    /// repeated request can never vote on a later step.
    pub async fn decide_on_step(
        &self,
        artifact_id: Uuid,
        step_id: Uuid,
        actor_user_id: Uuid,
        decision: &str,
        reason: Option<&str>,
    ) -> Result<StatusTriple> {
        self.record_and_recompute(
            artifact_id,
            Some(step_id),
            actor_user_id,
            decision,
            reason,
            Utc::now(),
        )
        .await
    }

    #[tracing::instrument(skip(self, reason), fields(%artifact_id, %actor_user_id))]
    async fn record_and_recompute(
        &self,
        artifact_id: Uuid,
        expected_step: Option<Uuid>,
        actor_user_id: Uuid,
        decision: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<StatusTriple> {
        let decision = parse_decision(decision)?;
        if artifact_id.is_nil() || actor_user_id.is_nil() {
            return Err(AppError::Validation(
                "Artifact and actor are required".to_string(),
            ));
        }

        let (pending, principal) = self
            .gate
            .authorize(artifact_id, expected_step, actor_user_id, now)
            .await?;

        let recorded = self
            .recorder
            .record(
                &NewDecision {
                    chain_id: pending.chain.id,
                    step_id: pending.step.id,
                    principal: principal.user_id,
                    actor: actor_user_id,
                    decision,
                    reason: reason.map(str::to_string),
                },
                now,
            )
            .await?;
        self.publish_decision(artifact_id, &recorded);

        let recomputed = self
            .recompute
            .recompute(artifact_id, pending.chain.id, pending.step.id)
            .await?;
        self.publish_transition(artifact_id, &recomputed);

        Ok(recomputed.outcome)
    }

    /// Whether `actor` may decide now, and for whom
    pub async fn can_act(&self, artifact_id: Uuid, actor_user_id: Uuid) -> Result<CanAct> {
        self.can_act_at(artifact_id, actor_user_id, Utc::now())
            .await
    }

    pub async fn can_act_at(
        &self,
        artifact_id: Uuid,
        actor_user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CanAct> {
        Ok(match self.gate.evaluate(artifact_id, actor_user_id, now).await? {
            Some((_, principal)) => CanAct::from(principal),
            None => CanAct::denied(),
        })
    }

    pub async fn get_progress(
        &self,
        artifact_id: Uuid,
        caller: Option<Uuid>,
    ) -> Result<Option<ProgressSnapshot>> {
        self.get_progress_at(artifact_id, caller, Utc::now()).await
    }

    pub async fn get_progress_at(
        &self,
        artifact_id: Uuid,
        caller: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProgressSnapshot>> {
        self.progress.snapshot(artifact_id, caller, now).await
    }

    /// Re-run recomputation for the pending step from the stored tally.
    ///
    /// Finishes a cascade that was interrupted after the ledger write.
    /// `None` when there is no pending step.
    #[tracing::instrument(skip(self), fields(%artifact_id))]
    pub async fn reconcile(&self, artifact_id: Uuid) -> Result<Option<StatusTriple>> {
        let Some(pending) = self.gate.pending_step(artifact_id).await? else {
            return Ok(None);
        };

        let recomputed = self
            .recompute
            .recompute(artifact_id, pending.chain.id, pending.step.id)
            .await?;
        self.publish_transition(artifact_id, &recomputed);

        Ok(Some(recomputed.outcome))
    }

    /// Decisions of the artifact's current chain
    pub async fn list_decisions(&self, artifact_id: Uuid) -> Result<Vec<Decision>> {
        if !self.store.capabilities().await?.approval_tables {
            return Ok(Vec::new());
        }

        let artifact = self.store.get_artifact(artifact_id).await?;
        match self.store.current_chain(&artifact).await? {
            Some(chain) => self.store.list_decisions(chain.id).await,
            None => Ok(Vec::new()),
        }
    }

    fn publish_decision(&self, artifact_id: Uuid, decision: &Decision) {
        let _ = self.event_tx.send(ApprovalEvent::DecisionRecorded {
            artifact_id,
            chain_id: decision.chain_id,
            step_id: decision.step_id,
            approver_user_id: decision.approver_user_id,
            actor_user_id: decision.actor_user_id,
            decision: decision.decision,
        });
    }

    fn publish_transition(&self, artifact_id: Uuid, recomputed: &Recomputed) {
        let Some(applied) = &recomputed.applied else {
            return;
        };
        let chain_id = applied.step.chain_id;
        let step_id = applied.step.id;

        let step_event = match applied.verdict {
            Verdict::Approved => ApprovalEvent::StepApproved {
                artifact_id,
                chain_id,
                step_id,
            },
            Verdict::Rejected => ApprovalEvent::StepRejected {
                artifact_id,
                chain_id,
                step_id,
            },
            Verdict::Pending => return,
        };
        let _ = self.event_tx.send(step_event);

        if let Some(next) = &applied.activated {
            let _ = self.event_tx.send(ApprovalEvent::StepActivated {
                artifact_id,
                chain_id,
                step_id: next.id,
                step_order: next.step_order,
                name: next.name.clone(),
            });
        }

        match applied.chain_status {
            ChainStatus::Approved => {
                let _ = self.event_tx.send(ApprovalEvent::ChainApproved {
                    artifact_id,
                    chain_id,
                });
            }
            ChainStatus::Rejected => {
                let _ = self.event_tx.send(ApprovalEvent::ChainRejected {
                    artifact_id,
                    chain_id,
                });
            }
            ChainStatus::Active => {}
        }
    }
}
