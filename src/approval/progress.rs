//! Read-only progress snapshots for display

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::gate::{AuthorizationGate, CanAct};
use crate::error::Result;
use crate::models::{ArtifactStatus, ChainStatus, StepStatus};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub artifact_id: Uuid,
    pub artifact_status: ArtifactStatus,
    pub chain_id: Uuid,
    pub chain_status: ChainStatus,
    pub total_steps: usize,
    pub approved_steps: usize,
    pub rejected_steps: usize,
    pub pending_steps: usize,
    pub current_step: Option<StepProgress>,
    /// Present when the snapshot was requested for a specific caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<CanAct>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepProgress {
    pub step_id: Uuid,
    pub step_order: i64,
    pub name: String,
    pub min_approvals: i64,
    pub max_rejections: i64,
    pub approvals: i64,
    pub rejections: i64,
    pub approver_count: usize,
    /// Active approvers who have not voted yet
    pub remaining_approvers: usize,
    /// No active approver is bound, so the step cannot progress
    pub needs_reassignment: bool,
}

#[derive(Clone)]
pub struct ProgressReporter {
    store: Store,
    gate: AuthorizationGate,
}

impl ProgressReporter {
    pub fn new(store: Store, gate: AuthorizationGate) -> Self {
        Self { store, gate }
    }

    /// Build a snapshot of the artifact's current chain.
    ///
    /// Returns `None` for artifacts that never entered review and for
    /// deployments without approval tables. Never writes.
    pub async fn snapshot(
        &self,
        artifact_id: Uuid,
        caller: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProgressSnapshot>> {
        if !self.store.capabilities().await?.approval_tables {
            return Ok(None);
        }

        let artifact = self.store.get_artifact(artifact_id).await?;
        let Some(chain) = self.store.current_chain(&artifact).await? else {
            return Ok(None);
        };

        let steps = self.store.list_steps(chain.id).await?;
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();

        let current = if chain.status.is_terminal() {
            None
        } else {
            steps.iter().find(|s| s.status == StepStatus::Pending)
        };

        let mut caller_can_act = caller.map(|_| CanAct::denied());
        let current_step = match current {
            Some(step) => {
                let approvers = self.gate.resolve_approvers(step.id).await?;
                let decided = self.store.decided_approvers(chain.id, step.id).await?;
                let tally = self.store.tally(chain.id, step.id).await?;
                let remaining = approvers.iter().filter(|a| !decided.contains(a)).count();

                if let Some(caller) = caller {
                    let principal = self.gate.principal_for(&approvers, caller, now).await?;
                    caller_can_act = Some(CanAct::from(principal));
                }

                Some(StepProgress {
                    step_id: step.id,
                    step_order: step.step_order,
                    name: step.name.clone(),
                    min_approvals: step.required_approvals(),
                    max_rejections: step.max_rejections,
                    approvals: tally.approvals,
                    rejections: tally.rejections,
                    approver_count: approvers.len(),
                    remaining_approvers: remaining,
                    needs_reassignment: approvers.is_empty(),
                })
            }
            None => None,
        };

        Ok(Some(ProgressSnapshot {
            artifact_id,
            artifact_status: artifact.status,
            chain_id: chain.id,
            chain_status: chain.status,
            total_steps: steps.len(),
            approved_steps: count(StepStatus::Approved),
            rejected_steps: count(StepStatus::Rejected),
            pending_steps: count(StepStatus::Pending),
            current_step,
            caller: caller_can_act,
        }))
    }
}
