//! Decision ledger writes

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Decision, DecisionValue};
use crate::store::Store;

/// A vote to be written against a step
#[derive(Debug, Clone)]
pub struct NewDecision {
    pub chain_id: Uuid,
    pub step_id: Uuid,
    /// Approver of record
    pub principal: Uuid,
    /// Who physically acted
    pub actor: Uuid,
    pub decision: DecisionValue,
    pub reason: Option<String>,
}

impl NewDecision {
    pub fn validate(&self) -> Result<()> {
        let ids = [
            ("chain id", self.chain_id),
            ("step id", self.step_id),
            ("principal", self.principal),
            ("actor", self.actor),
        ];
        for (field, id) in ids {
            if id.is_nil() {
                return Err(AppError::Validation(format!("Missing {}", field)));
            }
        }
        Ok(())
    }
}

/// Parse a decision value, accepting exactly `approved` or `rejected`
pub fn parse_decision(value: &str) -> Result<DecisionValue> {
    value.parse().map_err(AppError::Validation)
}

#[derive(Clone)]
pub struct DecisionRecorder {
    store: Store,
}

impl DecisionRecorder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Upsert the decision keyed by (chain, step, principal).
    ///
    /// Writes only the ledger; step and chain status are left to recompute.
    pub async fn record(&self, decision: &NewDecision, now: DateTime<Utc>) -> Result<Decision> {
        decision.validate()?;

        let reason = decision
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());

        let recorded = self
            .store
            .upsert_decision(
                decision.chain_id,
                decision.step_id,
                decision.principal,
                decision.actor,
                decision.decision,
                reason,
                now,
            )
            .await?;

        tracing::debug!(
            chain_id = %recorded.chain_id,
            step_id = %recorded.step_id,
            approver = %recorded.approver_user_id,
            actor = %recorded.actor_user_id,
            decision = recorded.decision.as_str(),
            "Recorded decision"
        );
        Ok(recorded)
    }
}
