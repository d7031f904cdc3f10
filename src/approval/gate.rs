//! Authorization gate
//!
//! Answers "can this actor decide on this artifact's step right now?".
//! Nothing here is cached: approver sets and delegation windows are
//! re-read on every call.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::delegation::{DelegationResolver, Principal};
use super::resolver::ApproverResolver;
use crate::error::{AppError, Result};
use crate::models::{ApprovalChain, ApprovalStep, Artifact, StepStatus};
use crate::store::Store;

/// The step currently awaiting decisions, with its resolved approvers
#[derive(Debug, Clone)]
pub struct PendingStep {
    pub artifact: Artifact,
    pub chain: ApprovalChain,
    pub step: ApprovalStep,
    pub approvers: BTreeSet<Uuid>,
}

/// Result of a side-effect free eligibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanAct {
    pub can_act: bool,
    /// The approver being covered when acting through a delegation
    pub on_behalf_of: Option<Uuid>,
}

impl CanAct {
    pub fn denied() -> Self {
        Self {
            can_act: false,
            on_behalf_of: None,
        }
    }
}

impl From<Option<Principal>> for CanAct {
    fn from(principal: Option<Principal>) -> Self {
        match principal {
            Some(p) => Self {
                can_act: true,
                on_behalf_of: p.via_delegation.then_some(p.user_id),
            },
            None => Self::denied(),
        }
    }
}

#[derive(Clone)]
pub struct AuthorizationGate {
    store: Store,
    approvers: ApproverResolver,
    delegations: DelegationResolver,
}

impl AuthorizationGate {
    pub fn new(store: Store) -> Self {
        Self {
            approvers: ApproverResolver::new(store.clone()),
            delegations: DelegationResolver::new(store.clone()),
            store,
        }
    }

    pub async fn resolve_approvers(&self, step_id: Uuid) -> Result<BTreeSet<Uuid>> {
        self.approvers.resolve_step(step_id).await
    }

    pub async fn principal_for(
        &self,
        approvers: &BTreeSet<Uuid>,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Principal>> {
        self.delegations.resolve(actor, approvers, now).await
    }

    /// Locate the single pending step of the artifact's chain.
    ///
    /// `None` when the schema has no approval tables, the artifact was never
    /// submitted, its chain is finished, or no step is pending.
    pub async fn pending_step(&self, artifact_id: Uuid) -> Result<Option<PendingStep>> {
        if !self.store.capabilities().await?.approval_tables {
            return Ok(None);
        }

        let artifact = self.store.get_artifact(artifact_id).await?;
        let chain = match self.store.current_chain(&artifact).await? {
            Some(chain) if !chain.status.is_terminal() => chain,
            _ => return Ok(None),
        };

        let pending: Vec<ApprovalStep> = self
            .store
            .list_steps(chain.id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Pending)
            .collect();
        if pending.len() > 1 {
            tracing::warn!(
                chain_id = %chain.id,
                count = pending.len(),
                "Chain has more than one pending step, using the lowest order"
            );
        }
        let Some(step) = pending.into_iter().next() else {
            return Ok(None);
        };

        let approvers = self.resolve_approvers(step.id).await?;
        if approvers.is_empty() {
            tracing::warn!(step_id = %step.id, "Pending step has no active approvers");
        }

        Ok(Some(PendingStep {
            artifact,
            chain,
            step,
            approvers,
        }))
    }

    /// Eligibility of `actor` without recording anything
    pub async fn evaluate(
        &self,
        artifact_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<(PendingStep, Option<Principal>)>> {
        let Some(pending) = self.pending_step(artifact_id).await? else {
            return Ok(None);
        };
        let principal = self.principal_for(&pending.approvers, actor, now).await?;
        Ok(Some((pending, principal)))
    }

    /// Must run immediately before every decision write.
    ///
    /// With `expected_step` set, a chain that has moved past (or not yet
    /// reached) that step is refused before eligibility is considered.
    pub async fn authorize(
        &self,
        artifact_id: Uuid,
        expected_step: Option<Uuid>,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(PendingStep, Principal)> {
        let (pending, principal) = self
            .evaluate(artifact_id, actor, now)
            .await?
            .ok_or(AppError::NoPendingStep(artifact_id))?;

        if let Some(step_id) = expected_step {
            if pending.step.id != step_id {
                return Err(AppError::StepNotPending(step_id));
            }
        }

        match principal {
            Some(principal) => Ok((pending, principal)),
            None => Err(AppError::Forbidden(format!(
                "User {} is not an approver for step '{}'",
                actor, pending.step.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApproverRef;
    use crate::store::NewStep;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        crate::MIGRATOR
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        Store::new(pool)
    }

    async fn submit(store: &Store, steps: &[NewStep]) -> (Uuid, Vec<ApprovalStep>) {
        let artifact = store
            .create_artifact(Uuid::new_v4(), "Budget")
            .await
            .unwrap();
        let (_, steps) = store.provision_chain(artifact.id, steps).await.unwrap();
        (artifact.id, steps)
    }

    #[tokio::test]
    async fn test_authorize_self() {
        let store = setup_test_db().await;
        let alice = Uuid::new_v4();
        let (artifact_id, _) = submit(
            &store,
            &[NewStep::new("Review").approver(ApproverRef::User(alice))],
        )
        .await;

        let gate = AuthorizationGate::new(store);
        let (pending, principal) = gate
            .authorize(artifact_id, None, alice, Utc::now())
            .await
            .unwrap();
        assert_eq!(principal, Principal::own(alice));
        assert_eq!(pending.step.name, "Review");
    }

    #[tokio::test]
    async fn test_authorize_forbidden_for_stranger() {
        let store = setup_test_db().await;
        let owner = Uuid::new_v4();
        let (artifact_id, _) = submit(
            &store,
            &[NewStep::new("Review").approver(ApproverRef::User(owner))],
        )
        .await;

        let gate = AuthorizationGate::new(store);
        let result = gate
            .authorize(artifact_id, None, Uuid::new_v4(), Utc::now())
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_authorize_through_delegation_window() {
        let store = setup_test_db().await;
        let alice = Uuid::new_v4();
        let deputy = Uuid::new_v4();
        let now = Utc::now();
        let (artifact_id, _) = submit(
            &store,
            &[NewStep::new("Review").approver(ApproverRef::User(alice))],
        )
        .await;
        store
            .add_delegation(
                alice,
                deputy,
                Some(now - Duration::days(1)),
                Some(now + Duration::days(1)),
            )
            .await
            .unwrap();

        let gate = AuthorizationGate::new(store);
        let (_, principal) = gate
            .authorize(artifact_id, None, deputy, now)
            .await
            .unwrap();
        assert_eq!(principal, Principal::delegated(alice));

        let later = now + Duration::days(2);
        let result = gate.authorize(artifact_id, None, deputy, later).await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_authorize_expected_step() {
        let store = setup_test_db().await;
        let alice = Uuid::new_v4();
        let (artifact_id, steps) = submit(
            &store,
            &[
                NewStep::new("Review").approver(ApproverRef::User(alice)),
                NewStep::new("Sign-off").approver(ApproverRef::User(alice)),
            ],
        )
        .await;

        let gate = AuthorizationGate::new(store);
        let (pending, _) = gate
            .authorize(artifact_id, Some(steps[0].id), alice, Utc::now())
            .await
            .unwrap();
        assert_eq!(pending.step.id, steps[0].id);

        // Step 2 is still waiting
        let result = gate
            .authorize(artifact_id, Some(steps[1].id), alice, Utc::now())
            .await;
        assert!(matches!(result, Err(AppError::StepNotPending(id)) if id == steps[1].id));
    }

    #[tokio::test]
    async fn test_expected_step_checked_before_eligibility() {
        let store = setup_test_db().await;
        let owner = Uuid::new_v4();
        let (artifact_id, _) = submit(
            &store,
            &[NewStep::new("Review").approver(ApproverRef::User(owner))],
        )
        .await;

        let gate = AuthorizationGate::new(store);
        let stale = Uuid::new_v4();
        let result = gate
            .authorize(artifact_id, Some(stale), Uuid::new_v4(), Utc::now())
            .await;
        assert!(matches!(result, Err(AppError::StepNotPending(id)) if id == stale));
    }

    #[tokio::test]
    async fn test_no_pending_step_for_draft_artifact() {
        let store = setup_test_db().await;
        let artifact = store
            .create_artifact(Uuid::new_v4(), "Draft")
            .await
            .unwrap();

        let gate = AuthorizationGate::new(store);
        let result = gate
            .authorize(artifact.id, None, Uuid::new_v4(), Utc::now())
            .await;
        assert!(matches!(result, Err(AppError::NoPendingStep(id)) if id == artifact.id));
    }

    #[tokio::test]
    async fn test_empty_approver_set_blocks() {
        let store = setup_test_db().await;
        let alice = Uuid::new_v4();
        let (artifact_id, steps) = submit(
            &store,
            &[NewStep::new("Review").approver(ApproverRef::User(alice))],
        )
        .await;
        store.deactivate_step_approvers(steps[0].id).await.unwrap();

        let gate = AuthorizationGate::new(store);
        let result = gate.authorize(artifact_id, None, alice, Utc::now()).await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[test]
    fn test_can_act_from_principal() {
        let alice = Uuid::new_v4();
        assert_eq!(
            CanAct::from(Some(Principal::own(alice))),
            CanAct {
                can_act: true,
                on_behalf_of: None,
            }
        );
        assert_eq!(
            CanAct::from(Some(Principal::delegated(alice))),
            CanAct {
                can_act: true,
                on_behalf_of: Some(alice),
            }
        );
        assert_eq!(CanAct::from(None), CanAct::denied());
    }
}
