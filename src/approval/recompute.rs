//! State recomputation
//!
//! Re-evaluates a step from the stored tally and cascades the outcome to
//! the chain and artifact. The result depends only on stored decisions, so
//! running it again after a crash or a retry never applies a transition
//! twice.

use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    ApprovalStep, ArtifactStatus, ChainStatus, DecisionMode, StatusTriple, StepStatus, Tally,
};
use crate::store::{Store, Transition};

/// Outcome of applying a step's thresholds to its tally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Approved,
    Rejected,
}

/// Evaluate a step's thresholds. Rejection takes priority over approval.
pub fn evaluate(step: &ApprovalStep, tally: Tally) -> Verdict {
    match step.mode {
        DecisionMode::QuorumVeto => {
            if tally.rejections > step.max_rejections {
                Verdict::Rejected
            } else if tally.approvals >= step.required_approvals() {
                Verdict::Approved
            } else {
                Verdict::Pending
            }
        }
    }
}

/// A transition this caller actually performed
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub verdict: Verdict,
    pub step: ApprovalStep,
    /// Step that became pending as a result
    pub activated: Option<ApprovalStep>,
    pub chain_status: ChainStatus,
}

#[derive(Debug, Clone)]
pub struct Recomputed {
    pub outcome: StatusTriple,
    /// `None` when nothing changed, including when a concurrent caller won
    pub applied: Option<AppliedTransition>,
}

#[derive(Clone)]
pub struct RecomputeEngine {
    store: Store,
}

impl RecomputeEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn recompute(
        &self,
        artifact_id: Uuid,
        chain_id: Uuid,
        step_id: Uuid,
    ) -> Result<Recomputed> {
        let step = self.store.get_step(step_id).await?;
        if step.chain_id != chain_id {
            return Err(AppError::Validation(format!(
                "Step {} does not belong to chain {}",
                step_id, chain_id
            )));
        }

        if step.status != StepStatus::Pending {
            return self.unchanged(artifact_id, chain_id, step_id).await;
        }

        let tally = self.store.tally(chain_id, step_id).await?;
        let verdict = evaluate(&step, tally);
        tracing::debug!(
            %step_id,
            approvals = tally.approvals,
            rejections = tally.rejections,
            required = step.required_approvals(),
            max_rejections = step.max_rejections,
            ?verdict,
            "Evaluated step"
        );

        let (transition, activated) = match verdict {
            Verdict::Pending => return self.unchanged(artifact_id, chain_id, step_id).await,
            Verdict::Rejected => (
                Transition {
                    artifact_id,
                    chain_id,
                    step_id,
                    step_status: StepStatus::Rejected,
                    activate_step_id: None,
                    chain_status: ChainStatus::Rejected,
                    chain_active: false,
                    artifact_status: Some(ArtifactStatus::Rejected),
                },
                None,
            ),
            Verdict::Approved => match self.store.next_step(chain_id, step.step_order).await? {
                Some(next) => {
                    let activated = (next.status == StepStatus::Waiting).then_some(next);
                    (
                        Transition {
                            artifact_id,
                            chain_id,
                            step_id,
                            step_status: StepStatus::Approved,
                            activate_step_id: activated.as_ref().map(|s| s.id),
                            chain_status: ChainStatus::Active,
                            chain_active: true,
                            artifact_status: None,
                        },
                        activated,
                    )
                }
                None => (
                    Transition {
                        artifact_id,
                        chain_id,
                        step_id,
                        step_status: StepStatus::Approved,
                        activate_step_id: None,
                        chain_status: ChainStatus::Approved,
                        chain_active: false,
                        artifact_status: Some(ArtifactStatus::Approved),
                    },
                    None,
                ),
            },
        };

        if !self.store.apply_transition(&transition).await? {
            tracing::warn!(
                %step_id,
                "Step already moved by a concurrent decision, skipping cascade"
            );
            return self.unchanged(artifact_id, chain_id, step_id).await;
        }

        tracing::info!(
            %artifact_id,
            %chain_id,
            %step_id,
            step_status = transition.step_status.as_str(),
            chain_status = transition.chain_status.as_str(),
            activated = ?transition.activate_step_id,
            "Applied approval transition"
        );

        let outcome = self.current(artifact_id, chain_id, step_id).await?;
        let mut step = step;
        step.status = transition.step_status;
        let activated = activated.map(|mut s| {
            s.status = StepStatus::Pending;
            s
        });

        Ok(Recomputed {
            outcome,
            applied: Some(AppliedTransition {
                verdict,
                step,
                activated,
                chain_status: transition.chain_status,
            }),
        })
    }

    async fn unchanged(
        &self,
        artifact_id: Uuid,
        chain_id: Uuid,
        step_id: Uuid,
    ) -> Result<Recomputed> {
        Ok(Recomputed {
            outcome: self.current(artifact_id, chain_id, step_id).await?,
            applied: None,
        })
    }

    async fn current(
        &self,
        artifact_id: Uuid,
        chain_id: Uuid,
        step_id: Uuid,
    ) -> Result<StatusTriple> {
        let step = self.store.get_step(step_id).await?;
        let chain = self.store.get_chain(chain_id).await?;
        let artifact = self.store.get_artifact(artifact_id).await?;
        Ok(StatusTriple {
            step_status: step.status,
            chain_status: chain.status,
            artifact_status: artifact.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionValue;
    use crate::store::NewStep;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    fn step(min_approvals: Option<i64>, max_rejections: i64) -> ApprovalStep {
        ApprovalStep {
            id: Uuid::new_v4(),
            chain_id: Uuid::new_v4(),
            step_order: 1,
            name: "Review".to_string(),
            mode: DecisionMode::QuorumVeto,
            min_approvals,
            max_rejections,
            status: StepStatus::Pending,
            updated_at: Utc::now(),
        }
    }

    fn tally(approvals: i64, rejections: i64) -> Tally {
        Tally {
            approvals,
            rejections,
        }
    }

    #[test]
    fn test_zero_max_rejections_vetoes_on_first_rejection() {
        let s = step(Some(1), 0);
        assert_eq!(evaluate(&s, tally(0, 0)), Verdict::Pending);
        assert_eq!(evaluate(&s, tally(0, 1)), Verdict::Rejected);
    }

    #[test]
    fn test_max_rejections_is_strict() {
        let s = step(Some(5), 2);
        assert_eq!(evaluate(&s, tally(0, 2)), Verdict::Pending);
        assert_eq!(evaluate(&s, tally(0, 3)), Verdict::Rejected);
    }

    #[test]
    fn test_rejection_takes_priority_over_approval() {
        let s = step(Some(1), 0);
        assert_eq!(evaluate(&s, tally(3, 1)), Verdict::Rejected);
    }

    #[test]
    fn test_min_approvals_threshold() {
        let s = step(Some(2), 0);
        assert_eq!(evaluate(&s, tally(1, 0)), Verdict::Pending);
        assert_eq!(evaluate(&s, tally(2, 0)), Verdict::Approved);
    }

    #[test]
    fn test_unset_min_approvals_needs_one() {
        let s = step(None, 0);
        assert_eq!(evaluate(&s, tally(0, 0)), Verdict::Pending);
        assert_eq!(evaluate(&s, tally(1, 0)), Verdict::Approved);
    }

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

    #[tokio::test]
    async fn test_recompute_twice_is_idempotent() {
        let store = setup_test_db().await;
        let artifact = store.create_artifact(Uuid::new_v4(), "Plan").await.unwrap();
        let (chain, steps) = store
            .provision_chain(artifact.id, &[NewStep::new("One"), NewStep::new("Two")])
            .await
            .unwrap();
        let alice = Uuid::new_v4();
        store
            .upsert_decision(
                chain.id,
                steps[0].id,
                alice,
                alice,
                DecisionValue::Approved,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        let engine = RecomputeEngine::new(store.clone());
        let first = engine
            .recompute(artifact.id, chain.id, steps[0].id)
            .await
            .unwrap();
        let second = engine
            .recompute(artifact.id, chain.id, steps[0].id)
            .await
            .unwrap();

        assert!(first.applied.is_some());
        assert!(second.applied.is_none());
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.outcome.step_status, StepStatus::Approved);

        let stored = store.list_steps(chain.id).await.unwrap();
        assert_eq!(
            stored
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_recompute_without_votes_changes_nothing() {
        let store = setup_test_db().await;
        let artifact = store.create_artifact(Uuid::new_v4(), "Plan").await.unwrap();
        let (chain, steps) = store
            .provision_chain(artifact.id, &[NewStep::new("One")])
            .await
            .unwrap();

        let engine = RecomputeEngine::new(store);
        let result = engine
            .recompute(artifact.id, chain.id, steps[0].id)
            .await
            .unwrap();
        assert!(result.applied.is_none());
        assert_eq!(
            result.outcome,
            StatusTriple {
                step_status: StepStatus::Pending,
                chain_status: ChainStatus::Active,
                artifact_status: ArtifactStatus::Submitted,
            }
        );
    }

    #[tokio::test]
    async fn test_recompute_rejects_foreign_step() {
        let store = setup_test_db().await;
        let artifact = store.create_artifact(Uuid::new_v4(), "Plan").await.unwrap();
        let (_, steps) = store
            .provision_chain(artifact.id, &[NewStep::new("One")])
            .await
            .unwrap();

        let engine = RecomputeEngine::new(store);
        let result = engine
            .recompute(artifact.id, Uuid::new_v4(), steps[0].id)
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
