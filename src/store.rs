//! Database store for artifacts, approval chains, steps, decisions and delegations

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    ApprovalChain, ApprovalStep, ApproverRef, Artifact, ArtifactStatus, ChainStatus, Decision,
    DecisionMode, DecisionValue, Delegation, StepApprover, StepStatus, Tally,
};

/// Optional parts of the schema, negotiated once per store.
///
/// Deployments differ in which approval tables and columns exist; the engine
/// consults these flags instead of probing with failing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Chains, steps, step approvers, decisions and artifacts are present
    pub approval_tables: bool,
    /// `project_members` exists, so membership bindings can be resolved
    pub membership_table: bool,
    /// `approval_step_approvers.member_id` exists
    pub member_approvers: bool,
    pub delegations_table: bool,
}

/// A cascading status change applied under one transaction.
///
/// The step write is a compare-and-swap on `pending`; if another caller
/// already moved the step, nothing is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub artifact_id: Uuid,
    pub chain_id: Uuid,
    pub step_id: Uuid,
    pub step_status: StepStatus,
    /// Step to flip from waiting to pending
    pub activate_step_id: Option<Uuid>,
    pub chain_status: ChainStatus,
    pub chain_active: bool,
    /// Only set when the chain reaches a final outcome
    pub artifact_status: Option<ArtifactStatus>,
}

/// A step definition used when provisioning a chain
#[derive(Debug, Clone)]
pub struct NewStep {
    pub name: String,
    pub min_approvals: Option<i64>,
    pub max_rejections: i64,
    pub approvers: Vec<ApproverRef>,
}

impl NewStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_approvals: None,
            max_rejections: 0,
            approvers: Vec::new(),
        }
    }

    pub fn min_approvals(mut self, n: i64) -> Self {
        self.min_approvals = Some(n);
        self
    }

    pub fn max_rejections(mut self, n: i64) -> Self {
        self.max_rejections = n;
        self
    }

    pub fn approver(mut self, approver: ApproverRef) -> Self {
        self.approvers.push(approver);
        self
    }
}

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    capabilities: Arc<OnceCell<Capabilities>>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            capabilities: Arc::new(OnceCell::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // Capability negotiation

    pub async fn capabilities(&self) -> Result<Capabilities> {
        self.capabilities
            .get_or_try_init(|| self.detect_capabilities())
            .await
            .copied()
    }

    async fn detect_capabilities(&self) -> Result<Capabilities> {
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&self.pool)
                .await?;
        let has = |name: &str| tables.iter().any(|t| t == name);

        let member_approvers = if has("approval_step_approvers") {
            let columns: Vec<String> = sqlx::query_scalar(
                "SELECT name FROM pragma_table_info('approval_step_approvers')",
            )
            .fetch_all(&self.pool)
            .await?;
            columns.iter().any(|c| c == "member_id")
        } else {
            false
        };

        let caps = Capabilities {
            approval_tables: has("artifacts")
                && has("approval_chains")
                && has("approval_steps")
                && has("approval_step_approvers")
                && has("approval_decisions"),
            membership_table: has("project_members"),
            member_approvers,
            delegations_table: has("approval_delegations"),
        };
        tracing::debug!(?caps, "Negotiated schema capabilities");
        Ok(caps)
    }

    // Artifact and chain reads

    pub async fn find_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT id, project_id, title, status, approval_chain_id, created_at, updated_at
            FROM artifacts
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Artifact::try_from).transpose()
    }

    pub async fn get_artifact(&self, id: Uuid) -> Result<Artifact> {
        self.find_artifact(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Artifact {} not found", id)))
    }

    pub async fn get_chain(&self, id: Uuid) -> Result<ApprovalChain> {
        let row = sqlx::query_as::<_, ChainRow>(
            r#"
            SELECT id, artifact_id, status, is_active, created_at, updated_at
            FROM approval_chains
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Approval chain {} not found", id)))?;

        row.try_into()
    }

    /// The chain referenced by the artifact, or its most recent chain when the
    /// reference was never written.
    pub async fn current_chain(&self, artifact: &Artifact) -> Result<Option<ApprovalChain>> {
        if let Some(chain_id) = artifact.approval_chain_id {
            return self.get_chain(chain_id).await.map(Some);
        }

        let row = sqlx::query_as::<_, ChainRow>(
            r#"
            SELECT id, artifact_id, status, is_active, created_at, updated_at
            FROM approval_chains
            WHERE artifact_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(artifact.id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ApprovalChain::try_from).transpose()
    }

    // Steps

    pub async fn get_step(&self, id: Uuid) -> Result<ApprovalStep> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, chain_id, step_order, name, mode, min_approvals, max_rejections, status, updated_at
            FROM approval_steps
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Approval step {} not found", id)))?;

        row.try_into()
    }

    /// All steps of a chain ordered by step order
    pub async fn list_steps(&self, chain_id: Uuid) -> Result<Vec<ApprovalStep>> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, chain_id, step_order, name, mode, min_approvals, max_rejections, status, updated_at
            FROM approval_steps
            WHERE chain_id = ?
            ORDER BY step_order ASC
            "#,
        )
        .bind(chain_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// The first step ordered strictly after `step_order`
    pub async fn next_step(&self, chain_id: Uuid, step_order: i64) -> Result<Option<ApprovalStep>> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, chain_id, step_order, name, mode, min_approvals, max_rejections, status, updated_at
            FROM approval_steps
            WHERE chain_id = ? AND step_order > ?
            ORDER BY step_order ASC
            LIMIT 1
            "#,
        )
        .bind(chain_id.to_string())
        .bind(step_order)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ApprovalStep::try_from).transpose()
    }

    // Approver bindings and membership

    /// Active approver bindings of a step
    pub async fn list_step_approvers(&self, step_id: Uuid) -> Result<Vec<StepApprover>> {
        let caps = self.capabilities().await?;
        let sql = if caps.member_approvers {
            r#"
            SELECT id, step_id, member_id, user_id, is_active
            FROM approval_step_approvers
            WHERE step_id = ? AND is_active = 1
            "#
        } else {
            r#"
            SELECT id, step_id, NULL AS member_id, user_id, is_active
            FROM approval_step_approvers
            WHERE step_id = ? AND is_active = 1
            "#
        };

        let rows = sqlx::query_as::<_, StepApproverRow>(sql)
            .bind(step_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Map active membership ids to their backing user ids
    pub async fn resolve_members(&self, member_ids: &[Uuid]) -> Result<HashMap<Uuid, Uuid>> {
        if member_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, user_id FROM project_members WHERE is_active = 1 AND id IN (",
        );
        let mut separated = query.separated(", ");
        for id in member_ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        let rows: Vec<(String, String)> = query.build_query_as().fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(member_id, user_id)| {
                Ok((
                    parse_uuid(&member_id, "member id")?,
                    parse_uuid(&user_id, "user id")?,
                ))
            })
            .collect()
    }

    // Delegations

    /// Active delegations granted to `delegate_user_id`, regardless of window
    pub async fn delegations_for_delegate(
        &self,
        delegate_user_id: Uuid,
    ) -> Result<Vec<Delegation>> {
        if !self.capabilities().await?.delegations_table {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, principal_user_id, delegate_user_id, starts_at, ends_at, is_active
            FROM approval_delegations
            WHERE delegate_user_id = ? AND is_active = 1
            ORDER BY created_at ASC
            "#,
        )
        .bind(delegate_user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    // Decisions

    /// Insert or overwrite the decision keyed by (chain, step, approver)
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_decision(
        &self,
        chain_id: Uuid,
        step_id: Uuid,
        approver_user_id: Uuid,
        actor_user_id: Uuid,
        decision: DecisionValue,
        reason: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<Decision> {
        sqlx::query(
            r#"
            INSERT INTO approval_decisions (id, chain_id, step_id, approver_user_id, actor_user_id, decision, reason, decided_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (chain_id, step_id, approver_user_id) DO UPDATE SET
                actor_user_id = excluded.actor_user_id,
                decision = excluded.decision,
                reason = excluded.reason,
                decided_at = excluded.decided_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(chain_id.to_string())
        .bind(step_id.to_string())
        .bind(approver_user_id.to_string())
        .bind(actor_user_id.to_string())
        .bind(decision.as_str())
        .bind(reason)
        .bind(decided_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, DecisionRow>(
            r#"
            SELECT id, chain_id, step_id, approver_user_id, actor_user_id, decision, reason, decided_at
            FROM approval_decisions
            WHERE chain_id = ? AND step_id = ? AND approver_user_id = ?
            "#,
        )
        .bind(chain_id.to_string())
        .bind(step_id.to_string())
        .bind(approver_user_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    pub async fn tally(&self, chain_id: Uuid, step_id: Uuid) -> Result<Tally> {
        let (approvals, rejections): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN decision = 'approved' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN decision = 'rejected' THEN 1 ELSE 0 END), 0)
            FROM approval_decisions
            WHERE chain_id = ? AND step_id = ?
            "#,
        )
        .bind(chain_id.to_string())
        .bind(step_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(Tally {
            approvals,
            rejections,
        })
    }

    /// Distinct approvers of record who have voted on a step
    pub async fn decided_approvers(&self, chain_id: Uuid, step_id: Uuid) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT approver_user_id
            FROM approval_decisions
            WHERE chain_id = ? AND step_id = ?
            "#,
        )
        .bind(chain_id.to_string())
        .bind(step_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        ids.iter().map(|s| parse_uuid(s, "approver id")).collect()
    }

    /// Every decision of a chain, by step order then time
    pub async fn list_decisions(&self, chain_id: Uuid) -> Result<Vec<Decision>> {
        let rows = sqlx::query_as::<_, DecisionRow>(
            r#"
            SELECT d.id, d.chain_id, d.step_id, d.approver_user_id, d.actor_user_id, d.decision, d.reason, d.decided_at
            FROM approval_decisions d
            JOIN approval_steps s ON s.id = d.step_id
            WHERE d.chain_id = ?
            ORDER BY s.step_order ASC, d.decided_at ASC
            "#,
        )
        .bind(chain_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    // Transitions

    /// Apply a step/chain/artifact cascade atomically.
    ///
    /// Returns `false` without writing anything when the step was no longer
    /// pending, i.e. a concurrent caller already performed the cascade.
    pub async fn apply_transition(&self, transition: &Transition) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let swapped = sqlx::query(
            r#"
            UPDATE approval_steps SET status = ?, updated_at = ?
            WHERE id = ? AND chain_id = ? AND status = 'pending'
            "#,
        )
        .bind(transition.step_status.as_str())
        .bind(now)
        .bind(transition.step_id.to_string())
        .bind(transition.chain_id.to_string())
        .execute(&mut *tx)
        .await?;

        if swapped.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(next_id) = transition.activate_step_id {
            sqlx::query(
                r#"
                UPDATE approval_steps SET status = 'pending', updated_at = ?
                WHERE id = ? AND chain_id = ? AND status = 'waiting'
                "#,
            )
            .bind(now)
            .bind(next_id.to_string())
            .bind(transition.chain_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE approval_chains SET status = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(transition.chain_status.as_str())
        .bind(transition.chain_active)
        .bind(now)
        .bind(transition.chain_id.to_string())
        .execute(&mut *tx)
        .await?;

        if let Some(status) = transition.artifact_status {
            sqlx::query(
                r#"
                UPDATE artifacts SET status = ?, updated_at = ? WHERE id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(now)
            .bind(transition.artifact_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    // Provisioning. The engine never calls these; they stand in for the
    // submission flow in tests and the admin CLI.

    pub async fn create_artifact(&self, project_id: Uuid, title: &str) -> Result<Artifact> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO artifacts (id, project_id, title, status, created_at, updated_at)
            VALUES (?, ?, ?, 'draft', ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Artifact {
            id,
            project_id,
            title: title.to_string(),
            status: ArtifactStatus::Draft,
            approval_chain_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn add_member(&self, project_id: Uuid, user_id: Uuid) -> Result<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO project_members (id, project_id, user_id, is_active, created_at)
            VALUES (?, ?, ?, 1, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(user_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn set_member_active(&self, member_id: Uuid, active: bool) -> Result<()> {
        sqlx::query("UPDATE project_members SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(member_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create a chain for an artifact, put the artifact under review and make
    /// the first step pending.
    pub async fn provision_chain(
        &self,
        artifact_id: Uuid,
        steps: &[NewStep],
    ) -> Result<(ApprovalChain, Vec<ApprovalStep>)> {
        if steps.is_empty() {
            return Err(AppError::Validation(
                "A chain needs at least one step".to_string(),
            ));
        }
        for step in steps {
            if step.max_rejections < 0 || step.min_approvals.is_some_and(|n| n < 1) {
                return Err(AppError::Validation(format!(
                    "Invalid thresholds for step '{}'",
                    step.name
                )));
            }
        }

        let chain_id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO approval_chains (id, artifact_id, status, is_active, created_at, updated_at)
            VALUES (?, ?, 'active', 1, ?, ?)
            "#,
        )
        .bind(chain_id.to_string())
        .bind(artifact_id.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut created = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let step_id = Uuid::new_v4();
            let status = if index == 0 {
                StepStatus::Pending
            } else {
                StepStatus::Waiting
            };
            let step_order = index as i64 + 1;

            sqlx::query(
                r#"
                INSERT INTO approval_steps (id, chain_id, step_order, name, mode, min_approvals, max_rejections, status, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(step_id.to_string())
            .bind(chain_id.to_string())
            .bind(step_order)
            .bind(&step.name)
            .bind(DecisionMode::QuorumVeto.as_str())
            .bind(step.min_approvals)
            .bind(step.max_rejections)
            .bind(status.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

            for approver in &step.approvers {
                let (member_id, user_id) = match approver {
                    ApproverRef::Member(id) => (Some(id.to_string()), None),
                    ApproverRef::User(id) => (None, Some(id.to_string())),
                };
                sqlx::query(
                    r#"
                    INSERT INTO approval_step_approvers (id, step_id, member_id, user_id, is_active)
                    VALUES (?, ?, ?, ?, 1)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(step_id.to_string())
                .bind(member_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            }

            created.push(ApprovalStep {
                id: step_id,
                chain_id,
                step_order,
                name: step.name.clone(),
                mode: DecisionMode::QuorumVeto,
                min_approvals: step.min_approvals,
                max_rejections: step.max_rejections,
                status,
                updated_at: now,
            });
        }

        sqlx::query(
            r#"
            UPDATE artifacts SET status = 'submitted', approval_chain_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(chain_id.to_string())
        .bind(now)
        .bind(artifact_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let chain = ApprovalChain {
            id: chain_id,
            artifact_id,
            status: ChainStatus::Active,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        Ok((chain, created))
    }

    /// Deactivate every approver binding of a step
    pub async fn deactivate_step_approvers(&self, step_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE approval_step_approvers SET is_active = 0 WHERE step_id = ?")
            .bind(step_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_delegation(
        &self,
        principal_user_id: Uuid,
        delegate_user_id: Uuid,
        starts_at: Option<DateTime<Utc>>,
        ends_at: Option<DateTime<Utc>>,
    ) -> Result<Delegation> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO approval_delegations (id, principal_user_id, delegate_user_id, starts_at, ends_at, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(principal_user_id.to_string())
        .bind(delegate_user_id.to_string())
        .bind(starts_at)
        .bind(ends_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(Delegation {
            id,
            principal_user_id,
            delegate_user_id,
            starts_at,
            ends_at,
            is_active: true,
        })
    }

    pub async fn revoke_delegation(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE approval_delegations SET is_active = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_uuid(value: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| AppError::Internal(format!("Invalid {}: {}", field, e)))
}

fn parse_opt_uuid(value: Option<String>, field: &str) -> Result<Option<Uuid>> {
    value.map(|s| parse_uuid(&s, field)).transpose()
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: String,
    project_id: String,
    title: String,
    status: String,
    approval_chain_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = AppError;

    fn try_from(row: ArtifactRow) -> Result<Self> {
        Ok(Artifact {
            id: parse_uuid(&row.id, "artifact id")?,
            project_id: parse_uuid(&row.project_id, "project id")?,
            title: row.title,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid artifact status: {}", e)))?,
            approval_chain_id: parse_opt_uuid(row.approval_chain_id, "approval chain id")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChainRow {
    id: String,
    artifact_id: String,
    status: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChainRow> for ApprovalChain {
    type Error = AppError;

    fn try_from(row: ChainRow) -> Result<Self> {
        Ok(ApprovalChain {
            id: parse_uuid(&row.id, "chain id")?,
            artifact_id: parse_uuid(&row.artifact_id, "artifact id")?,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid chain status: {}", e)))?,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    chain_id: String,
    step_order: i64,
    name: String,
    mode: String,
    min_approvals: Option<i64>,
    max_rejections: i64,
    status: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StepRow> for ApprovalStep {
    type Error = AppError;

    fn try_from(row: StepRow) -> Result<Self> {
        Ok(ApprovalStep {
            id: parse_uuid(&row.id, "step id")?,
            chain_id: parse_uuid(&row.chain_id, "chain id")?,
            step_order: row.step_order,
            name: row.name,
            mode: row
                .mode
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid decision mode: {}", e)))?,
            min_approvals: row.min_approvals,
            max_rejections: row.max_rejections,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid step status: {}", e)))?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepApproverRow {
    id: String,
    step_id: String,
    member_id: Option<String>,
    user_id: Option<String>,
    is_active: bool,
}

impl TryFrom<StepApproverRow> for StepApprover {
    type Error = AppError;

    fn try_from(row: StepApproverRow) -> Result<Self> {
        let member_id = parse_opt_uuid(row.member_id, "member id")?;
        let user_id = parse_opt_uuid(row.user_id, "user id")?;
        let approver = match (member_id, user_id) {
            (Some(member), _) => ApproverRef::Member(member),
            (None, Some(user)) => ApproverRef::User(user),
            (None, None) => {
                return Err(AppError::Internal(format!(
                    "Step approver {} has neither member nor user",
                    row.id
                )))
            }
        };

        Ok(StepApprover {
            id: parse_uuid(&row.id, "step approver id")?,
            step_id: parse_uuid(&row.step_id, "step id")?,
            approver,
            // A membership binding may also record the user directly
            legacy_user_id: if member_id.is_some() { user_id } else { None },
            is_active: row.is_active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DecisionRow {
    id: String,
    chain_id: String,
    step_id: String,
    approver_user_id: String,
    actor_user_id: String,
    decision: String,
    reason: Option<String>,
    decided_at: DateTime<Utc>,
}

impl TryFrom<DecisionRow> for Decision {
    type Error = AppError;

    fn try_from(row: DecisionRow) -> Result<Self> {
        Ok(Decision {
            id: parse_uuid(&row.id, "decision id")?,
            chain_id: parse_uuid(&row.chain_id, "chain id")?,
            step_id: parse_uuid(&row.step_id, "step id")?,
            approver_user_id: parse_uuid(&row.approver_user_id, "approver id")?,
            actor_user_id: parse_uuid(&row.actor_user_id, "actor id")?,
            decision: row
                .decision
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid decision: {}", e)))?,
            reason: row.reason,
            decided_at: row.decided_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DelegationRow {
    id: String,
    principal_user_id: String,
    delegate_user_id: String,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    is_active: bool,
}

impl TryFrom<DelegationRow> for Delegation {
    type Error = AppError;

    fn try_from(row: DelegationRow) -> Result<Self> {
        Ok(Delegation {
            id: parse_uuid(&row.id, "delegation id")?,
            principal_user_id: parse_uuid(&row.principal_user_id, "principal id")?,
            delegate_user_id: parse_uuid(&row.delegate_user_id, "delegate id")?,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            is_active: row.is_active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    async fn provisioned(
        store: &Store,
        steps: &[NewStep],
    ) -> (Artifact, ApprovalChain, Vec<ApprovalStep>) {
        let artifact = store
            .create_artifact(Uuid::new_v4(), "Risk register")
            .await
            .unwrap();
        let (chain, steps) = store.provision_chain(artifact.id, steps).await.unwrap();
        (artifact, chain, steps)
    }

    #[tokio::test]
    async fn test_capabilities_full_schema() {
        let store = setup_test_db().await;
        let caps = store.capabilities().await.unwrap();
        assert_eq!(
            caps,
            Capabilities {
                approval_tables: true,
                membership_table: true,
                member_approvers: true,
                delegations_table: true,
            }
        );
    }

    #[tokio::test]
    async fn test_capabilities_empty_schema() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(pool);
        let caps = store.capabilities().await.unwrap();
        assert!(!caps.approval_tables);
        assert!(!caps.membership_table);
        assert!(!caps.member_approvers);
        assert!(!caps.delegations_table);
    }

    #[tokio::test]
    async fn test_capabilities_cached_for_store_lifetime() {
        let store = setup_test_db().await;
        assert!(store.capabilities().await.unwrap().membership_table);

        sqlx::query("DROP TABLE project_members")
            .execute(store.pool())
            .await
            .unwrap();

        // Cloned stores share the negotiated result
        let clone = store.clone();
        assert!(clone.capabilities().await.unwrap().membership_table);
    }

    #[tokio::test]
    async fn test_get_artifact_not_found() {
        let store = setup_test_db().await;
        let result = store.get_artifact(Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_provision_chain_first_step_pending() {
        let store = setup_test_db().await;
        let (artifact, chain, steps) = provisioned(
            &store,
            &[
                NewStep::new("Review"),
                NewStep::new("Sign-off"),
                NewStep::new("Archive"),
            ],
        )
        .await;

        let artifact = store.get_artifact(artifact.id).await.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Submitted);
        assert_eq!(artifact.approval_chain_id, Some(chain.id));

        let stored = store.list_steps(chain.id).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].status, StepStatus::Pending);
        assert_eq!(stored[1].status, StepStatus::Waiting);
        assert_eq!(stored[2].status, StepStatus::Waiting);
        assert_eq!(
            stored.iter().map(|s| s.id).collect::<Vec<_>>(),
            steps.iter().map(|s| s.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_provision_chain_rejects_bad_thresholds() {
        let store = setup_test_db().await;
        let artifact = store.create_artifact(Uuid::new_v4(), "Plan").await.unwrap();

        let result = store
            .provision_chain(artifact.id, &[NewStep::new("Review").max_rejections(-1)])
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let result = store.provision_chain(artifact.id, &[]).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_next_step_skips_gaps_in_order() {
        let store = setup_test_db().await;
        let (_, chain, steps) =
            provisioned(&store, &[NewStep::new("One"), NewStep::new("Two")]).await;

        sqlx::query("UPDATE approval_steps SET step_order = 10 WHERE id = ?")
            .bind(steps[1].id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let next = store.next_step(chain.id, 1).await.unwrap().unwrap();
        assert_eq!(next.id, steps[1].id);
        assert!(store.next_step(chain.id, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_decision_overwrites_same_approver() {
        let store = setup_test_db().await;
        let (_, chain, steps) = provisioned(&store, &[NewStep::new("Review")]).await;
        let approver = Uuid::new_v4();

        let first = store
            .upsert_decision(
                chain.id,
                steps[0].id,
                approver,
                approver,
                DecisionValue::Approved,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        let second = store
            .upsert_decision(
                chain.id,
                steps[0].id,
                approver,
                approver,
                DecisionValue::Rejected,
                Some("missing budget"),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.decision, DecisionValue::Rejected);
        assert_eq!(second.reason.as_deref(), Some("missing budget"));

        let tally = store.tally(chain.id, steps[0].id).await.unwrap();
        assert_eq!(
            tally,
            Tally {
                approvals: 0,
                rejections: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_tally_counts_per_step() {
        let store = setup_test_db().await;
        let (_, chain, steps) =
            provisioned(&store, &[NewStep::new("One"), NewStep::new("Two")]).await;

        for value in [
            DecisionValue::Approved,
            DecisionValue::Approved,
            DecisionValue::Rejected,
        ] {
            let user = Uuid::new_v4();
            store
                .upsert_decision(chain.id, steps[0].id, user, user, value, None, Utc::now())
                .await
                .unwrap();
        }

        assert_eq!(
            store.tally(chain.id, steps[0].id).await.unwrap(),
            Tally {
                approvals: 2,
                rejections: 1,
            }
        );
        assert_eq!(
            store.tally(chain.id, steps[1].id).await.unwrap(),
            Tally::default()
        );
        assert_eq!(
            store
                .decided_approvers(chain.id, steps[0].id)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_resolve_members_skips_inactive() {
        let store = setup_test_db().await;
        let project = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let alice_member = store.add_member(project, alice).await.unwrap();
        let bob_member = store.add_member(project, bob).await.unwrap();
        store.set_member_active(bob_member, false).await.unwrap();

        let resolved = store
            .resolve_members(&[alice_member, bob_member, Uuid::new_v4()])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved.get(&alice_member), Some(&alice));
        assert!(store.resolve_members(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_step_approvers_excludes_inactive() {
        let store = setup_test_db().await;
        let member = store
            .add_member(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        let legacy = Uuid::new_v4();
        let (_, _, steps) = provisioned(
            &store,
            &[NewStep::new("Review")
                .approver(ApproverRef::Member(member))
                .approver(ApproverRef::User(legacy))],
        )
        .await;

        let approvers = store.list_step_approvers(steps[0].id).await.unwrap();
        assert_eq!(approvers.len(), 2);
        assert!(approvers
            .iter()
            .any(|a| a.approver == ApproverRef::Member(member)));
        assert!(approvers
            .iter()
            .any(|a| a.approver == ApproverRef::User(legacy)));

        store.deactivate_step_approvers(steps[0].id).await.unwrap();
        assert!(store
            .list_step_approvers(steps[0].id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_apply_transition_is_compare_and_swap() {
        let store = setup_test_db().await;
        let (artifact, chain, steps) =
            provisioned(&store, &[NewStep::new("One"), NewStep::new("Two")]).await;

        let transition = Transition {
            artifact_id: artifact.id,
            chain_id: chain.id,
            step_id: steps[0].id,
            step_status: StepStatus::Approved,
            activate_step_id: Some(steps[1].id),
            chain_status: ChainStatus::Active,
            chain_active: true,
            artifact_status: None,
        };

        assert!(store.apply_transition(&transition).await.unwrap());
        assert!(!store.apply_transition(&transition).await.unwrap());

        let stored = store.list_steps(chain.id).await.unwrap();
        assert_eq!(stored[0].status, StepStatus::Approved);
        assert_eq!(stored[1].status, StepStatus::Pending);
        assert_eq!(
            store.get_artifact(artifact.id).await.unwrap().status,
            ArtifactStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_apply_transition_lost_race_writes_nothing() {
        let store = setup_test_db().await;
        let (artifact, chain, steps) = provisioned(&store, &[NewStep::new("One")]).await;

        sqlx::query("UPDATE approval_steps SET status = 'rejected' WHERE id = ?")
            .bind(steps[0].id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let applied = store
            .apply_transition(&Transition {
                artifact_id: artifact.id,
                chain_id: chain.id,
                step_id: steps[0].id,
                step_status: StepStatus::Approved,
                activate_step_id: None,
                chain_status: ChainStatus::Approved,
                chain_active: false,
                artifact_status: Some(ArtifactStatus::Approved),
            })
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(
            store.get_chain(chain.id).await.unwrap().status,
            ChainStatus::Active
        );
        assert_eq!(
            store.get_artifact(artifact.id).await.unwrap().status,
            ArtifactStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_delegations_for_delegate_only_active() {
        let store = setup_test_db().await;
        let principal = Uuid::new_v4();
        let delegate = Uuid::new_v4();
        let kept = store
            .add_delegation(principal, delegate, None, None)
            .await
            .unwrap();
        let revoked = store
            .add_delegation(principal, delegate, None, None)
            .await
            .unwrap();
        store.revoke_delegation(revoked.id).await.unwrap();
        store
            .add_delegation(principal, Uuid::new_v4(), None, None)
            .await
            .unwrap();

        let found = store.delegations_for_delegate(delegate).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, kept.id);
    }

    #[tokio::test]
    async fn test_artifact_row_try_from_invalid_uuid() {
        let row = ArtifactRow {
            id: "not-a-uuid".to_string(),
            project_id: Uuid::new_v4().to_string(),
            title: "x".to_string(),
            status: "draft".to_string(),
            approval_chain_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let result: Result<Artifact> = row.try_into();
        assert!(matches!(result, Err(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn test_step_row_try_from_invalid_status() {
        let row = StepRow {
            id: Uuid::new_v4().to_string(),
            chain_id: Uuid::new_v4().to_string(),
            step_order: 1,
            name: "x".to_string(),
            mode: "quorum_veto".to_string(),
            min_approvals: None,
            max_rejections: 0,
            status: "in_review".to_string(),
            updated_at: Utc::now(),
        };
        let result: Result<ApprovalStep> = row.try_into();
        assert!(matches!(result, Err(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn test_step_approver_row_needs_a_reference() {
        let row = StepApproverRow {
            id: Uuid::new_v4().to_string(),
            step_id: Uuid::new_v4().to_string(),
            member_id: None,
            user_id: None,
            is_active: true,
        };
        let result: Result<StepApprover> = row.try_into();
        assert!(matches!(result, Err(AppError::Internal(_))));
    }
}
