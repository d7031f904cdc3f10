//! Data models for artifacts, approval chains, steps and decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A governed document under review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub status: ArtifactStatus,
    /// The chain currently (or most recently) reviewing this artifact
    pub approval_chain_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Draft => "draft",
            ArtifactStatus::Submitted => "submitted",
            ArtifactStatus::Approved => "approved",
            ArtifactStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ArtifactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ArtifactStatus::Draft),
            "submitted" => Ok(ArtifactStatus::Submitted),
            "approved" => Ok(ArtifactStatus::Approved),
            "rejected" => Ok(ArtifactStatus::Rejected),
            _ => Err(format!("Invalid artifact status: {}", s)),
        }
    }
}

/// An ordered workflow instance bound to one artifact submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalChain {
    pub id: Uuid,
    pub artifact_id: Uuid,
    pub status: ChainStatus,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Active,
    Approved,
    Rejected,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Active => "active",
            ChainStatus::Approved => "approved",
            ChainStatus::Rejected => "rejected",
        }
    }

    /// Terminal chains are never reopened
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainStatus::Approved | ChainStatus::Rejected)
    }
}

impl std::str::FromStr for ChainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ChainStatus::Active),
            "approved" => Ok(ChainStatus::Approved),
            "rejected" => Ok(ChainStatus::Rejected),
            _ => Err(format!("Invalid chain status: {}", s)),
        }
    }
}

/// One ordered stage within a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: Uuid,
    pub chain_id: Uuid,
    pub step_order: i64,
    pub name: String,
    pub mode: DecisionMode,
    /// Unset means a single approval is enough
    pub min_approvals: Option<i64>,
    /// Rejections strictly greater than this value reject the step
    pub max_rejections: i64,
    pub status: StepStatus,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalStep {
    pub fn required_approvals(&self) -> i64 {
        self.min_approvals.unwrap_or(1)
    }
}

/// Status of a step. `Waiting` is a step the chain has not reached yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Pending,
    Approved,
    Rejected,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Waiting => "waiting",
            StepStatus::Pending => "pending",
            StepStatus::Approved => "approved",
            StepStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Approved | StepStatus::Rejected)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(StepStatus::Waiting),
            "pending" => Ok(StepStatus::Pending),
            "approved" => Ok(StepStatus::Approved),
            "rejected" => Ok(StepStatus::Rejected),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// How a step turns votes into an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    /// Approved at `min_approvals`, rejected once rejections exceed `max_rejections`
    QuorumVeto,
}

impl DecisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMode::QuorumVeto => "quorum_veto",
        }
    }
}

impl std::str::FromStr for DecisionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quorum_veto" => Ok(DecisionMode::QuorumVeto),
            _ => Err(format!("Invalid decision mode: {}", s)),
        }
    }
}

/// Reference to a designated approver.
///
/// Canonical bindings go through project membership; legacy bindings name
/// the user directly. Both resolve to concrete user ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ApproverRef {
    Member(Uuid),
    User(Uuid),
}

/// Binding of a designated approver to a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepApprover {
    pub id: Uuid,
    pub step_id: Uuid,
    pub approver: ApproverRef,
    /// User recorded alongside a membership binding, used when membership
    /// cannot be resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_user_id: Option<Uuid>,
    pub is_active: bool,
}

/// A vote value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionValue {
    Approved,
    Rejected,
}

impl DecisionValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionValue::Approved => "approved",
            DecisionValue::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for DecisionValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(DecisionValue::Approved),
            "rejected" => Ok(DecisionValue::Rejected),
            _ => Err(format!(
                "Invalid decision '{}': expected 'approved' or 'rejected'",
                s
            )),
        }
    }
}

/// One approver's vote on one step, unique per (chain, step, approver)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub chain_id: Uuid,
    pub step_id: Uuid,
    /// Approver of record (the principal)
    pub approver_user_id: Uuid,
    /// Who physically acted; differs from the approver under delegation
    pub actor_user_id: Uuid,
    pub decision: DecisionValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Time-bounded grant letting `delegate_user_id` vote as `principal_user_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: Uuid,
    pub principal_user_id: Uuid,
    pub delegate_user_id: Uuid,
    /// Unbounded in the past when unset
    pub starts_at: Option<DateTime<Utc>>,
    /// Unbounded in the future when unset
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Delegation {
    /// Whether the grant is usable at `now` (`start <= now <= end`)
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.starts_at.map_or(true, |start| start <= now)
            && self.ends_at.map_or(true, |end| now <= end)
    }
}

/// Current vote counts for one step of one chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approvals: i64,
    pub rejections: i64,
}

/// Statuses of the step, chain and artifact after a decision or recompute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTriple {
    pub step_status: StepStatus,
    pub chain_status: ChainStatus,
    pub artifact_status: ArtifactStatus,
}

/// Request to record a decision on an artifact's pending step.
///
/// Every field is optional at the wire level so that missing values surface
/// as validation errors rather than extractor rejections.
#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub actor_user_id: Option<Uuid>,
    #[serde(default)]
    pub decision: String,
    pub reason: Option<String>,
    /// Only vote while this step is the pending one
    pub step_id: Option<Uuid>,
}
