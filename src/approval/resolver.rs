//! Approver resolution
//!
//! Turns a step's approver bindings into the set of concrete user ids that
//! may decide on it. Membership bindings go through `project_members`;
//! legacy bindings already name the user.

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::ApproverRef;
use crate::store::Store;

#[derive(Clone)]
pub struct ApproverResolver {
    store: Store,
}

impl ApproverResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolve a single approver reference to user ids.
    ///
    /// A membership reference yields nothing when the member is inactive,
    /// unknown, or membership cannot be consulted.
    pub async fn resolve(&self, approver: &ApproverRef) -> Result<Vec<Uuid>> {
        match approver {
            ApproverRef::User(user_id) => Ok(vec![*user_id]),
            ApproverRef::Member(member_id) => {
                let members = self.lookup_members(&[*member_id]).await?;
                Ok(members
                    .and_then(|m| m.get(member_id).copied())
                    .into_iter()
                    .collect())
            }
        }
    }

    /// The de-duplicated set of users eligible to decide on a step
    pub async fn resolve_step(&self, step_id: Uuid) -> Result<BTreeSet<Uuid>> {
        let bindings = self.store.list_step_approvers(step_id).await?;

        let member_ids: Vec<Uuid> = bindings
            .iter()
            .filter_map(|b| match b.approver {
                ApproverRef::Member(id) => Some(id),
                ApproverRef::User(_) => None,
            })
            .collect();
        let members = self.lookup_members(&member_ids).await?;

        let mut users = BTreeSet::new();
        for binding in &bindings {
            match binding.approver {
                ApproverRef::User(user_id) => {
                    users.insert(user_id);
                }
                ApproverRef::Member(member_id) => match &members {
                    Some(resolved) => {
                        if let Some(user_id) = resolved.get(&member_id) {
                            users.insert(*user_id);
                        }
                    }
                    None => {
                        if let Some(user_id) = binding.legacy_user_id {
                            users.insert(user_id);
                        }
                    }
                },
            }
        }

        tracing::debug!(%step_id, approvers = users.len(), "Resolved step approvers");
        Ok(users)
    }

    /// `None` means membership is unavailable and callers fall back to
    /// legacy identities.
    async fn lookup_members(&self, member_ids: &[Uuid]) -> Result<Option<HashMap<Uuid, Uuid>>> {
        if member_ids.is_empty() {
            return Ok(Some(HashMap::new()));
        }

        if !self.store.capabilities().await?.membership_table {
            tracing::debug!("No membership table, using legacy approvers only");
            return Ok(None);
        }

        match self.store.resolve_members(member_ids).await {
            Ok(resolved) => Ok(Some(resolved)),
            Err(AppError::Database(e)) => {
                tracing::warn!(error = %e, "Membership lookup failed, using legacy approvers only");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
