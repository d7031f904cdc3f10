//! Delegation resolution
//!
//! Decides whether an acting user may stand in for one of a step's
//! designated approvers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::models::Delegation;
use crate::store::Store;

/// The approver of record a decision is written against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: Uuid,
    /// Set when the actor is standing in for `user_id`
    pub via_delegation: bool,
}

impl Principal {
    pub fn own(user_id: Uuid) -> Self {
        Self {
            user_id,
            via_delegation: false,
        }
    }

    pub fn delegated(user_id: Uuid) -> Self {
        Self {
            user_id,
            via_delegation: true,
        }
    }
}

#[derive(Clone)]
pub struct DelegationResolver {
    store: Store,
}

impl DelegationResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Find who `actor` may decide as, given the resolved approver set.
    ///
    /// Approvers act as themselves. Anyone else needs an active delegation
    /// from an approver whose window contains `now`. Returns `None` when
    /// nothing matches.
    pub async fn resolve(
        &self,
        actor: Uuid,
        approvers: &BTreeSet<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Principal>> {
        if approvers.contains(&actor) {
            return Ok(Some(Principal::own(actor)));
        }
        if approvers.is_empty() {
            return Ok(None);
        }

        let delegations = self.store.delegations_for_delegate(actor).await?;
        let principal = select_principal(&delegations, actor, approvers, now);
        if let Some(principal) = principal {
            tracing::debug!(%actor, %principal, "Actor authorized through delegation");
        }
        Ok(principal.map(Principal::delegated))
    }
}

/// Pick the principal `actor` covers at `now`.
///
/// Any matching principal is valid; the smallest id is taken so that a
/// repeated decision by the same delegate lands on the same ledger row.
pub fn select_principal(
    delegations: &[Delegation],
    actor: Uuid,
    approvers: &BTreeSet<Uuid>,
    now: DateTime<Utc>,
) -> Option<Uuid> {
    delegations
        .iter()
        .filter(|d| d.delegate_user_id == actor)
        .filter(|d| approvers.contains(&d.principal_user_id))
        .filter(|d| d.is_effective_at(now))
        .map(|d| d.principal_user_id)
        .min()
}
