//! Per-field merge policy applied when the backend's player snapshot meets local state.
//!
//! Every field of [`PlayerState`] that the backend can report has exactly one entry in
//! the policy table. The default table takes whatever the server reports and keeps the
//! local value for anything it leaves out (collections such as flags are replaced
//! wholesale, not merged), unions the inventory so locally granted items survive a
//! sync, and keeps the higher of two skill levels.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::progression::types::{PlayerSnapshot, PlayerState, PlayerStatus, Reputation};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlayerField {
    Phase,
    Health,
    Fame,
    Status,
    Credits,
    Reputation,
    Relationships,
    Flags,
    Inventory,
    Skills,
    Attributes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The server is authoritative: its value wins, and a field it omits is reset.
    Replace,
    /// Local and server values are combined; nothing local is dropped.
    Union,
    /// The larger value wins (per key for maps, per category for reputation).
    MaxOf,
    /// Server value wins when present, local value is kept otherwise.
    KeepLocalIfServerAbsent,
}

pub const DEFAULT_PLAYER_MERGE_POLICY: &[(PlayerField, MergePolicy)] = &[
    (PlayerField::Phase, MergePolicy::KeepLocalIfServerAbsent),
    (PlayerField::Health, MergePolicy::KeepLocalIfServerAbsent),
    (PlayerField::Fame, MergePolicy::KeepLocalIfServerAbsent),
    (PlayerField::Status, MergePolicy::KeepLocalIfServerAbsent),
    (PlayerField::Credits, MergePolicy::KeepLocalIfServerAbsent),
    (PlayerField::Reputation, MergePolicy::KeepLocalIfServerAbsent),
    (PlayerField::Relationships, MergePolicy::KeepLocalIfServerAbsent),
    (PlayerField::Flags, MergePolicy::KeepLocalIfServerAbsent),
    (PlayerField::Inventory, MergePolicy::Union),
    (PlayerField::Skills, MergePolicy::MaxOf),
    (PlayerField::Attributes, MergePolicy::KeepLocalIfServerAbsent),
];

/// Auditable mapping from field to policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTable {
    policies: BTreeMap<PlayerField, MergePolicy>,
}

impl Default for MergeTable {
    fn default() -> Self {
        Self {
            policies: DEFAULT_PLAYER_MERGE_POLICY.iter().copied().collect(),
        }
    }
}

impl MergeTable {
    pub fn policy(&self, field: PlayerField) -> MergePolicy {
        self.policies
            .get(&field)
            .copied()
            .unwrap_or(MergePolicy::KeepLocalIfServerAbsent)
    }

    pub fn with_policy(mut self, field: PlayerField, policy: MergePolicy) -> Self {
        self.policies.insert(field, policy);
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = (PlayerField, MergePolicy)> + '_ {
        self.policies.iter().map(|(f, p)| (*f, *p))
    }

    /// Combine `local` with `server` field by field. `updated_at` is left to the caller.
    pub fn merge(&self, local: &PlayerState, server: &PlayerSnapshot) -> PlayerState {
        use PlayerField as F;
        PlayerState {
            phase: local.phase.merge_with(server.phase.as_ref(), self.policy(F::Phase)),
            health: local.health.merge_with(server.health.as_ref(), self.policy(F::Health)),
            fame: local.fame.merge_with(server.fame.as_ref(), self.policy(F::Fame)),
            status: local.status.merge_with(server.status.as_ref(), self.policy(F::Status)),
            credits: local
                .credits
                .merge_with(server.credits.as_ref(), self.policy(F::Credits)),
            reputation: local
                .reputation
                .merge_with(server.reputation.as_ref(), self.policy(F::Reputation)),
            relationships: local
                .relationships
                .merge_with(server.relationships.as_ref(), self.policy(F::Relationships)),
            flags: local.flags.merge_with(server.flags.as_ref(), self.policy(F::Flags)),
            inventory: local
                .inventory
                .merge_with(server.inventory.as_ref(), self.policy(F::Inventory)),
            skills: local.skills.merge_with(server.skills.as_ref(), self.policy(F::Skills)),
            attributes: local
                .attributes
                .merge_with(server.attributes.as_ref(), self.policy(F::Attributes)),
            updated_at: local.updated_at,
        }
    }
}

/// A value that knows how to combine itself with a server-reported counterpart.
pub trait Mergeable: Clone + Default {
    fn merge_with(&self, server: Option<&Self>, policy: MergePolicy) -> Self {
        match (server, policy) {
            (None, MergePolicy::Replace) => Self::default(),
            (None, _) => self.clone(),
            (Some(server), policy) => self.combine(server, policy),
        }
    }

    /// Combine with a value the server did report.
    fn combine(&self, server: &Self, policy: MergePolicy) -> Self;
}

macro_rules! scalar_mergeable {
    ($($ty:ty),*) => {
        $(
            impl Mergeable for $ty {
                fn combine(&self, server: &Self, policy: MergePolicy) -> Self {
                    match policy {
                        MergePolicy::MaxOf => (*self).max(*server),
                        // A scalar has nothing to union with; the server value stands.
                        _ => *server,
                    }
                }
            }
        )*
    };
}

scalar_mergeable!(u32, u64, i32, PlayerStatus);

impl Mergeable for Reputation {
    fn combine(&self, server: &Self, policy: MergePolicy) -> Self {
        match policy {
            MergePolicy::MaxOf | MergePolicy::Union => Reputation {
                combat: self.combat.max(server.combat),
                exploration: self.exploration.max(server.exploration),
                social: self.social.max(server.social),
                reliability: self.reliability.max(server.reliability),
            },
            MergePolicy::Replace | MergePolicy::KeepLocalIfServerAbsent => *server,
        }
    }
}

impl Mergeable for BTreeSet<String> {
    fn combine(&self, server: &Self, policy: MergePolicy) -> Self {
        match policy {
            MergePolicy::Union | MergePolicy::MaxOf => self.union(server).cloned().collect(),
            MergePolicy::Replace | MergePolicy::KeepLocalIfServerAbsent => server.clone(),
        }
    }
}

impl<V: Copy + Ord> Mergeable for BTreeMap<String, V> {
    fn combine(&self, server: &Self, policy: MergePolicy) -> Self {
        match policy {
            MergePolicy::Replace | MergePolicy::KeepLocalIfServerAbsent => server.clone(),
            MergePolicy::Union => {
                let mut merged = self.clone();
                merged.extend(server.iter().map(|(k, v)| (k.clone(), *v)));
                merged
            }
            MergePolicy::MaxOf => {
                let mut merged = self.clone();
                for (key, value) in server {
                    merged
                        .entry(key.clone())
                        .and_modify(|local| *local = (*local).max(*value))
                        .or_insert(*value);
                }
                merged
            }
        }
    }
}
