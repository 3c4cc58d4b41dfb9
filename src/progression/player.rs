//! Player progression store: credits, inventory, skills, attributes, flags, reputation.
//!
//! Every mutator is atomic on its own and never fails for expected conditions;
//! `spend_credits` reports an insufficient balance with `false` rather than an error.

use log::{debug, info};

use crate::progression::clock::{SharedClock, Timestamp};
use crate::progression::merge::MergeTable;
use crate::progression::types::{PlayerSnapshot, PlayerState, PlayerStatus, ReputationKind};

/// Clamp a level to a non-negative integer. Non-finite input collapses to zero.
pub fn clamp_level(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.floor().min(u32::MAX as f64) as u32
}

pub struct PlayerStore {
    state: PlayerState,
    merge: MergeTable,
    clock: SharedClock,
}

impl PlayerStore {
    pub fn new(clock: SharedClock) -> Self {
        let state = PlayerState::new(clock.now());
        Self::from_state(state, clock)
    }

    pub fn from_state(state: PlayerState, clock: SharedClock) -> Self {
        Self {
            state,
            merge: MergeTable::default(),
            clock,
        }
    }

    pub fn with_merge_table(mut self, merge: MergeTable) -> Self {
        self.merge = merge;
        self
    }

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    pub fn credits(&self) -> u64 {
        self.state.credits
    }

    pub fn phase(&self) -> u32 {
        self.state.phase
    }

    pub fn has_item(&self, item_id: &str) -> bool {
        self.state.inventory.contains(item_id)
    }

    pub fn skill(&self, key: &str) -> u32 {
        self.state.skills.get(key).copied().unwrap_or(0)
    }

    pub fn attribute(&self, key: &str) -> u32 {
        self.state.attributes.get(key).copied().unwrap_or(0)
    }

    pub fn add_credits(&mut self, amount: u64) {
        self.commit(|s| s.credits = s.credits.saturating_add(amount));
    }

    /// Deduct `amount` if the balance covers it. Returns false and changes nothing otherwise.
    pub fn spend_credits(&mut self, amount: u64) -> bool {
        if amount > self.state.credits {
            debug!(
                "Refusing to spend {} credits with balance {}",
                amount, self.state.credits
            );
            return false;
        }
        self.commit(|s| s.credits -= amount);
        true
    }

    /// Insert `item_id`; adding an item already held is a no-op. Returns whether it was new.
    pub fn add_item(&mut self, item_id: &str) -> bool {
        if self.has_item(item_id) {
            return false;
        }
        self.commit(|s| {
            s.inventory.insert(item_id.to_string());
        });
        true
    }

    /// Remove `item_id`; removing an item not held is a no-op. Returns whether it was held.
    pub fn remove_item(&mut self, item_id: &str) -> bool {
        if !self.has_item(item_id) {
            return false;
        }
        self.commit(|s| {
            s.inventory.remove(item_id);
        });
        true
    }

    pub fn increment_skill(&mut self, key: &str, delta: f64) -> u32 {
        let level = clamp_level(self.skill(key) as f64 + delta);
        self.commit(|s| {
            s.skills.insert(key.to_string(), level);
        });
        level
    }

    pub fn set_skill(&mut self, key: &str, value: f64) -> u32 {
        let level = clamp_level(value);
        self.commit(|s| {
            s.skills.insert(key.to_string(), level);
        });
        level
    }

    pub fn inc_attribute(&mut self, key: &str, delta: f64) -> u32 {
        let level = clamp_level(self.attribute(key) as f64 + delta);
        self.commit(|s| {
            s.attributes.insert(key.to_string(), level);
        });
        level
    }

    pub fn set_attribute(&mut self, key: &str, value: f64) -> u32 {
        let level = clamp_level(value);
        self.commit(|s| {
            s.attributes.insert(key.to_string(), level);
        });
        level
    }

    pub fn set_flag(&mut self, flag: &str) -> bool {
        if self.state.flags.contains(flag) {
            return false;
        }
        self.commit(|s| {
            s.flags.insert(flag.to_string());
        });
        true
    }

    pub fn clear_flag(&mut self, flag: &str) -> bool {
        if !self.state.flags.contains(flag) {
            return false;
        }
        self.commit(|s| {
            s.flags.remove(flag);
        });
        true
    }

    pub fn adjust_reputation(&mut self, kind: ReputationKind, delta: i32) -> i32 {
        let value = self.state.reputation.get(kind).saturating_add(delta);
        self.commit(|s| *s.reputation.get_mut(kind) = value);
        value
    }

    pub fn adjust_relationship(&mut self, npc_id: &str, delta: i32) -> i32 {
        let value = self
            .state
            .relationships
            .get(npc_id)
            .copied()
            .unwrap_or(0)
            .saturating_add(delta);
        self.commit(|s| {
            s.relationships.insert(npc_id.to_string(), value);
        });
        value
    }

    pub fn set_phase(&mut self, phase: u32) {
        if phase != self.state.phase {
            info!("Player phase {} -> {}", self.state.phase, phase);
        }
        self.commit(|s| s.phase = phase);
    }

    pub fn set_status(&mut self, status: PlayerStatus) {
        self.commit(|s| s.status = status);
    }

    /// Merge a backend snapshot into local state following the merge table.
    ///
    /// Never a wholesale overwrite: inventory in particular keeps items granted locally
    /// before the sync finished.
    pub fn hydrate_from_server(&mut self, snapshot: &PlayerSnapshot) {
        let mut merged = self.merge.merge(&self.state, snapshot);
        merged.updated_at = self.clock.now();
        debug!(
            "Hydrated player: phase {}, {} items, {} credits",
            merged.phase,
            merged.inventory.len(),
            merged.credits
        );
        self.state = merged;
    }

    /// Explicit reset to a fresh player.
    pub fn reset(&mut self) {
        self.state = PlayerState::new(self.clock.now());
    }

    /// Put back a previously captured state verbatim.
    pub fn restore(&mut self, state: PlayerState) {
        self.state = state;
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Build the next state on a copy and swap it in, so a mutation is never half-applied.
    fn commit(&mut self, mutate: impl FnOnce(&mut PlayerState)) {
        let mut next = self.state.clone();
        mutate(&mut next);
        next.updated_at = self.clock.now().max(self.state.updated_at);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progression::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (ManualClock, PlayerStore) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let store = PlayerStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    #[test]
    fn spend_more_than_balance_fails_without_change() {
        let (_clock, mut store) = setup();
        store.add_credits(30);
        let before = store.state().clone();
        assert!(!store.spend_credits(31));
        assert_eq!(store.state(), &before);
    }

    #[test]
    fn spend_within_balance_deducts() {
        let (_clock, mut store) = setup();
        store.add_credits(30);
        assert!(store.spend_credits(30));
        assert_eq!(store.credits(), 0);
        assert!(store.spend_credits(0));
    }

    #[test]
    fn add_credits_saturates() {
        let (_clock, mut store) = setup();
        store.add_credits(u64::MAX);
        store.add_credits(5);
        assert_eq!(store.credits(), u64::MAX);
    }

    #[test]
    fn add_item_is_idempotent() {
        let (_clock, mut store) = setup();
        assert!(store.add_item("lantern"));
        assert!(!store.add_item("lantern"));
        assert_eq!(store.state().inventory.len(), 1);
    }

    #[test]
    fn remove_absent_item_is_noop() {
        let (clock, mut store) = setup();
        let before = store.state().clone();
        clock.advance(Duration::seconds(1));
        assert!(!store.remove_item("lantern"));
        assert_eq!(store.state(), &before);
    }

    #[test]
    fn skills_are_clamped_and_floored() {
        let (_clock, mut store) = setup();
        assert_eq!(store.increment_skill("herbalism", 1.0), 1);
        assert_eq!(store.increment_skill("herbalism", 2.7), 3);
        assert_eq!(store.increment_skill("herbalism", -10.0), 0);
        assert_eq!(store.set_skill("herbalism", 4.99), 4);
        assert_eq!(store.set_skill("herbalism", f64::NAN), 0);
    }

    #[test]
    fn attributes_are_a_separate_namespace() {
        let (_clock, mut store) = setup();
        store.set_skill("strength", 2.0);
        store.inc_attribute("strength", 7.0);
        assert_eq!(store.skill("strength"), 2);
        assert_eq!(store.attribute("strength"), 7);
        assert_eq!(store.set_attribute("strength", -3.0), 0);
    }

    #[test]
    fn hydrate_unions_inventory() {
        let (_clock, mut store) = setup();
        store.add_item("c");
        store.hydrate_from_server(&PlayerSnapshot {
            inventory: Some(["a".to_string(), "b".to_string()].into_iter().collect()),
            ..Default::default()
        });
        let items: Vec<_> = store.state().inventory.iter().cloned().collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[test]
    fn mutations_bump_updated_at() {
        let (clock, mut store) = setup();
        let later = clock.advance(Duration::minutes(2));
        store.set_flag("met_guide");
        assert_eq!(store.state().updated_at, later);
        assert!(!store.set_flag("met_guide"));
        assert!(store.clear_flag("met_guide"));
    }

    #[test]
    fn reputation_and_relationships_accumulate() {
        let (_clock, mut store) = setup();
        assert_eq!(store.adjust_reputation(ReputationKind::Exploration, 3), 3);
        assert_eq!(store.adjust_reputation(ReputationKind::Exploration, -5), -2);
        assert_eq!(store.adjust_relationship("ferryman", 2), 2);
        assert_eq!(store.state().reputation.exploration, -2);
    }

    #[test]
    fn reset_returns_to_fresh_player() {
        let (_clock, mut store) = setup();
        store.add_credits(10);
        store.set_phase(3);
        store.reset();
        assert_eq!(store.credits(), 0);
        assert_eq!(store.phase(), 0);
    }
}
