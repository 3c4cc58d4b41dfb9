//! Optimistic transactions: apply locally, confirm or roll back once the backend answers.
//!
//! A transaction captures the slice of state it is about to touch, applies the local
//! mutation immediately and remembers the slice as it looked right after. When the
//! remote answer arrives:
//!
//! - success: the server's version of the slice replaces the local one, unless a newer
//!   local write has happened since (stale confirmation, ignored);
//! - failure: the captured slice is restored exactly, unless a newer local write has
//!   happened since (the rollback would clobber it, so it is skipped).
//!
//! "Newer" means the slice no longer matches what this transaction wrote, or its
//! `updated_at` moved past ours. Transactions on the same entity are not serialized;
//! when two overlap and both fail, the later write's rollback wins.

use std::fmt::Debug;

use log::{debug, warn};

use crate::progression::clock::Timestamp;
use crate::progression::discovery::DiscoveryLedger;
use crate::progression::player::PlayerStore;
use crate::progression::quest::QuestStore;
use crate::progression::types::{PlayerState, PointDiscovery, QuestId, QuestProgress};

/// A store whose state can be captured and restored one slice at a time.
pub trait Reconcilable {
    type Key: Clone + Debug;
    type Slice: Clone + PartialEq + Debug;

    fn capture(&self, key: &Self::Key) -> Self::Slice;

    fn restore(&mut self, key: &Self::Key, slice: Self::Slice);

    /// Time of the last local write reflected in `slice`, if any.
    fn stamp(slice: &Self::Slice) -> Option<Timestamp>;

    /// Whether `current` is still exactly the state `applied` describes.
    fn same_write(applied: &Self::Slice, current: &Self::Slice) -> bool {
        applied == current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The server's version was written over the optimistic one.
    Reconciled,
    /// The optimistic value stands (no server version to apply).
    Kept,
    /// A newer local write superseded this transaction; the confirmation was dropped.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The pre-mutation slice was restored.
    Restored,
    /// A newer local write superseded this transaction; nothing was restored.
    Superseded,
}

/// One in-flight optimistic mutation on `T`.
#[derive(Debug)]
#[must_use = "an optimistic transaction must be committed or rolled back"]
pub struct OptimisticTransaction<T: Reconcilable> {
    key: T::Key,
    before: T::Slice,
    applied: T::Slice,
}

impl<T: Reconcilable> OptimisticTransaction<T> {
    /// Capture the slice for `key`, run `mutate`, and capture the result.
    pub fn begin<R>(target: &mut T, key: T::Key, mutate: impl FnOnce(&mut T) -> R) -> (Self, R) {
        let before = target.capture(&key);
        let result = mutate(target);
        let applied = target.capture(&key);
        (
            Self {
                key,
                before,
                applied,
            },
            result,
        )
    }

    pub fn key(&self) -> &T::Key {
        &self.key
    }

    pub fn before(&self) -> &T::Slice {
        &self.before
    }

    pub fn applied(&self) -> &T::Slice {
        &self.applied
    }

    /// True when the local mutation did not change anything.
    pub fn is_noop(&self) -> bool {
        self.before == self.applied
    }

    fn is_superseded(&self, target: &T) -> bool {
        let current = target.capture(&self.key);
        if !T::same_write(&self.applied, &current) {
            return true;
        }
        match (T::stamp(&current), T::stamp(&self.applied)) {
            (Some(now), Some(ours)) => now > ours,
            _ => false,
        }
    }

    /// Accept the remote result. `confirmed` is the server's version of the slice.
    pub fn commit(self, target: &mut T, confirmed: Option<T::Slice>) -> CommitOutcome {
        if self.is_superseded(target) {
            debug!("Dropping stale confirmation for {:?}", self.key);
            return CommitOutcome::Stale;
        }
        match confirmed {
            Some(slice) => {
                target.restore(&self.key, slice);
                CommitOutcome::Reconciled
            }
            None => CommitOutcome::Kept,
        }
    }

    /// Undo the local mutation after a remote failure.
    pub fn rollback(self, target: &mut T) -> RollbackOutcome {
        if self.is_superseded(target) {
            warn!(
                "Skipping rollback for {:?}: a newer local change superseded it",
                self.key
            );
            return RollbackOutcome::Superseded;
        }
        debug!("Rolling back optimistic change for {:?}", self.key);
        target.restore(&self.key, self.before);
        RollbackOutcome::Restored
    }
}

// ============================================================================
// Store bindings
// ============================================================================

/// One quest record plus the tracked quest id it may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestSlice {
    pub record: Option<QuestProgress>,
    pub tracked: Option<QuestId>,
}

impl Reconcilable for QuestStore {
    type Key = QuestId;
    type Slice = QuestSlice;

    fn capture(&self, key: &QuestId) -> QuestSlice {
        QuestSlice {
            record: self.get(key).cloned(),
            tracked: self.tracked_quest_id().map(str::to_string),
        }
    }

    fn restore(&mut self, key: &QuestId, slice: QuestSlice) {
        self.put_record(key, slice.record);
        self.put_tracked(slice.tracked);
    }

    fn stamp(slice: &QuestSlice) -> Option<Timestamp> {
        slice.record.as_ref().map(|r| r.updated_at)
    }

    /// Only the quest record decides; tracking may legitimately move because of
    /// other quests.
    fn same_write(applied: &QuestSlice, current: &QuestSlice) -> bool {
        applied.record == current.record
    }
}

impl Reconcilable for PlayerStore {
    type Key = ();
    type Slice = PlayerState;

    fn capture(&self, _key: &()) -> PlayerState {
        self.state().clone()
    }

    fn restore(&mut self, _key: &(), slice: PlayerState) {
        PlayerStore::restore(self, slice);
    }

    fn stamp(slice: &PlayerState) -> Option<Timestamp> {
        Some(slice.updated_at)
    }
}

impl Reconcilable for DiscoveryLedger {
    type Key = (String, String);
    type Slice = Option<PointDiscovery>;

    fn capture(&self, key: &(String, String)) -> Option<PointDiscovery> {
        self.get(&key.0, &key.1).cloned()
    }

    fn restore(&mut self, key: &(String, String), slice: Option<PointDiscovery>) {
        self.put(&key.0, &key.1, slice);
    }

    fn stamp(slice: &Option<PointDiscovery>) -> Option<Timestamp> {
        slice
            .as_ref()
            .map(|d| d.researched_at.unwrap_or(d.discovered_at))
    }
}
