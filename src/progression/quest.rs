//! Quest lifecycle state machine.
//!
//! Each quest id moves `unstarted -> step S0 -> S1 -> ... -> "completed"`. Step labels
//! are opaque except for the reserved terminal [`COMPLETED_STEP`]. At most one quest is
//! tracked (shown as the active waypoint) and it is never a completed one once a
//! start/advance/complete/batch/hydrate call returns.

use std::collections::BTreeMap;

use log::debug;

use crate::progression::clock::{SharedClock, Timestamp};
use crate::progression::types::{
    QuestBatchEntry, QuestId, QuestProgress, QuestSnapshot, ServerQuest, COMPLETED_STEP,
};

pub struct QuestStore {
    quests: BTreeMap<QuestId, QuestProgress>,
    tracked: Option<QuestId>,
    clock: SharedClock,
}

impl QuestStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            quests: BTreeMap::new(),
            tracked: None,
            clock,
        }
    }

    /// Rebuild a store from a persisted snapshot.
    pub fn from_snapshot(snapshot: QuestSnapshot, clock: SharedClock) -> Self {
        let mut store = Self {
            quests: snapshot.quests,
            tracked: snapshot.tracked_quest_id,
            clock,
        };
        store.drop_invalid_tracking();
        store
    }

    pub fn get(&self, id: &str) -> Option<&QuestProgress> {
        self.quests.get(id)
    }

    pub fn is_started(&self, id: &str) -> bool {
        self.quests.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.quests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quests.is_empty()
    }

    /// Quests in id order.
    pub fn iter(&self) -> impl Iterator<Item = &QuestProgress> {
        self.quests.values()
    }

    pub fn active_quests(&self) -> impl Iterator<Item = &QuestProgress> {
        self.quests.values().filter(|q| !q.is_completed())
    }

    pub fn completed_quests(&self) -> impl Iterator<Item = &QuestProgress> {
        self.quests.values().filter(|q| q.is_completed())
    }

    pub fn tracked_quest_id(&self) -> Option<&str> {
        self.tracked.as_deref()
    }

    pub fn tracked_quest(&self) -> Option<&QuestProgress> {
        self.tracked.as_ref().and_then(|id| self.quests.get(id))
    }

    /// Create (or overwrite) the record for `id` at `initial_step`.
    ///
    /// An existing record is replaced, progress included. Callers that must not reset
    /// an in-flight quest check [`QuestStore::is_started`] first.
    pub fn start_quest(&mut self, id: &str, initial_step: &str) -> &QuestProgress {
        let now = self.clock.now();
        let record = QuestProgress::at_step(id, initial_step, now);
        if let Some(previous) = self.quests.get(id) {
            debug!(
                "Restarting quest {} (was at step '{}')",
                id, previous.step
            );
        }
        let completed = record.is_completed();
        self.quests.insert(id.to_string(), record);

        if completed {
            self.reelect_if_tracking(id);
        } else if self.tracked.is_none() {
            self.tracked = Some(id.to_string());
        }
        &self.quests[id]
    }

    /// Move `id` to `step`. Returns false when the quest was already at `step`.
    ///
    /// Moving to the same step changes nothing, not even `updated_at`. A missing record
    /// is started at `step`. Moving to `"completed"` behaves like [`QuestStore::complete_quest`].
    pub fn advance_quest(&mut self, id: &str, step: &str) -> bool {
        let Some(current) = self.quests.get(id) else {
            self.start_quest(id, step);
            return true;
        };
        if current.step == step {
            return false;
        }
        if step == COMPLETED_STEP {
            return self.complete_quest(id);
        }

        let next = current.moved_to(step, self.clock.now());
        self.quests.insert(id.to_string(), next);
        true
    }

    /// Mark `id` completed at the current time. Returns false if it already was.
    ///
    /// A completed quest keeps its original completion time. Completing the tracked
    /// quest hands tracking to the next active quest in id order, if any.
    pub fn complete_quest(&mut self, id: &str) -> bool {
        let now = self.clock.now();
        let next = match self.quests.get(id) {
            Some(current) if current.is_completed() => return false,
            Some(current) => current.complete_at(now.max(current.started_at)),
            None => QuestProgress::completed(id, now),
        };
        self.quests.insert(id.to_string(), next);
        self.reelect_if_tracking(id);
        true
    }

    /// Apply `entries` in order as one state transition.
    ///
    /// An entry with `completed_at` completes the quest at exactly that time; otherwise
    /// a `step` advances it under the same rules as [`QuestStore::advance_quest`].
    /// Tracking is re-elected once, from the final state.
    pub fn apply_batch(&mut self, entries: &[QuestBatchEntry]) {
        let now = self.clock.now();
        let mut next = self.quests.clone();
        let mut first_started: Option<QuestId> = None;

        for entry in entries {
            if let Some(at) = entry.completed_at {
                let record = match next.get(&entry.id) {
                    Some(current) => current.complete_at(at),
                    None => QuestProgress::completed(&entry.id, at),
                };
                next.insert(entry.id.clone(), record);
                continue;
            }
            let Some(step) = entry.step.as_deref() else {
                continue;
            };
            let record = match next.get(&entry.id) {
                Some(current) if current.step == step => continue,
                Some(current) => current.moved_to(step, now),
                None => {
                    if step != COMPLETED_STEP && first_started.is_none() {
                        first_started = Some(entry.id.clone());
                    }
                    QuestProgress::at_step(&entry.id, step, now)
                }
            };
            next.insert(entry.id.clone(), record);
        }

        self.quests = next;
        if self.tracked.is_none() {
            self.tracked = first_started.filter(|id| self.is_trackable(id));
        }
        self.drop_invalid_tracking();
    }

    /// Replace the whole store with the backend's view.
    ///
    /// Entries carrying `completed_at` become completed records; the rest become active
    /// records started at the backend's `started_at` when it is reported, else now.
    /// The tracked quest survives if it is still active, otherwise tracking is re-elected.
    pub fn hydrate(&mut self, server_quests: &[ServerQuest]) {
        let now = self.clock.now();
        let mut next = BTreeMap::new();
        for quest in server_quests {
            let record = match quest.completed_at {
                Some(at) => {
                    let mut record = QuestProgress::completed(&quest.id, at);
                    if let Some(started) = quest.started_at {
                        record.started_at = started.min(at);
                    }
                    record
                }
                None if quest.current_step == COMPLETED_STEP => {
                    QuestProgress::completed(&quest.id, quest.started_at.unwrap_or(now))
                }
                None => {
                    let started = quest.started_at.map_or(now, |s| s.min(now));
                    let mut record = QuestProgress::at_step(&quest.id, &quest.current_step, now);
                    record.started_at = started;
                    record
                }
            };
            next.insert(quest.id.clone(), record);
        }
        self.quests = next;

        let keep = self
            .tracked
            .as_deref()
            .map_or(false, |id| self.is_trackable(id));
        if !keep {
            self.tracked = self.next_trackable(None);
        }
        debug!(
            "Hydrated {} quests from server (tracked: {:?})",
            self.quests.len(),
            self.tracked
        );
    }

    /// Direct override of the tracked quest. No validation against the quest's step.
    pub fn set_tracked_quest(&mut self, id: Option<&str>) {
        self.tracked = id.map(str::to_string);
    }

    pub fn snapshot(&self) -> QuestSnapshot {
        QuestSnapshot {
            quests: self.quests.clone(),
            tracked_quest_id: self.tracked.clone(),
        }
    }

    /// Replace or remove a single record without touching tracking.
    pub(crate) fn put_record(&mut self, id: &str, record: Option<QuestProgress>) {
        match record {
            Some(record) => {
                self.quests.insert(id.to_string(), record);
            }
            None => {
                self.quests.remove(id);
            }
        }
    }

    pub(crate) fn put_tracked(&mut self, tracked: Option<QuestId>) {
        self.tracked = tracked;
        self.drop_invalid_tracking();
    }

    pub fn clear(&mut self) {
        self.quests.clear();
        self.tracked = None;
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn is_trackable(&self, id: &str) -> bool {
        self.quests.get(id).map_or(false, |q| !q.is_completed())
    }

    fn next_trackable(&self, excluding: Option<&str>) -> Option<QuestId> {
        self.quests
            .values()
            .find(|q| !q.is_completed() && Some(q.id.as_str()) != excluding)
            .map(|q| q.id.clone())
    }

    fn reelect_if_tracking(&mut self, finished: &str) {
        if self.tracked.as_deref() == Some(finished) {
            self.tracked = self.next_trackable(Some(finished));
            debug!("Tracked quest {} finished; now tracking {:?}", finished, self.tracked);
        }
    }

    fn drop_invalid_tracking(&mut self) {
        let Some(id) = self.tracked.clone() else {
            return;
        };
        match self.quests.get(&id) {
            Some(q) if q.is_completed() => {
                self.tracked = self.next_trackable(Some(&id));
            }
            None => {
                self.tracked = self.next_trackable(None);
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progression::clock::{Clock, ManualClock};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (ManualClock, QuestStore) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 20, 10, 0, 0).unwrap());
        let store = QuestStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    fn assert_tracking_invariant(store: &QuestStore) {
        if let Some(id) = store.tracked_quest_id() {
            let quest = store.get(id).expect("tracked quest exists");
            assert!(!quest.is_completed(), "tracked quest {} is completed", id);
        }
    }

    #[test]
    fn start_sets_timestamps_and_tracks_first_quest() {
        let (clock, mut store) = setup();
        let record = store.start_quest("intro", "step1").clone();
        assert_eq!(record.started_at, clock.now());
        assert_eq!(record.updated_at, clock.now());
        assert_eq!(record.completed_at, None);
        assert_eq!(store.tracked_quest_id(), Some("intro"));

        store.start_quest("market", "a");
        assert_eq!(store.tracked_quest_id(), Some("intro"));
    }

    #[test]
    fn restart_overwrites_progress() {
        let (clock, mut store) = setup();
        store.start_quest("intro", "step1");
        clock.advance(Duration::minutes(1));
        store.advance_quest("intro", "step2");
        clock.advance(Duration::minutes(1));
        store.start_quest("intro", "step1");
        let record = store.get("intro").unwrap();
        assert_eq!(record.step, "step1");
        assert_eq!(record.started_at, clock.now());
    }

    #[test]
    fn advance_to_same_step_changes_nothing() {
        let (clock, mut store) = setup();
        store.start_quest("intro", "step1");
        let before = store.get("intro").unwrap().clone();
        clock.advance(Duration::minutes(3));
        assert!(!store.advance_quest("intro", "step1"));
        assert_eq!(store.get("intro").unwrap(), &before);
    }

    #[test]
    fn advance_bumps_updated_at_only() {
        let (clock, mut store) = setup();
        let started = store.start_quest("intro", "step1").started_at;
        let later = clock.advance(Duration::minutes(3));
        assert!(store.advance_quest("intro", "step2"));
        let record = store.get("intro").unwrap();
        assert_eq!(record.step, "step2");
        assert_eq!(record.started_at, started);
        assert_eq!(record.updated_at, later);
    }

    #[test]
    fn advance_without_record_starts_quest() {
        let (_clock, mut store) = setup();
        assert!(store.advance_quest("side", "s2"));
        assert_eq!(store.get("side").unwrap().step, "s2");
        assert_eq!(store.tracked_quest_id(), Some("side"));
    }

    #[test]
    fn advance_reopens_completed_quest() {
        let (clock, mut store) = setup();
        store.start_quest("intro", "step1");
        store.complete_quest("intro");
        clock.advance(Duration::minutes(1));
        store.advance_quest("intro", "epilogue");
        let record = store.get("intro").unwrap();
        assert_eq!(record.completed_at, None);
        assert!(!record.is_completed());
    }

    #[test]
    fn complete_sets_completed_at_equal_to_updated_at() {
        let (clock, mut store) = setup();
        store.start_quest("intro", "step1");
        let done_at = clock.advance(Duration::minutes(10));
        assert!(store.complete_quest("intro"));
        let record = store.get("intro").unwrap();
        assert_eq!(record.step, COMPLETED_STEP);
        assert_eq!(record.completed_at, Some(done_at));
        assert_eq!(record.updated_at, done_at);
    }

    #[test]
    fn completing_twice_keeps_first_completion_time() {
        let (clock, mut store) = setup();
        store.start_quest("intro", "step1");
        store.complete_quest("intro");
        let first = store.get("intro").unwrap().clone();
        clock.advance(Duration::minutes(10));
        assert!(!store.complete_quest("intro"));
        assert_eq!(store.get("intro").unwrap(), &first);
    }

    #[test]
    fn completing_tracked_quest_reelects_next_active() {
        let (_clock, mut store) = setup();
        store.start_quest("b_quest", "1");
        store.start_quest("a_quest", "1");
        store.start_quest("c_quest", "1");
        store.complete_quest("a_quest");
        assert_eq!(store.tracked_quest_id(), Some("b_quest"));

        store.complete_quest("b_quest");
        assert_eq!(store.tracked_quest_id(), Some("c_quest"));

        store.complete_quest("c_quest");
        assert_eq!(store.tracked_quest_id(), None);
    }

    #[test]
    fn advancing_to_completed_step_behaves_like_complete() {
        let (_clock, mut store) = setup();
        store.start_quest("intro", "step1");
        store.advance_quest("intro", COMPLETED_STEP);
        let record = store.get("intro").unwrap();
        assert!(record.completed_at.is_some());
        assert_eq!(store.tracked_quest_id(), None);
    }

    #[test]
    fn batch_completion_uses_given_timestamp_and_clears_tracking() {
        let (clock, mut store) = setup();
        store.start_quest("intro", "step1");
        let t = clock.advance(Duration::minutes(30));
        clock.advance(Duration::minutes(5));
        store.apply_batch(&[QuestBatchEntry::completed("intro", t)]);

        let record = store.get("intro").unwrap();
        assert_eq!(record.step, COMPLETED_STEP);
        assert_eq!(record.completed_at, Some(t));
        assert_eq!(record.updated_at, t);
        assert_eq!(store.tracked_quest_id(), None);
    }

    #[test]
    fn batch_applies_in_order_and_reelects_once() {
        let (clock, mut store) = setup();
        store.start_quest("a", "1");
        store.start_quest("b", "1");
        let t = clock.advance(Duration::minutes(1));
        store.apply_batch(&[
            QuestBatchEntry::step("a", "2"),
            QuestBatchEntry::completed("a", t),
            QuestBatchEntry::step("b", "1"),
            QuestBatchEntry::step("c", "start"),
        ]);
        assert!(store.get("a").unwrap().is_completed());
        assert_eq!(store.get("b").unwrap().updated_at, store.get("b").unwrap().started_at);
        assert_eq!(store.get("c").unwrap().step, "start");
        assert_eq!(store.tracked_quest_id(), Some("b"));
        assert_tracking_invariant(&store);
    }

    #[test]
    fn batch_on_empty_store_tracks_first_started_quest() {
        let (_clock, mut store) = setup();
        store.apply_batch(&[QuestBatchEntry::step("z", "1"), QuestBatchEntry::step("m", "1")]);
        assert_eq!(store.tracked_quest_id(), Some("z"));
    }

    #[test]
    fn hydrate_replaces_content_and_keeps_valid_tracking() {
        let (clock, mut store) = setup();
        store.start_quest("local_only", "1");
        store.start_quest("intro", "1");
        store.set_tracked_quest(Some("intro"));

        let done = clock.now() - Duration::days(1);
        store.hydrate(&[
            ServerQuest {
                id: "intro".into(),
                current_step: "3".into(),
                completed_at: None,
                started_at: None,
            },
            ServerQuest {
                id: "tutorial".into(),
                current_step: COMPLETED_STEP.into(),
                completed_at: Some(done),
                started_at: None,
            },
        ]);

        assert!(store.get("local_only").is_none());
        assert_eq!(store.get("intro").unwrap().step, "3");
        assert_eq!(store.get("intro").unwrap().started_at, clock.now());
        assert_eq!(store.get("tutorial").unwrap().completed_at, Some(done));
        assert_eq!(store.tracked_quest_id(), Some("intro"));
    }

    #[test]
    fn hydrate_preserves_reported_start_time() {
        let (clock, mut store) = setup();
        let started = clock.now() - Duration::days(3);
        store.hydrate(&[ServerQuest {
            id: "intro".into(),
            current_step: "2".into(),
            completed_at: None,
            started_at: Some(started),
        }]);
        let record = store.get("intro").unwrap();
        assert_eq!(record.started_at, started);
        assert_eq!(record.updated_at, clock.now());
    }

    #[test]
    fn hydrate_reelects_when_tracked_completed_remotely() {
        let (clock, mut store) = setup();
        store.start_quest("intro", "1");
        store.hydrate(&[
            ServerQuest {
                id: "intro".into(),
                current_step: COMPLETED_STEP.into(),
                completed_at: Some(clock.now()),
                started_at: None,
            },
            ServerQuest {
                id: "market".into(),
                current_step: "1".into(),
                completed_at: None,
                started_at: None,
            },
        ]);
        assert_eq!(store.tracked_quest_id(), Some("market"));
    }

    #[test]
    fn set_tracked_is_not_validated() {
        let (_clock, mut store) = setup();
        store.set_tracked_quest(Some("ghost"));
        assert_eq!(store.tracked_quest_id(), Some("ghost"));
        store.set_tracked_quest(None);
        assert_eq!(store.tracked_quest_id(), None);
    }

    #[test]
    fn tracking_invariant_holds_over_mixed_sequence() {
        let (clock, mut store) = setup();
        let ids = ["q1", "q2", "q3", "q4"];
        for (round, id) in ids.iter().cycle().take(24).enumerate() {
            clock.advance(Duration::seconds(7));
            match round % 4 {
                0 => {
                    store.start_quest(id, "s0");
                }
                1 => {
                    store.advance_quest(id, &format!("s{}", round));
                }
                2 => {
                    store.complete_quest(id);
                }
                _ => store.apply_batch(&[
                    QuestBatchEntry::completed(id, clock.now()),
                    QuestBatchEntry::step("q1", "again"),
                ]),
            }
            assert_tracking_invariant(&store);
        }
    }
}
