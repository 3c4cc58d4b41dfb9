//! The progression engine: owns the stores for one client session and turns events
//! into optimistic local changes, backend calls and reconciliation.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::progression::backend::{BackendError, PointFilter, ProgressionBackend, QuestProgressRecord};
use crate::progression::clock::{SharedClock, Timestamp};
use crate::progression::discovery::{check_phase, DiscoveryLedger, PointCatalog};
use crate::progression::errors::ProgressionError;
use crate::progression::events::{BindingEffect, EventOutcome, ProgressionEvent, SyncStatus};
use crate::progression::geo::{position_or_fallback, BoundingBox, Coordinates};
use crate::progression::player::PlayerStore;
use crate::progression::quest::QuestStore;
use crate::progression::storage::{LoadedState, PersistenceWriter};
use crate::progression::sync::{OptimisticTransaction, QuestSlice};
use crate::progression::types::{
    BindingKind, ItemId, MapPoint, PlayerState, PointDiscovery, QuestBatchEntry, QuestBinding,
};
use crate::validation::{
    escape_for_log, normalize_scan_code, validate_email, validate_identifier, validate_password,
    validate_step, IdentifierKind,
};

/// Who is playing: the persisted device token, plus the account once signed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    device_id: String,
    user_id: Option<String>,
}

impl Identity {
    pub fn anonymous(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            user_id: None,
        }
    }

    pub fn signed_in(device_id: &str, user_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            user_id: Some(user_id.to_string()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Actor id used for discoveries and backend calls: the user id, or `device:<token>`.
    pub fn actor(&self) -> String {
        match &self.user_id {
            Some(user) => user.clone(),
            None => format!("device:{}", self.device_id),
        }
    }
}

/// Tunables the engine takes from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub default_radius_meters: f64,
    /// Used when the device has no fix; without one a missing fix is an error.
    pub fallback_position: Option<Coordinates>,
    pub scan_prefix: Option<String>,
    pub starting_credits: u64,
    pub starting_phase: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_radius_meters: 50.0,
            fallback_position: Some(Coordinates::new(47.9959, 7.8522)),
            scan_prefix: None,
            starting_credits: 0,
            starting_phase: 0,
        }
    }
}

pub struct ProgressionEngine {
    identity: Identity,
    quests: QuestStore,
    player: PlayerStore,
    discoveries: DiscoveryLedger,
    catalog: PointCatalog,
    backend: Arc<dyn ProgressionBackend>,
    persistence: Option<PersistenceWriter>,
    settings: EngineSettings,
    clock: SharedClock,
}

fn fresh_player(settings: &EngineSettings, now: Timestamp) -> PlayerState {
    let mut state = PlayerState::new(now);
    state.credits = settings.starting_credits;
    state.phase = settings.starting_phase;
    state
}

impl ProgressionEngine {
    pub fn new(
        identity: Identity,
        backend: Arc<dyn ProgressionBackend>,
        clock: SharedClock,
        settings: EngineSettings,
    ) -> Self {
        let player = PlayerStore::from_state(fresh_player(&settings, clock.now()), clock.clone());
        Self {
            identity,
            quests: QuestStore::new(clock.clone()),
            player,
            discoveries: DiscoveryLedger::new(),
            catalog: PointCatalog::new(settings.default_radius_meters),
            backend,
            persistence: None,
            settings,
            clock,
        }
    }

    pub fn with_persistence(mut self, writer: PersistenceWriter) -> Self {
        self.persistence = Some(writer);
        self
    }

    /// Seed the stores from what was found on disk.
    pub fn with_loaded_state(mut self, loaded: LoadedState) -> Self {
        if let Some(snapshot) = loaded.quests {
            self.quests = QuestStore::from_snapshot(snapshot, self.clock.clone());
        }
        if let Some(state) = loaded.player {
            self.player.restore(state);
        }
        self.discoveries = DiscoveryLedger::from_entries(loaded.discoveries);
        self
    }

    pub fn with_points(mut self, points: impl IntoIterator<Item = MapPoint>) -> Self {
        self.catalog.replace_all(points);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Attach the account after sign-in. Discoveries made anonymously stay under the
    /// device actor.
    pub fn sign_in(&mut self, user_id: &str) {
        info!("Signed in as {}", user_id);
        self.identity.user_id = Some(user_id.to_string());
    }

    /// Account sign-in: the email and password are checked before anything changes, and
    /// the normalized email becomes the user id.
    pub fn sign_in_with_credentials(&mut self, email: &str, password: &str) -> Result<(), ProgressionError> {
        validate_email(email)?;
        validate_password(password)?;
        let user_id = email.trim().to_ascii_lowercase();
        self.sign_in(&user_id);
        Ok(())
    }

    pub fn quests(&self) -> &QuestStore {
        &self.quests
    }

    pub fn player(&self) -> &PlayerStore {
        &self.player
    }

    pub fn discoveries(&self) -> &DiscoveryLedger {
        &self.discoveries
    }

    pub fn catalog(&self) -> &PointCatalog {
        &self.catalog
    }

    /// Apply one event.
    ///
    /// Quest and discovery events are applied locally first, then sent to the backend.
    /// A backend failure rolls the local change back and is returned as the error.
    ///
    /// The engine is borrowed mutably across the backend round-trip, so events from one
    /// session are applied and reconciled strictly one after another. A location fix
    /// arriving during a quest call waits for it. The `updated_at` guards of
    /// [`OptimisticTransaction`] only come into play for callers that drive several
    /// transactions on a store directly.
    pub async fn dispatch(&mut self, event: ProgressionEvent) -> Result<EventOutcome, ProgressionError> {
        debug!("Dispatching {}", event.name());
        match event {
            ProgressionEvent::StartQuest { quest_id, step } => self.start_quest(&quest_id, &step).await,
            ProgressionEvent::AdvanceQuest { quest_id, step } => {
                self.advance_quest(&quest_id, &step).await
            }
            ProgressionEvent::CompleteQuest { quest_id } => self.complete_quest(&quest_id).await,
            ProgressionEvent::Scan { code } => self.scan(&code).await,
            ProgressionEvent::LocationFix { coordinates } => self.location_fix(coordinates).await,
            ProgressionEvent::Grant { credits, items } => self.grant(credits, &items).await,
        }
    }

    // ------------------------------------------------------------------
    // Quests
    // ------------------------------------------------------------------

    pub async fn start_quest(&mut self, quest_id: &str, step: &str) -> Result<EventOutcome, ProgressionError> {
        validate_identifier(IdentifierKind::Quest, quest_id)?;
        validate_step(step)?;
        let (tx, _) = OptimisticTransaction::begin(&mut self.quests, quest_id.to_string(), |q| {
            q.start_quest(quest_id, step);
        });
        let remote = self
            .backend
            .mutate_quest_start(&self.identity.actor(), quest_id, step)
            .await;
        self.settle_quest(tx, remote).await
    }

    pub async fn advance_quest(&mut self, quest_id: &str, step: &str) -> Result<EventOutcome, ProgressionError> {
        validate_identifier(IdentifierKind::Quest, quest_id)?;
        validate_step(step)?;
        let (tx, _) = OptimisticTransaction::begin(&mut self.quests, quest_id.to_string(), |q| {
            q.advance_quest(quest_id, step)
        });
        if tx.is_noop() {
            let _ = tx.commit(&mut self.quests, None);
            return Ok(EventOutcome::Quest {
                quest_id: quest_id.to_string(),
                changed: false,
                sync: SyncStatus::Skipped,
            });
        }
        let remote = self
            .backend
            .mutate_quest_advance(&self.identity.actor(), quest_id, step)
            .await;
        self.settle_quest(tx, remote).await
    }

    pub async fn complete_quest(&mut self, quest_id: &str) -> Result<EventOutcome, ProgressionError> {
        validate_identifier(IdentifierKind::Quest, quest_id)?;
        let (tx, _) = OptimisticTransaction::begin(&mut self.quests, quest_id.to_string(), |q| {
            q.complete_quest(quest_id)
        });
        if tx.is_noop() {
            let _ = tx.commit(&mut self.quests, None);
            return Ok(EventOutcome::Quest {
                quest_id: quest_id.to_string(),
                changed: false,
                sync: SyncStatus::Skipped,
            });
        }
        let remote = self
            .backend
            .mutate_quest_complete(&self.identity.actor(), quest_id)
            .await;
        self.settle_quest(tx, remote).await
    }

    async fn settle_quest(
        &mut self,
        tx: OptimisticTransaction<QuestStore>,
        remote: Result<QuestProgressRecord, BackendError>,
    ) -> Result<EventOutcome, ProgressionError> {
        let quest_id = tx.key().clone();
        let changed = !tx.is_noop();
        match remote {
            Ok(record) => {
                let confirmed = QuestSlice {
                    record: Some(record.to_progress()),
                    tracked: self.quests.tracked_quest_id().map(str::to_string),
                };
                let outcome = tx.commit(&mut self.quests, Some(confirmed));
                self.persist_quests().await;
                Ok(EventOutcome::Quest {
                    quest_id,
                    changed,
                    sync: SyncStatus::Confirmed(outcome),
                })
            }
            Err(err) => {
                warn!("Quest {} mutation failed, rolling back: {}", quest_id, err);
                tx.rollback(&mut self.quests);
                Err(err.into())
            }
        }
    }

    /// Apply a batch of quest updates locally as one transition.
    pub async fn apply_quest_batch(&mut self, entries: &[QuestBatchEntry]) -> Result<(), ProgressionError> {
        for entry in entries {
            validate_identifier(IdentifierKind::Quest, &entry.id)?;
            if let Some(step) = &entry.step {
                validate_step(step)?;
            }
        }
        self.quests.apply_batch(entries);
        self.persist_quests().await;
        Ok(())
    }

    pub async fn set_tracked_quest(&mut self, quest_id: Option<&str>) {
        self.quests.set_tracked_quest(quest_id);
        self.persist_quests().await;
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    pub async fn scan(&mut self, raw: &str) -> Result<EventOutcome, ProgressionError> {
        info!("Scan: {}", escape_for_log(raw));
        let code = normalize_scan_code(raw, self.settings.scan_prefix.as_deref())?;
        let point = self.catalog.resolve_scan(&code)?.clone();
        self.discover(point, false).await
    }

    /// Resolve a location fix. Without a fix the configured fallback position is used.
    pub async fn location_fix(&mut self, coordinates: Option<Coordinates>) -> Result<EventOutcome, ProgressionError> {
        let (position, used_fallback) = match (coordinates, self.settings.fallback_position) {
            (fix, Some(fallback)) => {
                position_or_fallback(fix.ok_or_else(|| "no position fix".to_string()), fallback)
            }
            (Some(fix), None) if fix.is_valid() => (fix, false),
            (Some(fix), None) => {
                return Err(ProgressionError::GeolocationUnavailable(format!(
                    "invalid fix ({}, {})",
                    fix.lat, fix.lng
                )))
            }
            (None, None) => {
                return Err(ProgressionError::GeolocationUnavailable(
                    "no position fix and no fallback position".to_string(),
                ))
            }
        };
        let point = self
            .catalog
            .resolve_location(position, self.player.phase())?
            .clone();
        self.discover(point, used_fallback).await
    }

    async fn discover(&mut self, point: MapPoint, used_fallback: bool) -> Result<EventOutcome, ProgressionError> {
        check_phase(&point, self.player.phase())?;

        let actor = self.identity.actor();
        let now = self.clock.now();
        let (tx, first_time) = OptimisticTransaction::begin(
            &mut self.discoveries,
            (actor.clone(), point.key.clone()),
            |ledger| ledger.record(&actor, &point.key, now),
        );
        if !first_time {
            let _ = tx.commit(&mut self.discoveries, None);
            return Ok(EventOutcome::Discovered {
                point_key: point.key,
                first_time: false,
                effect: None,
                used_fallback_position: used_fallback,
            });
        }

        if let Err(err) = self.backend.mutate_mark_discovered(&actor, &point.key).await {
            warn!("Marking {} discovered failed, rolling back: {}", point.key, err);
            tx.rollback(&mut self.discoveries);
            return Err(err.into());
        }

        // The discovery only stands once its binding went through, so a failed binding
        // can be retried by discovering the point again.
        let effect = match &point.quest_binding {
            Some(binding) => match self.apply_binding(binding).await {
                Ok(effect) => Some(effect),
                Err(err) => {
                    tx.rollback(&mut self.discoveries);
                    return Err(err);
                }
            },
            None => None,
        };

        let _ = tx.commit(&mut self.discoveries, None);
        let entry = self.discoveries.get(&actor, &point.key).cloned();
        self.persist_discovery(&actor, &point.key, entry).await;

        Ok(EventOutcome::Discovered {
            point_key: point.key,
            first_time: true,
            effect,
            used_fallback_position: used_fallback,
        })
    }

    async fn apply_binding(&mut self, binding: &QuestBinding) -> Result<BindingEffect, ProgressionError> {
        let quest_id = binding.quest_id.clone();
        match &binding.kind {
            BindingKind::Start { step } => {
                if self.quests.is_started(&quest_id) {
                    return Ok(BindingEffect::AlreadyStarted { quest_id });
                }
                self.start_quest(&quest_id, step).await?;
                Ok(BindingEffect::QuestStarted { quest_id })
            }
            BindingKind::Objective { step } => {
                let changed = match self.advance_quest(&quest_id, step).await? {
                    EventOutcome::Quest { changed, .. } => changed,
                    _ => false,
                };
                Ok(BindingEffect::QuestAdvanced {
                    quest_id,
                    step: step.clone(),
                    changed,
                })
            }
            BindingKind::Reward { credits, items } => {
                let new_items = self.grant_locally(*credits, items);
                self.persist_player().await;
                Ok(BindingEffect::Rewarded {
                    credits: *credits,
                    new_items,
                })
            }
            BindingKind::Unlock { flag } => {
                let newly_set = self.player.set_flag(flag);
                self.persist_player().await;
                Ok(BindingEffect::Unlocked {
                    flag: flag.clone(),
                    newly_set,
                })
            }
        }
    }

    /// Stamp research on a point the current actor has discovered.
    pub async fn mark_researched(&mut self, point_key: &str) -> Result<bool, ProgressionError> {
        validate_identifier(IdentifierKind::Point, point_key)?;
        let actor = self.identity.actor();
        let now = self.clock.now();
        let changed = self.discoveries.mark_researched(&actor, point_key, now)?;
        if changed {
            let entry = self.discoveries.get(&actor, point_key).cloned();
            self.persist_discovery(&actor, point_key, entry).await;
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Player
    // ------------------------------------------------------------------

    pub async fn grant(&mut self, credits: u64, items: &[ItemId]) -> Result<EventOutcome, ProgressionError> {
        for item in items {
            validate_identifier(IdentifierKind::Item, item)?;
        }
        let new_items = self.grant_locally(credits, items);
        self.persist_player().await;
        Ok(EventOutcome::Granted { credits, new_items })
    }

    fn grant_locally(&mut self, credits: u64, items: &[ItemId]) -> Vec<ItemId> {
        if credits > 0 {
            self.player.add_credits(credits);
        }
        items
            .iter()
            .filter(|item| self.player.add_item(item))
            .cloned()
            .collect()
    }

    /// Run a local player mutation and persist the result.
    pub async fn update_player<R>(&mut self, mutate: impl FnOnce(&mut PlayerStore) -> R) -> R {
        let result = mutate(&mut self.player);
        self.persist_player().await;
        result
    }

    // ------------------------------------------------------------------
    // Backend sync
    // ------------------------------------------------------------------

    /// Merge the backend's player snapshot into local state. Returns false when the
    /// backend has no record for this actor.
    pub async fn sync_player(&mut self) -> Result<bool, ProgressionError> {
        let Some(snapshot) = self.backend.query_player_state(&self.identity.actor()).await? else {
            return Ok(false);
        };
        self.player.hydrate_from_server(&snapshot);
        self.persist_player().await;
        Ok(true)
    }

    /// Replace local quests with the backend's view.
    pub async fn sync_quests(&mut self) -> Result<usize, ProgressionError> {
        let server_quests = self.backend.query_quests(&self.identity.actor()).await?;
        self.quests.hydrate(&server_quests);
        self.persist_quests().await;
        Ok(server_quests.len())
    }

    /// Reload visible points for the player's phase, optionally limited to a radius
    /// around `center`.
    pub async fn refresh_points(&mut self, center: Option<(Coordinates, f64)>) -> Result<usize, ProgressionError> {
        let filter = PointFilter {
            phase: Some(self.player.phase()),
            bbox: center.map(|(c, r)| BoundingBox::around(c, r)),
        };
        let points = self.backend.query_visible_points(&filter).await?;
        let count = points.len();
        self.catalog.replace_all(points);
        debug!("Loaded {} visible points", count);
        Ok(count)
    }

    /// Wipe local progression back to a fresh player.
    pub async fn reset(&mut self) {
        self.quests.clear();
        self.player
            .restore(fresh_player(&self.settings, self.clock.now()));
        self.discoveries.clear();
        if let Some(writer) = &self.persistence {
            writer.reset().await;
        }
        info!("Progression reset for {}", self.identity.actor());
    }

    /// Wait for all queued writes to reach disk.
    pub async fn flush(&self) -> Result<(), ProgressionError> {
        match &self.persistence {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }

    /// Flush and stop the background writer.
    pub async fn shutdown(self) -> Result<(), ProgressionError> {
        match self.persistence {
            Some(writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    async fn persist_quests(&self) {
        if let Some(writer) = &self.persistence {
            writer.save_quests(self.quests.snapshot()).await;
        }
    }

    async fn persist_player(&self) {
        if let Some(writer) = &self.persistence {
            writer.save_player(self.player.state().clone()).await;
        }
    }

    async fn persist_discovery(&self, actor: &str, point_key: &str, entry: Option<PointDiscovery>) {
        if let Some(writer) = &self.persistence {
            writer.save_discovery(actor, point_key, entry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progression::backend::InMemoryBackend;
    use crate::progression::clock::ManualClock;
    use crate::progression::types::{QuestProgress, QuestSnapshot};
    use chrono::{TimeZone, Utc};

    fn engine() -> (InMemoryBackend, ProgressionEngine) {
        let clock: SharedClock =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()));
        let backend = InMemoryBackend::new(clock.clone());
        let settings = EngineSettings {
            starting_credits: 25,
            ..EngineSettings::default()
        };
        let engine = ProgressionEngine::new(
            Identity::anonymous("0b7c"),
            Arc::new(backend.clone()),
            clock,
            settings,
        );
        (backend, engine)
    }

    #[test]
    fn actor_prefers_user_id() {
        assert_eq!(Identity::anonymous("abc").actor(), "device:abc");
        assert_eq!(Identity::signed_in("abc", "u-7").actor(), "u-7");
    }

    #[test]
    fn malformed_credentials_keep_the_device_identity() {
        let (_backend, mut engine) = engine();
        assert!(matches!(
            engine.sign_in_with_credentials("wanderer-at-example.de", "schwarzwald7"),
            Err(ProgressionError::Validation(_))
        ));
        assert!(matches!(
            engine.sign_in_with_credentials("wanderer@example.de", "short"),
            Err(ProgressionError::Validation(_))
        ));
        assert_eq!(engine.identity().actor(), "device:0b7c");

        engine
            .sign_in_with_credentials(" Wanderer@Example.de ", "schwarzwald7")
            .unwrap();
        assert_eq!(engine.identity().user_id(), Some("wanderer@example.de"));
        assert_eq!(engine.identity().actor(), "wanderer@example.de");
    }

    #[tokio::test]
    async fn starting_balance_comes_from_settings() {
        let (_backend, mut engine) = engine();
        assert_eq!(engine.player().credits(), 25);
        engine.grant(5, &[]).await.unwrap();
        engine.reset().await;
        assert_eq!(engine.player().credits(), 25);
    }

    #[tokio::test]
    async fn repeated_advance_skips_backend() {
        let (backend, mut engine) = engine();
        engine.start_quest("intro", "s1").await.unwrap();
        let outcome = engine.advance_quest("intro", "s1").await.unwrap();
        assert_eq!(
            outcome,
            EventOutcome::Quest {
                quest_id: "intro".into(),
                changed: false,
                sync: SyncStatus::Skipped
            }
        );
        assert_eq!(backend.calls(), vec!["mutate_quest_start"]);
    }

    #[test]
    fn loaded_completed_tracked_quest_is_retracked() {
        let (_backend, engine) = engine();
        let at = Utc.with_ymd_and_hms(2024, 5, 30, 9, 0, 0).unwrap();
        let mut snapshot = QuestSnapshot::default();
        snapshot
            .quests
            .insert("intro".into(), QuestProgress::completed("intro", at));
        snapshot
            .quests
            .insert("mill".into(), QuestProgress::at_step("mill", "find_wheel", at));
        snapshot.tracked_quest_id = Some("intro".into());

        let engine = engine.with_loaded_state(LoadedState {
            quests: Some(snapshot),
            ..LoadedState::default()
        });
        assert_eq!(engine.quests().tracked_quest_id(), Some("mill"));
    }

    #[tokio::test]
    async fn invalid_quest_id_touches_nothing() {
        let (backend, mut engine) = engine();
        let err = engine.start_quest("Bad Id", "s1").await.unwrap_err();
        assert!(matches!(err, ProgressionError::Validation(_)));
        assert!(engine.quests().is_empty());
        assert!(backend.calls().is_empty());
    }
}
