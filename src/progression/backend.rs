//! Remote document-store contract and an in-memory implementation.
//!
//! The engine only depends on [`ProgressionBackend`]; production wires a network client,
//! tests and the offline CLI use [`InMemoryBackend`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::progression::clock::{SharedClock, Timestamp};
use crate::progression::geo::BoundingBox;
use crate::progression::types::{
    MapPoint, PlayerSnapshot, QuestId, QuestProgress, QuestStep, ServerQuest, COMPLETED_STEP,
};

/// Remote failures as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("network error: {0}")]
    Network(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Network(_))
    }
}

/// Quest progress as stored server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestProgressRecord {
    pub quest_id: QuestId,
    pub current_step: QuestStep,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

impl QuestProgressRecord {
    pub fn from_progress(progress: &QuestProgress) -> Self {
        Self {
            quest_id: progress.id.clone(),
            current_step: progress.step.clone(),
            started_at: progress.started_at,
            updated_at: progress.updated_at,
            completed_at: progress.completed_at,
        }
    }

    /// Local record equivalent; keeps the local invariants even if the server's copy is sloppy.
    pub fn to_progress(&self) -> QuestProgress {
        let mut record = match self.completed_at {
            Some(at) => QuestProgress::completed(&self.quest_id, at),
            None => QuestProgress::at_step(&self.quest_id, &self.current_step, self.updated_at),
        };
        record.started_at = self.started_at.min(record.updated_at);
        record
    }

    pub fn to_server_quest(&self) -> ServerQuest {
        ServerQuest {
            id: self.quest_id.clone(),
            current_step: self.current_step.clone(),
            completed_at: self.completed_at,
            started_at: Some(self.started_at),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PointFilter {
    #[serde(default)]
    pub phase: Option<u32>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

impl PointFilter {
    pub fn matches(&self, point: &MapPoint) -> bool {
        point.is_visible
            && self.phase.map_or(true, |phase| point.unlocked_for(phase))
            && self.bbox.map_or(true, |bbox| bbox.contains(point.coordinates))
    }
}

#[async_trait]
pub trait ProgressionBackend: Send + Sync {
    async fn query_player_state(&self, user_id: &str) -> Result<Option<PlayerSnapshot>, BackendError>;

    async fn query_quests(&self, user_id: &str) -> Result<Vec<ServerQuest>, BackendError>;

    async fn mutate_quest_start(
        &self,
        user_id: &str,
        quest_id: &str,
        initial_step: &str,
    ) -> Result<QuestProgressRecord, BackendError>;

    async fn mutate_quest_advance(
        &self,
        user_id: &str,
        quest_id: &str,
        step: &str,
    ) -> Result<QuestProgressRecord, BackendError>;

    /// Fails with `NotFound` when the user has no prior progress on `quest_id`.
    async fn mutate_quest_complete(
        &self,
        user_id: &str,
        quest_id: &str,
    ) -> Result<QuestProgressRecord, BackendError>;

    async fn query_visible_points(&self, filter: &PointFilter) -> Result<Vec<MapPoint>, BackendError>;

    /// Idempotent.
    async fn mutate_mark_discovered(&self, actor_id: &str, point_key: &str) -> Result<(), BackendError>;
}

#[derive(Default)]
struct InMemoryState {
    players: HashMap<String, PlayerSnapshot>,
    quests: HashMap<String, BTreeMap<QuestId, QuestProgressRecord>>,
    points: Vec<MapPoint>,
    discovered: BTreeSet<(String, String)>,
    failures: VecDeque<(Option<String>, BackendError)>,
    calls: Vec<String>,
}

impl InMemoryState {
    fn take_failure(&mut self, call: &str) -> Option<BackendError> {
        let pos = self
            .failures
            .iter()
            .position(|(target, _)| target.as_deref().map_or(true, |t| t == call))?;
        self.failures.remove(pos).map(|(_, err)| err)
    }
}

/// Backend kept entirely in memory, with scripted failure injection.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<InMemoryState>>,
    clock: SharedClock,
}

impl InMemoryBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            clock,
        }
    }

    pub fn with_points(self, points: Vec<MapPoint>) -> Self {
        self.lock().points = points;
        self
    }

    pub fn put_player(&self, user_id: &str, snapshot: PlayerSnapshot) {
        self.lock().players.insert(user_id.to_string(), snapshot);
    }

    pub fn put_point(&self, point: MapPoint) {
        let mut state = self.lock();
        state.points.retain(|p| p.key != point.key);
        state.points.push(point);
    }

    /// Seed server-side progress, e.g. mirrored from a local store in offline mode.
    pub fn put_quest_record(&self, user_id: &str, record: QuestProgressRecord) {
        self.lock()
            .quests
            .entry(user_id.to_string())
            .or_default()
            .insert(record.quest_id.clone(), record);
    }

    /// The next backend call fails with `err` (calls are failed in FIFO order).
    pub fn fail_next(&self, err: BackendError) {
        self.lock().failures.push_back((None, err));
    }

    /// The next call named `call` (e.g. `"mutate_quest_start"`) fails with `err`.
    pub fn fail_on(&self, call: &str, err: BackendError) {
        self.lock().failures.push_back((Some(call.to_string()), err));
    }

    pub fn quest_record(&self, user_id: &str, quest_id: &str) -> Option<QuestProgressRecord> {
        self.lock()
            .quests
            .get(user_id)
            .and_then(|quests| quests.get(quest_id))
            .cloned()
    }

    pub fn is_discovered(&self, actor_id: &str, point_key: &str) -> bool {
        self.lock()
            .discovered
            .contains(&(actor_id.to_string(), point_key.to_string()))
    }

    /// Names of the calls received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enter(&self, call: &str, user_id: &str) -> Result<MutexGuard<'_, InMemoryState>, BackendError> {
        let mut state = self.lock();
        state.calls.push(call.to_string());
        if let Some(err) = state.take_failure(call) {
            debug!("InMemoryBackend: injected failure for {}: {}", call, err);
            return Err(err);
        }
        if user_id.is_empty() {
            return Err(BackendError::Unauthenticated);
        }
        Ok(state)
    }
}

#[async_trait]
impl ProgressionBackend for InMemoryBackend {
    async fn query_player_state(&self, user_id: &str) -> Result<Option<PlayerSnapshot>, BackendError> {
        let state = self.enter("query_player_state", user_id)?;
        Ok(state.players.get(user_id).cloned())
    }

    async fn query_quests(&self, user_id: &str) -> Result<Vec<ServerQuest>, BackendError> {
        let state = self.enter("query_quests", user_id)?;
        Ok(state
            .quests
            .get(user_id)
            .map(|quests| quests.values().map(QuestProgressRecord::to_server_quest).collect())
            .unwrap_or_default())
    }

    async fn mutate_quest_start(
        &self,
        user_id: &str,
        quest_id: &str,
        initial_step: &str,
    ) -> Result<QuestProgressRecord, BackendError> {
        let now = self.clock.now();
        let mut state = self.enter("mutate_quest_start", user_id)?;
        let record = QuestProgressRecord {
            quest_id: quest_id.to_string(),
            current_step: initial_step.to_string(),
            started_at: now,
            updated_at: now,
            completed_at: (initial_step == COMPLETED_STEP).then_some(now),
        };
        state
            .quests
            .entry(user_id.to_string())
            .or_default()
            .insert(quest_id.to_string(), record.clone());
        Ok(record)
    }

    async fn mutate_quest_advance(
        &self,
        user_id: &str,
        quest_id: &str,
        step: &str,
    ) -> Result<QuestProgressRecord, BackendError> {
        let now = self.clock.now();
        let mut state = self.enter("mutate_quest_advance", user_id)?;
        let quests = state.quests.entry(user_id.to_string()).or_default();
        let record = quests
            .entry(quest_id.to_string())
            .or_insert_with(|| QuestProgressRecord {
                quest_id: quest_id.to_string(),
                current_step: step.to_string(),
                started_at: now,
                updated_at: now,
                completed_at: None,
            });
        if record.current_step != step {
            record.current_step = step.to_string();
            record.updated_at = now;
            record.completed_at = (step == COMPLETED_STEP).then_some(now);
        }
        Ok(record.clone())
    }

    async fn mutate_quest_complete(
        &self,
        user_id: &str,
        quest_id: &str,
    ) -> Result<QuestProgressRecord, BackendError> {
        let now = self.clock.now();
        let mut state = self.enter("mutate_quest_complete", user_id)?;
        let record = state
            .quests
            .get_mut(user_id)
            .and_then(|quests| quests.get_mut(quest_id))
            .ok_or_else(|| BackendError::NotFound(format!("quest progress: {}", quest_id)))?;
        if record.completed_at.is_none() {
            record.current_step = COMPLETED_STEP.to_string();
            record.updated_at = now;
            record.completed_at = Some(now);
        }
        Ok(record.clone())
    }

    async fn query_visible_points(&self, filter: &PointFilter) -> Result<Vec<MapPoint>, BackendError> {
        let mut state = self.lock();
        state.calls.push("query_visible_points".to_string());
        if let Some(err) = state.take_failure("query_visible_points") {
            return Err(err);
        }
        Ok(state.points.iter().filter(|p| filter.matches(p)).cloned().collect())
    }

    async fn mutate_mark_discovered(&self, actor_id: &str, point_key: &str) -> Result<(), BackendError> {
        let mut state = self.enter("mutate_mark_discovered", actor_id)?;
        state
            .discovered
            .insert((actor_id.to_string(), point_key.to_string()));
        Ok(())
    }
}
