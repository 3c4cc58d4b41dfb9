use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::progression::clock::Timestamp;
use crate::progression::geo::Coordinates;

pub const QUEST_SCHEMA_VERSION: u8 = 2;
pub const PLAYER_SCHEMA_VERSION: u8 = 1;
pub const DISCOVERY_SCHEMA_VERSION: u8 = 1;

/// Reserved terminal quest step.
pub const COMPLETED_STEP: &str = "completed";

pub type QuestId = String;
pub type QuestStep = String;
pub type ItemId = String;

// ============================================================================
// Quests
// ============================================================================

/// Local lifecycle record for one quest.
///
/// `completed_at` is `Some` exactly when `step == COMPLETED_STEP`, and then equals
/// `updated_at`. `started_at <= updated_at` always holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestProgress {
    pub id: QuestId,
    pub step: QuestStep,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

impl QuestProgress {
    /// Fresh record at `step`. A `"completed"` step yields a completed record.
    pub fn at_step(id: &str, step: &str, now: Timestamp) -> Self {
        Self {
            id: id.to_string(),
            step: step.to_string(),
            started_at: now,
            updated_at: now,
            completed_at: (step == COMPLETED_STEP).then_some(now),
        }
    }

    /// Completed record with all three timestamps pinned to `at`.
    pub fn completed(id: &str, at: Timestamp) -> Self {
        Self::at_step(id, COMPLETED_STEP, at)
    }

    pub fn is_completed(&self) -> bool {
        self.step == COMPLETED_STEP
    }

    /// Next record after moving to `step` at `now`.
    pub fn moved_to(&self, step: &str, now: Timestamp) -> Self {
        let updated_at = now.max(self.started_at);
        Self {
            id: self.id.clone(),
            step: step.to_string(),
            started_at: self.started_at,
            updated_at,
            completed_at: (step == COMPLETED_STEP).then_some(updated_at),
        }
    }

    /// Next record after completing at `at`; `started_at` is pulled back if `at` precedes it.
    pub fn complete_at(&self, at: Timestamp) -> Self {
        Self {
            id: self.id.clone(),
            step: COMPLETED_STEP.to_string(),
            started_at: self.started_at.min(at),
            updated_at: at,
            completed_at: Some(at),
        }
    }
}

/// Quest entry as delivered by the backend snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerQuest {
    pub id: QuestId,
    pub current_step: QuestStep,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    /// Original start time, when the backend reports one.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
}

/// One entry of an atomic batch update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestBatchEntry {
    pub id: QuestId,
    #[serde(default)]
    pub step: Option<QuestStep>,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
}

impl QuestBatchEntry {
    pub fn step(id: &str, step: &str) -> Self {
        Self {
            id: id.to_string(),
            step: Some(step.to_string()),
            completed_at: None,
        }
    }

    pub fn completed(id: &str, at: Timestamp) -> Self {
        Self {
            id: id.to_string(),
            step: None,
            completed_at: Some(at),
        }
    }
}

/// Whole-store image used for persistence and rollback.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestSnapshot {
    pub quests: BTreeMap<QuestId, QuestProgress>,
    pub tracked_quest_id: Option<QuestId>,
}

// ============================================================================
// Player
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReputationKind {
    Combat,
    Exploration,
    Social,
    Reliability,
}

impl ReputationKind {
    pub const ALL: [ReputationKind; 4] = [
        ReputationKind::Combat,
        ReputationKind::Exploration,
        ReputationKind::Social,
        ReputationKind::Reliability,
    ];
}

/// Per-category reputation scores.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reputation {
    #[serde(default)]
    pub combat: i32,
    #[serde(default)]
    pub exploration: i32,
    #[serde(default)]
    pub social: i32,
    #[serde(default)]
    pub reliability: i32,
}

impl Reputation {
    pub fn get(&self, kind: ReputationKind) -> i32 {
        match kind {
            ReputationKind::Combat => self.combat,
            ReputationKind::Exploration => self.exploration,
            ReputationKind::Social => self.social,
            ReputationKind::Reliability => self.reliability,
        }
    }

    pub fn get_mut(&mut self, kind: ReputationKind) -> &mut i32 {
        match kind {
            ReputationKind::Combat => &mut self.combat,
            ReputationKind::Exploration => &mut self.exploration,
            ReputationKind::Social => &mut self.social,
            ReputationKind::Reliability => &mut self.reliability,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    #[default]
    Active,
    Resting,
    Incapacitated,
    Retired,
}

/// Aggregate progression state owned by the running client session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    pub phase: u32,
    #[serde(default)]
    pub reputation: Reputation,
    #[serde(default)]
    pub inventory: BTreeSet<ItemId>,
    #[serde(default)]
    pub credits: u64,
    #[serde(default)]
    pub skills: BTreeMap<String, u32>,
    #[serde(default)]
    pub attributes: BTreeMap<String, u32>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    #[serde(default)]
    pub relationships: BTreeMap<String, i32>,
    pub health: u32,
    #[serde(default)]
    pub fame: i32,
    #[serde(default)]
    pub status: PlayerStatus,
    pub updated_at: Timestamp,
}

pub const DEFAULT_HEALTH: u32 = 100;

impl PlayerState {
    pub fn new(now: Timestamp) -> Self {
        Self {
            phase: 0,
            reputation: Reputation::default(),
            inventory: BTreeSet::new(),
            credits: 0,
            skills: BTreeMap::new(),
            attributes: BTreeMap::new(),
            flags: BTreeSet::new(),
            relationships: BTreeMap::new(),
            health: DEFAULT_HEALTH,
            fame: 0,
            status: PlayerStatus::Active,
            updated_at: now,
        }
    }
}

/// Partial player state reported by the backend. Absent fields mean "no opinion".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerSnapshot {
    #[serde(default)]
    pub phase: Option<u32>,
    #[serde(default)]
    pub health: Option<u32>,
    #[serde(default)]
    pub fame: Option<i32>,
    #[serde(default)]
    pub status: Option<PlayerStatus>,
    #[serde(default)]
    pub credits: Option<u64>,
    #[serde(default)]
    pub reputation: Option<Reputation>,
    #[serde(default)]
    pub relationships: Option<BTreeMap<String, i32>>,
    #[serde(default)]
    pub flags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub inventory: Option<BTreeSet<ItemId>>,
    #[serde(default)]
    pub skills: Option<BTreeMap<String, u32>>,
    #[serde(default)]
    pub attributes: Option<BTreeMap<String, u32>>,
}

// ============================================================================
// Map points and discoveries
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    Quest,
    Npc,
    Location,
    Anomaly,
}

/// What happens to quests and the player when a bound point is discovered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BindingKind {
    /// Start the quest at `step`.
    Start { step: QuestStep },
    /// Move the quest to `step`.
    Objective { step: QuestStep },
    /// Grant credits and items; no quest change.
    Reward {
        #[serde(default)]
        credits: u64,
        #[serde(default)]
        items: Vec<ItemId>,
    },
    /// Set a player flag; no quest change.
    Unlock { flag: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestBinding {
    pub quest_id: QuestId,
    #[serde(flatten)]
    pub kind: BindingKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapPoint {
    pub key: String,
    #[serde(default)]
    pub title: String,
    pub coordinates: Coordinates,
    #[serde(rename = "type")]
    pub point_type: PointType,
    #[serde(default)]
    pub phase_requirement: Option<u32>,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    /// Discovery radius; the configured default applies when absent.
    #[serde(default)]
    pub radius_meters: Option<f64>,
    #[serde(default)]
    pub quest_binding: Option<QuestBinding>,
}

fn default_visible() -> bool {
    true
}

impl MapPoint {
    pub fn new(key: &str, coordinates: Coordinates, point_type: PointType) -> Self {
        Self {
            key: key.to_string(),
            title: String::new(),
            coordinates,
            point_type,
            phase_requirement: None,
            is_visible: true,
            radius_meters: None,
            quest_binding: None,
        }
    }

    pub fn with_phase_requirement(mut self, phase: u32) -> Self {
        self.phase_requirement = Some(phase);
        self
    }

    pub fn with_radius(mut self, radius_meters: f64) -> Self {
        self.radius_meters = Some(radius_meters);
        self
    }

    pub fn with_binding(mut self, quest_id: &str, kind: BindingKind) -> Self {
        self.quest_binding = Some(QuestBinding {
            quest_id: quest_id.to_string(),
            kind,
        });
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_visible = false;
        self
    }

    /// Whether a player at `phase` may see and discover this point.
    pub fn unlocked_for(&self, phase: u32) -> bool {
        self.phase_requirement.map_or(true, |required| required <= phase)
    }
}

/// First successful proximity or scan match of an actor on a point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointDiscovery {
    pub actor: String,
    pub point_key: String,
    pub discovered_at: Timestamp,
    #[serde(default)]
    pub researched_at: Option<Timestamp>,
}

impl PointDiscovery {
    pub fn new(actor: &str, point_key: &str, at: Timestamp) -> Self {
        Self {
            actor: actor.to_string(),
            point_key: point_key.to_string(),
            discovered_at: at,
            researched_at: None,
        }
    }
}
