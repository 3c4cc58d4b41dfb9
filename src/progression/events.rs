//! Progression events (what the UI asks for) and their outcomes.

use serde::{Deserialize, Serialize};

use crate::progression::geo::Coordinates;
use crate::progression::sync::CommitOutcome;
use crate::progression::types::{ItemId, QuestId, QuestStep};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressionEvent {
    StartQuest { quest_id: QuestId, step: QuestStep },
    AdvanceQuest { quest_id: QuestId, step: QuestStep },
    CompleteQuest { quest_id: QuestId },
    /// A decoded QR payload.
    Scan { code: String },
    /// A geolocation update; `None` when the device could not produce a fix.
    LocationFix { coordinates: Option<Coordinates> },
    /// Local-only grant of credits and items.
    Grant {
        #[serde(default)]
        credits: u64,
        #[serde(default)]
        items: Vec<ItemId>,
    },
}

impl ProgressionEvent {
    pub fn start(quest_id: &str, step: &str) -> Self {
        Self::StartQuest {
            quest_id: quest_id.to_string(),
            step: step.to_string(),
        }
    }

    pub fn advance(quest_id: &str, step: &str) -> Self {
        Self::AdvanceQuest {
            quest_id: quest_id.to_string(),
            step: step.to_string(),
        }
    }

    pub fn complete(quest_id: &str) -> Self {
        Self::CompleteQuest {
            quest_id: quest_id.to_string(),
        }
    }

    pub fn scan(code: &str) -> Self {
        Self::Scan {
            code: code.to_string(),
        }
    }

    pub fn location(coordinates: Option<Coordinates>) -> Self {
        Self::LocationFix { coordinates }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProgressionEvent::StartQuest { .. } => "start_quest",
            ProgressionEvent::AdvanceQuest { .. } => "advance_quest",
            ProgressionEvent::CompleteQuest { .. } => "complete_quest",
            ProgressionEvent::Scan { .. } => "scan",
            ProgressionEvent::LocationFix { .. } => "location_fix",
            ProgressionEvent::Grant { .. } => "grant",
        }
    }
}

/// How the remote side took a quest mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The backend answered and the result was reconciled (or found stale).
    Confirmed(CommitOutcome),
    /// Nothing changed locally, so nothing was sent.
    Skipped,
}

/// Side effect of a point's quest binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingEffect {
    QuestStarted { quest_id: QuestId },
    AlreadyStarted { quest_id: QuestId },
    QuestAdvanced { quest_id: QuestId, step: QuestStep, changed: bool },
    Rewarded { credits: u64, new_items: Vec<ItemId> },
    Unlocked { flag: String, newly_set: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Quest {
        quest_id: QuestId,
        changed: bool,
        sync: SyncStatus,
    },
    Discovered {
        point_key: String,
        first_time: bool,
        effect: Option<BindingEffect>,
        used_fallback_position: bool,
    },
    Granted {
        credits: u64,
        new_items: Vec<ItemId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_through_json_tags() {
        let json = r#"{"event":"location_fix","coordinates":null}"#;
        let event: ProgressionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, ProgressionEvent::location(None));
        assert_eq!(event.name(), "location_fix");

        let grant: ProgressionEvent =
            serde_json::from_str(r#"{"event":"grant","items":["map"]}"#).unwrap();
        assert_eq!(
            grant,
            ProgressionEvent::Grant {
                credits: 0,
                items: vec!["map".to_string()]
            }
        );
    }
}
