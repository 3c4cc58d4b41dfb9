//! Versioned on-disk layouts and upgrades between them.
//!
//! Every persisted blob starts with its schema version. Bincode writes a `u8` field as
//! a single leading byte, so the version can be read before choosing a layout to
//! decode with.
//!
//! # Adding a migration
//!
//! 1. Bump the `*_SCHEMA_VERSION` constant in `types`
//! 2. Keep the old layout here as a `*V{n}` struct
//! 3. Add a `migrate_*_from_v{n}` step and call it from the entry point
//! 4. Test it

use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::progression::clock::Timestamp;
use crate::progression::errors::ProgressionError;
use crate::progression::types::{
    PlayerState, PointDiscovery, QuestId, QuestProgress, QuestSnapshot, QuestStep,
    COMPLETED_STEP, DISCOVERY_SCHEMA_VERSION, PLAYER_SCHEMA_VERSION, QUEST_SCHEMA_VERSION,
};

/// Current quest layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedQuests {
    pub version: u8,
    pub quests: BTreeMap<QuestId, QuestProgress>,
    pub tracked_quest_id: Option<QuestId>,
}

impl PersistedQuests {
    pub fn from_snapshot(snapshot: QuestSnapshot) -> Self {
        Self {
            version: QUEST_SCHEMA_VERSION,
            quests: snapshot.quests,
            tracked_quest_id: snapshot.tracked_quest_id,
        }
    }

    pub fn into_snapshot(self) -> QuestSnapshot {
        QuestSnapshot {
            quests: self.quests,
            tracked_quest_id: self.tracked_quest_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedPlayer {
    pub version: u8,
    pub state: PlayerState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedDiscovery {
    pub version: u8,
    pub discovery: PointDiscovery,
}

/// v1 quest record: no `completed_at`, completion only visible through the step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestRecordV1 {
    pub id: QuestId,
    pub step: QuestStep,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedQuestsV1 {
    pub version: u8,
    pub quests: BTreeMap<QuestId, QuestRecordV1>,
    pub tracked_quest_id: Option<QuestId>,
}

/// Leading schema version byte of a persisted blob.
pub fn peek_version(entity: &'static str, bytes: &[u8]) -> Result<u8, ProgressionError> {
    bytes.first().copied().ok_or_else(|| {
        ProgressionError::Internal(format!("empty {} record", entity))
    })
}

fn ensure_known(entity: &'static str, found: u8, current: u8) -> Result<(), ProgressionError> {
    if found == 0 || found > current {
        warn!(
            "Unknown {} schema v{} (this build understands up to v{})",
            entity, found, current
        );
        return Err(ProgressionError::SchemaMismatch {
            entity,
            expected: current,
            found,
        });
    }
    Ok(())
}

/// Decode the quest blob, upgrading older layouts. The flag is true when an upgrade
/// happened and the caller should write the result back.
pub fn migrate_quests(bytes: &[u8]) -> Result<(PersistedQuests, bool), ProgressionError> {
    let version = peek_version("quests", bytes)?;
    ensure_known("quests", version, QUEST_SCHEMA_VERSION)?;

    if version == QUEST_SCHEMA_VERSION {
        return Ok((bincode::deserialize(bytes)?, false));
    }

    let legacy: PersistedQuestsV1 = bincode::deserialize(bytes)?;
    let migrated = migrate_quests_from_v1(legacy);
    info!(
        "Migrated quest store from schema v{} to v{} ({} quests)",
        version,
        migrated.version,
        migrated.quests.len()
    );
    Ok((migrated, true))
}

/// v2 added `completed_at`; v1 completion is inferred from the reserved step and
/// pinned to the last update.
fn migrate_quests_from_v1(legacy: PersistedQuestsV1) -> PersistedQuests {
    let quests = legacy
        .quests
        .into_iter()
        .map(|(id, record)| {
            let completed = record.step == COMPLETED_STEP;
            let updated_at = record.updated_at.max(record.started_at);
            let progress = QuestProgress {
                id: record.id,
                step: record.step,
                started_at: record.started_at,
                updated_at,
                completed_at: completed.then_some(updated_at),
            };
            (id, progress)
        })
        .collect::<BTreeMap<_, _>>();

    let tracked_quest_id = legacy
        .tracked_quest_id
        .filter(|id| quests.get(id).map_or(false, |q| !q.is_completed()));

    PersistedQuests {
        version: QUEST_SCHEMA_VERSION,
        quests,
        tracked_quest_id,
    }
}

pub fn decode_player(bytes: &[u8]) -> Result<PersistedPlayer, ProgressionError> {
    let version = peek_version("player", bytes)?;
    ensure_known("player", version, PLAYER_SCHEMA_VERSION)?;
    Ok(bincode::deserialize(bytes)?)
}

pub fn decode_discovery(bytes: &[u8]) -> Result<PersistedDiscovery, ProgressionError> {
    let version = peek_version("discovery", bytes)?;
    ensure_known("discovery", version, DISCOVERY_SCHEMA_VERSION)?;
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2023, 11, 5, 16, 0, 0).unwrap()
    }

    fn legacy_blob() -> Vec<u8> {
        let mut quests = BTreeMap::new();
        quests.insert(
            "intro".to_string(),
            QuestRecordV1 {
                id: "intro".to_string(),
                step: COMPLETED_STEP.to_string(),
                started_at: t0(),
                updated_at: t0() + Duration::hours(2),
            },
        );
        quests.insert(
            "mill".to_string(),
            QuestRecordV1 {
                id: "mill".to_string(),
                step: "find_wheel".to_string(),
                started_at: t0(),
                updated_at: t0() + Duration::minutes(10),
            },
        );
        bincode::serialize(&PersistedQuestsV1 {
            version: 1,
            quests,
            tracked_quest_id: Some("intro".to_string()),
        })
        .unwrap()
    }

    #[test]
    fn v1_quests_gain_completed_at() {
        let (migrated, changed) = migrate_quests(&legacy_blob()).unwrap();
        assert!(changed);
        assert_eq!(migrated.version, QUEST_SCHEMA_VERSION);

        let intro = &migrated.quests["intro"];
        assert_eq!(intro.completed_at, Some(t0() + Duration::hours(2)));
        assert_eq!(migrated.quests["mill"].completed_at, None);
        // A completed quest cannot stay tracked.
        assert_eq!(migrated.tracked_quest_id, None);
    }

    #[test]
    fn current_version_is_decoded_as_is() {
        let mut snapshot = QuestSnapshot::default();
        snapshot
            .quests
            .insert("mill".into(), QuestProgress::at_step("mill", "a", t0()));
        snapshot.tracked_quest_id = Some("mill".into());
        let bytes = bincode::serialize(&PersistedQuests::from_snapshot(snapshot.clone())).unwrap();

        let (decoded, changed) = migrate_quests(&bytes).unwrap();
        assert!(!changed);
        assert_eq!(decoded.into_snapshot(), snapshot);
    }

    #[test]
    fn future_version_is_a_schema_mismatch() {
        let mut bytes = bincode::serialize(&PersistedQuests::from_snapshot(QuestSnapshot::default())).unwrap();
        bytes[0] = QUEST_SCHEMA_VERSION + 1;
        match migrate_quests(&bytes) {
            Err(ProgressionError::SchemaMismatch { entity, expected, found }) => {
                assert_eq!(entity, "quests");
                assert_eq!(expected, QUEST_SCHEMA_VERSION);
                assert_eq!(found, QUEST_SCHEMA_VERSION + 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_blob_is_rejected() {
        assert!(migrate_quests(&[]).is_err());
        assert!(decode_player(&[]).is_err());
    }

    #[test]
    fn player_blob_round_trips() {
        let persisted = PersistedPlayer {
            version: PLAYER_SCHEMA_VERSION,
            state: PlayerState::new(t0()),
        };
        let bytes = bincode::serialize(&persisted).unwrap();
        assert_eq!(decode_player(&bytes).unwrap(), persisted);
    }
}
