//! Quest, player and discovery progression for a location-based game client.
//!
//! Stores keep local state and never talk to the network; [`ProgressionEngine`] ties
//! them to a [`ProgressionBackend`] with optimistic updates and rollback, and to
//! sled-backed [`ProgressionStorage`] through a background [`PersistenceWriter`].

pub mod backend;
pub mod clock;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod events;
pub mod geo;
pub mod merge;
pub mod migration;
pub mod player;
pub mod quest;
pub mod storage;
pub mod sync;
pub mod types;

pub use backend::{BackendError, InMemoryBackend, PointFilter, ProgressionBackend, QuestProgressRecord};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock, Timestamp};
pub use discovery::{check_phase, parse_point_seed, DiscoveryLedger, PointCatalog};
pub use engine::{EngineSettings, Identity, ProgressionEngine};
pub use errors::ProgressionError;
pub use events::{BindingEffect, EventOutcome, ProgressionEvent, SyncStatus};
pub use geo::{distance_meters, is_within_radius, position_or_fallback, BoundingBox, Coordinates};
pub use merge::{MergePolicy, MergeTable, PlayerField, DEFAULT_PLAYER_MERGE_POLICY};
pub use migration::{migrate_quests, PersistedPlayer, PersistedQuests};
pub use player::{clamp_level, PlayerStore};
pub use quest::QuestStore;
pub use storage::{LoadedState, PersistenceWriter, ProgressionStorage};
pub use sync::{CommitOutcome, OptimisticTransaction, Reconcilable, RollbackOutcome};
pub use types::*;
