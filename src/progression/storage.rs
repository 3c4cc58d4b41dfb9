//! Sled-backed local persistence and the background writer that feeds it.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use sled::IVec;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::progression::errors::ProgressionError;
use crate::progression::migration::{
    decode_discovery, decode_player, migrate_quests, PersistedDiscovery, PersistedPlayer,
    PersistedQuests,
};
use crate::progression::types::{
    PlayerState, PointDiscovery, QuestSnapshot, DISCOVERY_SCHEMA_VERSION, PLAYER_SCHEMA_VERSION,
};

const TREE_QUESTS: &str = "progression_quests";
const TREE_PLAYER: &str = "progression_player";
const TREE_DISCOVERIES: &str = "progression_discoveries";
const TREE_META: &str = "progression_meta";

const KEY_QUESTS: &[u8] = b"quests";
const KEY_PLAYER: &[u8] = b"player";
const KEY_DEVICE_ID: &[u8] = b"device_id";

/// Everything found on disk at startup.
#[derive(Debug, Clone, Default)]
pub struct LoadedState {
    pub quests: Option<QuestSnapshot>,
    pub player: Option<PlayerState>,
    pub discoveries: Vec<PointDiscovery>,
}

/// Local progression store.
pub struct ProgressionStorage {
    db: sled::Db,
    quests: sled::Tree,
    player: sled::Tree,
    discoveries: sled::Tree,
    meta: sled::Tree,
}

impl ProgressionStorage {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ProgressionError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let quests = db.open_tree(TREE_QUESTS)?;
        let player = db.open_tree(TREE_PLAYER)?;
        let discoveries = db.open_tree(TREE_DISCOVERIES)?;
        let meta = db.open_tree(TREE_META)?;
        Ok(Self {
            db,
            quests,
            player,
            discoveries,
            meta,
        })
    }

    fn discovery_key(actor: &str, point_key: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(actor.len() + point_key.len() + 1);
        key.extend_from_slice(actor.as_bytes());
        key.push(0);
        key.extend_from_slice(point_key.as_bytes());
        key
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProgressionError> {
        Ok(bincode::serialize(value)?)
    }

    /// Stable device token, generated on first use.
    pub fn device_id(&self) -> Result<String, ProgressionError> {
        if let Some(bytes) = self.meta.get(KEY_DEVICE_ID)? {
            if let Ok(id) = Uuid::from_slice(&bytes) {
                return Ok(id.to_string());
            }
            warn!("Stored device id is malformed; generating a new one");
        }
        let id = Uuid::new_v4();
        self.meta.insert(KEY_DEVICE_ID, id.as_bytes().as_slice())?;
        self.meta.flush()?;
        info!("Generated device id {}", id);
        Ok(id.to_string())
    }

    pub fn save_quests(&self, snapshot: &QuestSnapshot) -> Result<(), ProgressionError> {
        let bytes = Self::serialize(&PersistedQuests::from_snapshot(snapshot.clone()))?;
        self.quests.insert(KEY_QUESTS, bytes)?;
        Ok(())
    }

    /// Load quests, upgrading and rewriting older layouts.
    pub fn load_quests(&self) -> Result<Option<QuestSnapshot>, ProgressionError> {
        let Some(bytes) = self.quests.get(KEY_QUESTS)? else {
            return Ok(None);
        };
        let (persisted, migrated) = migrate_quests(&bytes)?;
        if migrated {
            self.quests.insert(KEY_QUESTS, Self::serialize(&persisted)?)?;
        }
        Ok(Some(persisted.into_snapshot()))
    }

    pub fn save_player(&self, state: &PlayerState) -> Result<(), ProgressionError> {
        let bytes = Self::serialize(&PersistedPlayer {
            version: PLAYER_SCHEMA_VERSION,
            state: state.clone(),
        })?;
        self.player.insert(KEY_PLAYER, bytes)?;
        Ok(())
    }

    pub fn load_player(&self) -> Result<Option<PlayerState>, ProgressionError> {
        match self.player.get(KEY_PLAYER)? {
            Some(bytes) => Ok(Some(decode_player(&bytes)?.state)),
            None => Ok(None),
        }
    }

    pub fn put_discovery(&self, discovery: &PointDiscovery) -> Result<(), ProgressionError> {
        let bytes = Self::serialize(&PersistedDiscovery {
            version: DISCOVERY_SCHEMA_VERSION,
            discovery: discovery.clone(),
        })?;
        self.discoveries
            .insert(Self::discovery_key(&discovery.actor, &discovery.point_key), bytes)?;
        Ok(())
    }

    pub fn remove_discovery(&self, actor: &str, point_key: &str) -> Result<(), ProgressionError> {
        self.discoveries
            .remove(Self::discovery_key(actor, point_key))?;
        Ok(())
    }

    pub fn load_discoveries(&self) -> Result<Vec<PointDiscovery>, ProgressionError> {
        let mut out = Vec::new();
        for entry in self.discoveries.iter() {
            let (_, bytes): (IVec, IVec) = entry?;
            out.push(decode_discovery(&bytes)?.discovery);
        }
        Ok(out)
    }

    /// Load everything. A blob with an unknown schema version is discarded and its
    /// entity starts fresh.
    pub fn load_state(&self) -> Result<LoadedState, ProgressionError> {
        let quests = match self.load_quests() {
            Err(ProgressionError::SchemaMismatch { .. }) => {
                warn!("Resetting local quest progress after schema mismatch");
                self.quests.clear()?;
                None
            }
            other => other?,
        };
        let player = match self.load_player() {
            Err(ProgressionError::SchemaMismatch { .. }) => {
                warn!("Resetting local player state after schema mismatch");
                self.player.clear()?;
                None
            }
            other => other?,
        };
        let discoveries = match self.load_discoveries() {
            Err(ProgressionError::SchemaMismatch { .. }) => {
                warn!("Resetting local discoveries after schema mismatch");
                self.discoveries.clear()?;
                Vec::new()
            }
            other => other?,
        };
        Ok(LoadedState {
            quests,
            player,
            discoveries,
        })
    }

    /// Drop all progression data. The device id survives.
    pub fn reset(&self) -> Result<(), ProgressionError> {
        self.quests.clear()?;
        self.player.clear()?;
        self.discoveries.clear()?;
        self.db.flush()?;
        info!("Local progression data cleared");
        Ok(())
    }

    pub fn flush(&self) -> Result<(), ProgressionError> {
        self.db.flush()?;
        Ok(())
    }
}

// ============================================================================
// Background writer
// ============================================================================

#[derive(Debug)]
enum WriteCommand {
    Quests(QuestSnapshot),
    Player(PlayerState),
    Discovery {
        actor: String,
        point_key: String,
        entry: Option<PointDiscovery>,
    },
    Reset,
    Flush(oneshot::Sender<Result<(), String>>),
}

impl WriteCommand {
    fn apply(self, storage: &ProgressionStorage) -> Result<(), ProgressionError> {
        match self {
            WriteCommand::Quests(snapshot) => storage.save_quests(&snapshot),
            WriteCommand::Player(state) => storage.save_player(&state),
            WriteCommand::Discovery {
                entry: Some(discovery),
                ..
            } => storage.put_discovery(&discovery),
            WriteCommand::Discovery {
                actor,
                point_key,
                entry: None,
            } => storage.remove_discovery(&actor, &point_key),
            WriteCommand::Reset => storage.reset(),
            WriteCommand::Flush(_) => storage.flush(),
        }
    }
}

/// Queues writes for a background task so callers never wait on disk.
///
/// Writes are applied in submission order. At most `max_pending` writes may be queued;
/// beyond that, submitting waits for the writer to catch up.
pub struct PersistenceWriter {
    tx: mpsc::Sender<WriteCommand>,
    task: JoinHandle<()>,
}

impl PersistenceWriter {
    /// Start the writer task. Must be called from within a tokio runtime.
    pub fn spawn(storage: Arc<ProgressionStorage>, max_pending: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteCommand>(max_pending.max(1));
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let storage = storage.clone();
                match command {
                    WriteCommand::Flush(reply) => {
                        let result = tokio::task::spawn_blocking(move || storage.flush())
                            .await
                            .map_err(|e| e.to_string())
                            .and_then(|r| r.map_err(|e| e.to_string()));
                        let _ = reply.send(result);
                    }
                    other => {
                        match tokio::task::spawn_blocking(move || other.apply(&storage)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!("Persistence write failed: {}", e),
                            Err(e) => warn!("Persistence task failed: {}", e),
                        }
                    }
                }
            }
            debug!("Persistence writer stopped");
        });
        Self { tx, task }
    }

    async fn submit(&self, command: WriteCommand) {
        if self.tx.send(command).await.is_err() {
            warn!("Persistence writer is gone; dropping write");
        }
    }

    pub async fn save_quests(&self, snapshot: QuestSnapshot) {
        self.submit(WriteCommand::Quests(snapshot)).await;
    }

    pub async fn save_player(&self, state: PlayerState) {
        self.submit(WriteCommand::Player(state)).await;
    }

    /// Write (`Some`) or remove (`None`) one discovery.
    pub async fn save_discovery(&self, actor: &str, point_key: &str, entry: Option<PointDiscovery>) {
        self.submit(WriteCommand::Discovery {
            actor: actor.to_string(),
            point_key: point_key.to_string(),
            entry,
        })
        .await;
    }

    pub async fn reset(&self) {
        self.submit(WriteCommand::Reset).await;
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) -> Result<(), ProgressionError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(WriteCommand::Flush(reply))
            .await
            .map_err(|_| ProgressionError::Internal("persistence writer closed".to_string()))?;
        done.await
            .map_err(|_| ProgressionError::Internal("persistence writer dropped flush".to_string()))?
            .map_err(ProgressionError::Internal)
    }

    /// Drain the queue, stop the task and release the store.
    pub async fn shutdown(self) -> Result<(), ProgressionError> {
        self.flush().await?;
        let Self { tx, task } = self;
        drop(tx);
        task.await
            .map_err(|e| ProgressionError::Internal(format!("persistence task failed: {}", e)))
    }
}
