use thiserror::Error;

use crate::progression::backend::BackendError;
use crate::validation::ValidationError;

/// Errors that can arise while applying progression events or persisting their results.
#[derive(Debug, Error)]
pub enum ProgressionError {
    /// Returned when a quest, player, point or discovery record is not present.
    #[error("record not found: {0}")]
    NotFound(String),

    /// An action that needs an authenticated identity was attempted without one.
    #[error("authentication required")]
    Unauthenticated,

    /// Malformed input, rejected before any state was touched.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Transient remote failure. Local state has already been rolled back.
    #[error("network failure: {0}")]
    Network(String),

    /// The backend refused the mutation for a reason other than a missing record.
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// Device position could not be obtained.
    #[error("geolocation unavailable: {0}")]
    GeolocationUnavailable(String),

    /// A location fix did not land inside any point's radius.
    #[error("too far from {point_key}: {distance_m:.0}m (radius {radius_m:.0}m)")]
    OutOfRange {
        point_key: String,
        distance_m: f64,
        radius_m: f64,
    },

    /// The point exists but the player's phase is below its requirement.
    #[error("{point_key} requires phase {required} (player is at {current})")]
    PhaseLocked {
        point_key: String,
        required: u32,
        current: u32,
    },

    /// Returned when decoding a persisted blob with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },

    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around JSON seed parsing errors.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wrapper around IO errors (directory creation, seed files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (task join errors, closed channels)
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProgressionError {
    /// True for failures the player may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProgressionError::Network(_))
    }
}

impl From<BackendError> for ProgressionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(what) => ProgressionError::NotFound(what),
            BackendError::Unauthenticated => ProgressionError::Unauthenticated,
            BackendError::Network(reason) => ProgressionError::Network(reason),
            BackendError::Rejected(reason) => ProgressionError::Rejected(reason),
        }
    }
}
