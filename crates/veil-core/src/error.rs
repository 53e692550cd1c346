//! Error types for the orchestration layer.

use veil_engine::SnapshotError;

use crate::dnr::host::HostError;
use crate::dnr::ranges::RuleFamily;

/// Error type for veil-core operations.
///
/// User-input problems (bad filter lines, disallowed scriptlets, rules the
/// host rejects one by one) are reported as data and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("engine '{0}' is not available from any source")]
    EngineUnavailable(String),

    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch '{resource}' failed: {reason}")]
    Fetch { resource: String, reason: String },

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("declarative host: {0}")]
    Host(#[from] HostError),

    #[error("rule family {family:?} needs {count} ids but owns {capacity}")]
    RangeOverflow {
        family: RuleFamily,
        count: usize,
        capacity: usize,
    },

    #[error("alarms: {0}")]
    Alarms(String),

    #[error("invalid settings: {0}")]
    Settings(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
