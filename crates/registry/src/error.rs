use std::io;
use std::path::PathBuf;
use std::time::Duration;

use api_types::Eid;
use thiserror::Error;
use utils::flock::LockError;

/// Errors returned by registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown environment {eid}")]
    UnknownEnvironment { eid: Eid },

    #[error("process {pid} is already bound to environment {eid}")]
    DuplicateBinding { pid: u32, eid: Eid },

    #[error("environment {eid} would hold {requested} devices but its capacity is {max_devices}")]
    CapacityExceeded {
        eid: Eid,
        requested: usize,
        max_devices: u32,
    },

    #[error("not enough available devices: requested {requested}, available {available}")]
    InsufficientCapacity { requested: usize, available: usize },

    #[error("unknown device {index}")]
    UnknownDevice { index: u32 },

    #[error("registry lock not acquired within {waited:?}")]
    LockTimeout { waited: Duration },

    #[error("corrupt registry record{}: {reason}", eid.as_ref().map(|e| format!(" {e}")).unwrap_or_default())]
    CorruptRecord { eid: Option<Eid>, reason: String },

    #[error("registry record cannot be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("registry i/o failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Validation failures are never transient; the caller has to change the
    /// request instead.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<LockError> for RegistryError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { waited, .. } => Self::LockTimeout { waited },
            LockError::Io { path, source } => Self::Io { path, source },
        }
    }
}
