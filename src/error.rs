use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Shard builder failed: {0}")]
    Launch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems detected before any remote action is taken.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Local root folder '{0}' is not an absolute path")]
    RelativeLocalRoot(PathBuf),

    #[error("Loader executable '{0}' cannot be found in the current working directory")]
    LoaderNotFound(PathBuf),

    #[error("Group size must be at least 1")]
    ZeroGroupSize,

    #[error("Group size {group_size} exceeds the number of workers ({workers})")]
    NotEnoughWorkers { group_size: usize, workers: usize },

    #[error("Host list is empty")]
    EmptyHostList,

    #[error("Host '{0}' appears more than once in the host list")]
    DuplicateHost(String),

    #[error("Failed to read '{path}': {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure of a single remote step on one host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Host '{host}' is unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Permission denied on '{host}': {reason}")]
    PermissionDenied { host: String, reason: String },

    #[error("No space left on '{host}': {reason}")]
    DiskFull { host: String, reason: String },

    #[error("Command on '{host}' timed out after {secs}s")]
    Timeout { host: String, secs: u64 },

    #[error("Command on '{host}' exited with {code:?}: {stderr}")]
    CommandFailed {
        host: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },
}

impl RemoteError {
    /// Host the failure belongs to, if any.
    pub fn host(&self) -> Option<&str> {
        match self {
            RemoteError::Unreachable { host, .. }
            | RemoteError::PermissionDenied { host, .. }
            | RemoteError::DiskFull { host, .. }
            | RemoteError::Timeout { host, .. }
            | RemoteError::CommandFailed { host, .. } => Some(host),
            RemoteError::Spawn { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteError::Timeout { .. })
    }
}

/// Counts reported by a worker that contradict what the coordinator wrote.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Worker '{host}' reports {actual} assigned records, expected {expected}")]
    TotalMismatch {
        host: String,
        expected: u64,
        actual: u64,
    },

    #[error("Worker '{host}' holds {fetched} fetched items but only {total} were assigned")]
    FetchedExceedsTotal { host: String, fetched: u64, total: u64 },

    #[error("Unparseable output from '{host}' for {query}: {output:?}")]
    Unparseable {
        host: String,
        query: &'static str,
        output: String,
    },
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_exposes_host() {
        let err = RemoteError::DiskFull {
            host: "w1".to_string(),
            reason: "No space left on device".to_string(),
        };
        assert_eq!(err.host(), Some("w1"));

        let err = RemoteError::Spawn {
            program: "ssh".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(err.host(), None);
    }

    #[test]
    fn config_error_converts_into_ingest_error() {
        let err: IngestError = ConfigError::ZeroGroupSize.into();
        assert!(matches!(err, IngestError::Config(ConfigError::ZeroGroupSize)));
        assert!(err.to_string().contains("Group size"));
    }
}
