//! Error types

use thiserror::Error;

/// Problems with the configuration file. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-process read failures. The sampler recovers from all of these by
/// omitting the process for the current tick.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("failed to read /proc/{pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed /proc/{pid}/stat")]
    Parse { pid: u32 },

    #[error("pid {pid} now belongs to a different process")]
    IdentityMismatch { pid: u32 },

    #[error("process discovery did not finish before the deadline")]
    DeadlineExceeded,
}

impl SampleError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SampleError::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied)
    }
}

/// Reasons a tick was skipped. Logged, never fatal to the loop.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("sampling exceeded {0:?}")]
    Timeout(std::time::Duration),

    #[error("previous sampling pass is still running")]
    Busy,

    #[error("incomplete observation: {0}")]
    Incomplete(#[from] SampleError),

    #[error("sampling task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
