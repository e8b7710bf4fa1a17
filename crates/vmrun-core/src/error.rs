//! Error taxonomy shared by every vmrun crate.

use std::path::PathBuf;

/// vmrun domain errors.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("config not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("{0} not defined in config")]
    MissingConfigKey(String),

    #[error("invalid nat entry {entry:?}: {reason}")]
    InvalidNat { entry: String, reason: String },

    #[error("invalid input {name}: {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("{program} exited with code {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },

    #[error("timed out waiting for the guest to boot after {attempts} attempts")]
    BootTimeout { attempts: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for vmrun domain operations.
pub type Result<T> = std::result::Result<T, VmError>;
