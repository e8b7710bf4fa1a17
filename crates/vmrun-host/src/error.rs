//! Error types for vmrun-host

use thiserror::Error;
use vmrun_core::VmError;

/// Errors that can occur while preparing the host
#[derive(Error, Debug)]
pub enum HostError {
    /// Download answered with a non-success status
    #[error("failed to download {url}: status code {status}")]
    Download { url: String, status: u16 },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// HOME is not set, so the SSH config cannot be located
    #[error("HOME is not set")]
    NoHome,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// External command or config error
    #[error(transparent)]
    Core(#[from] VmError),
}

impl From<reqwest::Error> for HostError {
    fn from(err: reqwest::Error) -> Self {
        HostError::Http(err.to_string())
    }
}
