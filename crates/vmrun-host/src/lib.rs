//! vmrun-host: host-side preparation for a vmrun action
//!
//! Everything that happens on the CI runner itself before and around the
//! guest: installing hypervisor packages, fetching the pinned launcher
//! script, writing SSH client config, and exporting the workspace over NFS.

pub mod download;
pub mod error;
pub mod nfs;
pub mod platform;
pub mod ssh_config;

pub use download::{anyvm_url, download_file, fetch_launcher, http_client};
pub use error::HostError;
pub use nfs::{export_line, export_workspace};
pub use platform::{install_dependencies, install_plan, HostPlatform, InstallStep};
pub use ssh_config::{append_ssh_config, ssh_config_path, SshHostEntry};

/// Result type for host operations
pub type Result<T> = std::result::Result<T, HostError>;
