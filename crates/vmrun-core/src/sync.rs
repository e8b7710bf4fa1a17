//! Workspace sync strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};

/// How the host workspace is mirrored into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// `rsync -avz` in both directions.
    #[default]
    Rsync,
    /// `scp -r`, for guests without rsync.
    Scp,
    /// Host workspace mounted into the guest over SSH.
    Sshfs,
    /// Host workspace exported over NFS and mounted in the guest.
    Nfs,
    /// No transfer at all.
    None,
}

impl SyncStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SyncStrategy::Rsync => "rsync",
            SyncStrategy::Scp => "scp",
            SyncStrategy::Sshfs => "sshfs",
            SyncStrategy::Nfs => "nfs",
            SyncStrategy::None => "none",
        }
    }

    /// Live mounts make guest writes visible on the host immediately.
    pub fn is_live_mount(&self) -> bool {
        matches!(self, SyncStrategy::Sshfs | SyncStrategy::Nfs)
    }

    pub fn transfers(&self) -> bool {
        !matches!(self, SyncStrategy::None)
    }

    /// Whether the copy-back step runs. Live mounts and `none` never copy
    /// back, whatever the `copyback` input says.
    pub fn copies_back(&self, copyback: bool) -> bool {
        copyback && self.transfers() && !self.is_live_mount()
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SyncStrategy {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "rsync" => Ok(SyncStrategy::Rsync),
            "scp" => Ok(SyncStrategy::Scp),
            "sshfs" => Ok(SyncStrategy::Sshfs),
            "nfs" => Ok(SyncStrategy::Nfs),
            "no" | "none" => Ok(SyncStrategy::None),
            other => Err(VmError::InvalidInput {
                name: "sync".to_string(),
                reason: format!("unknown strategy {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("".parse::<SyncStrategy>().unwrap(), SyncStrategy::Rsync);
        assert_eq!("rsync".parse::<SyncStrategy>().unwrap(), SyncStrategy::Rsync);
        assert_eq!("scp".parse::<SyncStrategy>().unwrap(), SyncStrategy::Scp);
        assert_eq!("sshfs".parse::<SyncStrategy>().unwrap(), SyncStrategy::Sshfs);
        assert_eq!("nfs".parse::<SyncStrategy>().unwrap(), SyncStrategy::Nfs);
        assert_eq!("no".parse::<SyncStrategy>().unwrap(), SyncStrategy::None);
        assert_eq!("none".parse::<SyncStrategy>().unwrap(), SyncStrategy::None);
        assert!("ftp".parse::<SyncStrategy>().is_err());
    }

    #[test]
    fn test_live_mounts_never_copy_back() {
        for strategy in [SyncStrategy::Sshfs, SyncStrategy::Nfs] {
            assert!(strategy.is_live_mount());
            assert!(!strategy.copies_back(true));
            assert!(!strategy.copies_back(false));
        }
    }

    #[test]
    fn test_copy_back_follows_input_for_transfers() {
        assert!(SyncStrategy::Rsync.copies_back(true));
        assert!(!SyncStrategy::Rsync.copies_back(false));
        assert!(SyncStrategy::Scp.copies_back(true));
        assert!(!SyncStrategy::None.copies_back(true));
    }
}
