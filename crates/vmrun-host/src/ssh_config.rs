//! SSH client config stanzas.
//!
//! The guest is addressed through a host alias in `~/.ssh/config`, so
//! `ssh`, `rsync -e ssh` and `scp` all pick up the same user, port and
//! forwarded environment.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::Result;

/// A `Host <alias>` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshHostEntry {
    pub alias: String,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    /// Space-separated variable names forwarded with `SendEnv`.
    pub send_env: Option<String>,
}

impl SshHostEntry {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn send_env(mut self, vars: impl Into<String>) -> Self {
        self.send_env = Some(vars.into());
        self
    }

    /// A stanza without settings is not worth writing.
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.hostname.is_none() && self.port.is_none() && self.send_env.is_none()
    }

    pub fn render(&self) -> String {
        let mut out = format!("Host {}\n", self.alias);
        if let Some(user) = &self.user {
            let _ = writeln!(out, "  User {user}");
        }
        if let Some(hostname) = &self.hostname {
            let _ = writeln!(out, "  HostName {hostname}");
        }
        if let Some(port) = self.port {
            let _ = writeln!(out, "  Port {port}");
        }
        if let Some(vars) = &self.send_env {
            let _ = writeln!(out, "  SendEnv {vars}");
        }
        out
    }
}

/// `~/.ssh/config` under `home`.
pub fn ssh_config_path(home: &Path) -> PathBuf {
    home.join(".ssh").join("config")
}

/// Append `entry` to the SSH config under `home`, creating `~/.ssh` if
/// needed. Returns the config path.
pub fn append_ssh_config(home: &Path, entry: &SshHostEntry) -> Result<PathBuf> {
    let path = ssh_config_path(home);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let needs_newline = std::fs::read(&path)
        .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
        .unwrap_or(false);

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    if needs_newline {
        file.write_all(b"\n")?;
    }
    file.write_all(entry.render().as_bytes())?;

    info!(alias = %entry.alias, path = %path.display(), "appended ssh host entry");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_render_send_env_only() {
        let entry = SshHostEntry::new("openbsd").send_env("MYTOKEN MYTOKEN2");
        assert_eq!(entry.render(), "Host openbsd\n  SendEnv MYTOKEN MYTOKEN2\n");
    }

    #[test]
    fn test_render_full_stanza() {
        let entry = SshHostEntry::new("solaris")
            .user("root")
            .hostname("127.0.0.1")
            .port(2222);
        assert_eq!(
            entry.render(),
            "Host solaris\n  User root\n  HostName 127.0.0.1\n  Port 2222\n"
        );
        assert!(SshHostEntry::new("x").is_empty());
        assert!(!entry.is_empty());
    }

    #[test]
    fn test_append_keeps_existing_content() {
        let home = tempdir().unwrap();
        let path = ssh_config_path(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "Host github.com\n  User git").unwrap();

        append_ssh_config(home.path(), &SshHostEntry::new("netbsd").send_env("CI")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "Host github.com\n  User git\nHost netbsd\n  SendEnv CI\n"
        );
    }

    #[test]
    fn test_append_creates_ssh_dir() {
        let home = tempdir().unwrap();
        let path = append_ssh_config(home.path(), &SshHostEntry::new("dragonfly").port(2200)).unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "Host dragonfly\n  Port 2200\n"
        );
    }
}
