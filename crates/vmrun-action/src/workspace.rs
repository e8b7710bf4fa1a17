//! Mirroring the host workspace into the guest and back.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use vmrun_core::{Backend, CommandRunner, CommandSpec, FailurePolicy, SyncStrategy};

use crate::remote::RemoteExecutor;

/// Guest directory the workspace lands in, relative to the login home.
pub const REMOTE_DIR: &str = "work";

const RSYNC_SHELL: &str = "ssh -o StrictHostKeyChecking=no";

const SSHFS_INSTALL: &str =
    "if ! command -v sshfs; then pkg_add sshfs || apt-get install -y sshfs || true; fi";

/// rsync `--exclude` pattern for the action's own checkout, when it sits
/// strictly inside the workspace. Anchored at the transfer root.
pub fn exclude_pattern(workspace: &Path, action_dir: &Path) -> Option<String> {
    let rel = action_dir.strip_prefix(workspace).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(format!("/{}", parts.join("/")))
    }
}

pub struct WorkspaceSync {
    runner: Arc<dyn CommandRunner>,
    remote: RemoteExecutor,
    strategy: SyncStrategy,
    workspace: PathBuf,
    backend: Backend,
    exclude: Option<String>,
}

impl WorkspaceSync {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        remote: RemoteExecutor,
        strategy: SyncStrategy,
        workspace: impl Into<PathBuf>,
        backend: Backend,
    ) -> Self {
        Self {
            runner,
            remote,
            strategy,
            workspace: workspace.into(),
            backend,
            exclude: None,
        }
    }

    /// Keep `action_dir` out of the rsync push.
    pub fn excluding(mut self, action_dir: &Path) -> Self {
        self.exclude = exclude_pattern(&self.workspace, action_dir);
        self
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    fn alias(&self) -> &str {
        self.remote.host()
    }

    fn ws(&self) -> String {
        self.workspace.to_string_lossy().into_owned()
    }

    /// Host to guest transfer for the copying strategies.
    pub fn push_command(&self) -> Option<CommandSpec> {
        let target = format!("{}:{REMOTE_DIR}/", self.alias());
        match self.strategy {
            SyncStrategy::Rsync => {
                let mut spec = CommandSpec::new("rsync").args(["-avz", "-e", RSYNC_SHELL]);
                if let Some(pattern) = &self.exclude {
                    spec = spec.arg("--exclude").arg(pattern);
                }
                Some(spec.arg(format!("{}/", self.ws())).arg(target))
            }
            SyncStrategy::Scp => Some(
                CommandSpec::new("scp")
                    .args(["-O", "-r", "-o", "StrictHostKeyChecking=no"])
                    .arg(self.ws())
                    .arg(target),
            ),
            _ => None,
        }
    }

    /// Guest to host transfer for the copying strategies.
    ///
    /// `scp -r <ws> alias:work/` lands in `work/<basename>`, so the scp pull
    /// reads from there.
    pub fn pull_command(&self) -> Option<CommandSpec> {
        let dest = format!("{}/", self.ws());
        match self.strategy {
            SyncStrategy::Rsync => Some(
                CommandSpec::new("rsync")
                    .args(["-avz", "-e", RSYNC_SHELL])
                    .arg(format!("{}:{REMOTE_DIR}/", self.alias()))
                    .arg(dest),
            ),
            SyncStrategy::Scp => {
                let source = match self.workspace.file_name() {
                    Some(base) => format!(
                        "{}:{REMOTE_DIR}/{}/*",
                        self.alias(),
                        base.to_string_lossy()
                    ),
                    None => format!("{}:{REMOTE_DIR}/*", self.alias()),
                };
                Some(
                    CommandSpec::new("scp")
                        .args(["-O", "-r", "-o", "StrictHostKeyChecking=no"])
                        .arg(source)
                        .arg(dest),
                )
            }
            _ => None,
        }
    }

    pub fn sshfs_mount(&self) -> String {
        format!(
            "sshfs -o reconnect,ServerAliveCountMax=2,allow_other,default_permissions host:{} $HOME/{REMOTE_DIR}",
            self.ws()
        )
    }

    pub fn nfs_mount(&self) -> String {
        format!(
            "mount -t nfs {}:{} $HOME/{REMOTE_DIR}",
            self.backend.host_gateway(),
            self.ws()
        )
    }

    async fn ensure_remote_dir(&self) -> anyhow::Result<()> {
        self.remote
            .exec(&format!("mkdir -p $HOME/{REMOTE_DIR}"), FailurePolicy::BestEffort)
            .await?;
        Ok(())
    }

    /// Mirror the workspace into the guest.
    pub async fn sync_in(&self) -> anyhow::Result<()> {
        if !self.strategy.transfers() {
            info!("sync disabled, nothing to transfer");
            return Ok(());
        }
        self.ensure_remote_dir().await?;

        match self.strategy {
            SyncStrategy::Rsync | SyncStrategy::Scp => {
                info!(strategy = %self.strategy, "Syncing workspace");
                if let Some(push) = self.push_command() {
                    self.runner
                        .run_with(&push, FailurePolicy::Fatal)
                        .await
                        .with_context(|| format!("{} push failed", self.strategy))?;
                }
            }
            SyncStrategy::Sshfs => {
                info!("Setting up SSHFS");
                self.remote
                    .exec(SSHFS_INSTALL, FailurePolicy::BestEffort)
                    .await?;
                self.remote
                    .exec(&self.sshfs_mount(), FailurePolicy::Fatal)
                    .await
                    .context("sshfs mount failed")?;
            }
            SyncStrategy::Nfs => {
                info!("Setting up NFS");
                vmrun_host::export_workspace(self.runner.as_ref(), &self.workspace).await?;
                let out = self
                    .remote
                    .exec(&self.nfs_mount(), FailurePolicy::BestEffort)
                    .await?;
                if !out.success() {
                    warn!("NFS mount failed");
                }
            }
            SyncStrategy::None => {}
        }
        Ok(())
    }

    /// Mirror the guest workspace back. No-op for strategies without a pull.
    pub async fn copy_back(&self) -> anyhow::Result<()> {
        if let Some(pull) = self.pull_command() {
            info!(strategy = %self.strategy, "Copying back artifacts");
            self.runner
                .run_with(&pull, FailurePolicy::Fatal)
                .await
                .with_context(|| format!("{} copy-back failed", self.strategy))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrun_core::fakes::{FakeResponse, FakeRunner};

    fn sync(runner: &Arc<FakeRunner>, strategy: SyncStrategy, backend: Backend) -> WorkspaceSync {
        let runner: Arc<dyn CommandRunner> = runner.clone();
        WorkspaceSync::new(
            runner.clone(),
            RemoteExecutor::new(runner, "freebsd"),
            strategy,
            "/home/runner/work/repo",
            backend,
        )
    }

    #[test]
    fn test_exclude_only_strictly_inside() {
        let ws = Path::new("/w/repo");
        assert_eq!(
            exclude_pattern(ws, Path::new("/w/repo/.github/actions/vm")),
            Some("/.github/actions/vm".to_string())
        );
        assert_eq!(exclude_pattern(ws, Path::new("/w/repo")), None);
        assert_eq!(exclude_pattern(ws, Path::new("/w/_actions/vm")), None);
    }

    #[test]
    fn test_rsync_commands() {
        let runner = Arc::new(FakeRunner::new());
        let s = sync(&runner, SyncStrategy::Rsync, Backend::Qemu)
            .excluding(Path::new("/home/runner/work/repo/vm-action"));
        let push = s.push_command().unwrap();
        assert_eq!(
            push.args,
            vec![
                "-avz",
                "-e",
                "ssh -o StrictHostKeyChecking=no",
                "--exclude",
                "/vm-action",
                "/home/runner/work/repo/",
                "freebsd:work/",
            ]
        );
        assert_eq!(
            s.pull_command().unwrap().command_line(),
            "rsync -avz -e ssh -o StrictHostKeyChecking=no freebsd:work/ /home/runner/work/repo/"
        );
    }

    #[test]
    fn test_scp_pull_reads_where_push_lands() {
        let runner = Arc::new(FakeRunner::new());
        let s = sync(&runner, SyncStrategy::Scp, Backend::Qemu);
        assert_eq!(
            s.push_command().unwrap().command_line(),
            "scp -O -r -o StrictHostKeyChecking=no /home/runner/work/repo freebsd:work/"
        );
        assert_eq!(
            s.pull_command().unwrap().command_line(),
            "scp -O -r -o StrictHostKeyChecking=no freebsd:work/repo/* /home/runner/work/repo/"
        );
    }

    #[tokio::test]
    async fn test_none_makes_no_calls() {
        let runner = Arc::new(FakeRunner::new());
        let s = sync(&runner, SyncStrategy::None, Backend::Qemu);
        s.sync_in().await.unwrap();
        s.copy_back().await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rsync_push_failure_is_fatal() {
        let runner = Arc::new(FakeRunner::new().on(FakeResponse::exit("rsync", 23)));
        let s = sync(&runner, SyncStrategy::Rsync, Backend::Qemu);
        assert!(s.sync_in().await.is_err());
        assert!(runner.position("mkdir -p $HOME/work").unwrap() < runner.position("rsync").unwrap());
    }

    #[tokio::test]
    async fn test_mkdir_failure_is_tolerated() {
        let runner = Arc::new(FakeRunner::new().on(FakeResponse::exit("mkdir", 1)));
        let s = sync(&runner, SyncStrategy::Scp, Backend::Qemu);
        s.sync_in().await.unwrap();
        assert_eq!(runner.count_matching("scp -O -r"), 1);
    }

    #[tokio::test]
    async fn test_sshfs_install_best_effort_mount_fatal() {
        let runner = Arc::new(
            FakeRunner::new()
                .on(FakeResponse::exit("command -v sshfs", 1))
                .on(FakeResponse::exit("sshfs -o", 1)),
        );
        let s = sync(&runner, SyncStrategy::Sshfs, Backend::Qemu);
        let err = s.sync_in().await.unwrap_err();
        assert!(err.to_string().contains("sshfs mount failed"));
        assert_eq!(runner.count_matching("command -v sshfs"), 1);
    }

    #[tokio::test]
    async fn test_nfs_mount_failure_is_tolerated() {
        let runner = Arc::new(FakeRunner::new().on(FakeResponse::exit("mount -t nfs", 32)));
        let s = sync(&runner, SyncStrategy::Nfs, Backend::VirtualBox);
        s.sync_in().await.unwrap();

        assert!(runner.position("exportfs").unwrap() < runner.position("mount -t nfs").unwrap());
        assert_eq!(
            runner.count_matching("mount -t nfs 10.0.2.2:/home/runner/work/repo $HOME/work"),
            1
        );
    }

    #[tokio::test]
    async fn test_live_mounts_have_no_pull() {
        let runner = Arc::new(FakeRunner::new());
        for strategy in [SyncStrategy::Sshfs, SyncStrategy::Nfs] {
            let s = sync(&runner, strategy, Backend::Qemu);
            assert!(s.pull_command().is_none());
            s.copy_back().await.unwrap();
        }
        assert!(runner.calls().is_empty());
    }
}
