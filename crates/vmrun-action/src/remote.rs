//! Remote command execution over SSH.

use std::sync::Arc;

use tracing::info;
use vmrun_core::{CommandOutput, CommandRunner, CommandSpec, FailurePolicy, Result};

/// Options for CI ephemerality: the guest's host key is new every run.
pub const SSH_OPTIONS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// Runs command strings inside the guest.
///
/// By default the command is the remote login shell's argument. With
/// `use_sh` it is written to the stdin of a remote `sh` instead, for guests
/// whose login shell is not Bourne-compatible.
#[derive(Clone)]
pub struct RemoteExecutor {
    runner: Arc<dyn CommandRunner>,
    host: String,
    port: Option<u16>,
    use_sh: bool,
}

impl RemoteExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, host: impl Into<String>) -> Self {
        Self {
            runner,
            host: host.into(),
            port: None,
            use_sh: false,
        }
    }

    /// Connect to an explicit port instead of the alias' configured one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn use_sh(mut self, use_sh: bool) -> Self {
        self.use_sh = use_sh;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The `ssh` invocation that runs `cmd`.
    pub fn ssh_command(&self, cmd: &str) -> CommandSpec {
        let mut spec = CommandSpec::new("ssh").args(SSH_OPTIONS);
        if let Some(port) = self.port {
            spec = spec.arg("-p").arg(port.to_string());
        }
        spec = spec.arg(&self.host);
        if self.use_sh {
            spec.arg("sh").stdin(cmd)
        } else {
            spec.arg(cmd)
        }
    }

    /// Run `cmd` in the guest, streaming its output to the job log.
    pub async fn exec(&self, cmd: &str, policy: FailurePolicy) -> Result<CommandOutput> {
        info!("Exec SSH: {}", cmd);
        self.runner.run_with(&self.ssh_command(cmd), policy).await
    }

    /// Run `cmd` quietly and report whether it exited 0.
    pub async fn probe(&self, cmd: &str) -> bool {
        let spec = self.ssh_command(cmd).captured();
        match self.runner.run_with(&spec, FailurePolicy::BestEffort).await {
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }
}
