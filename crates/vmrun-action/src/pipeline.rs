//! Action orchestration and run reporting.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};
use vmrun_core::{
    workflow, ActionInputs, CommandRunner, ConfigResolver, FailurePolicy, ResolvedConfig,
};
use vmrun_host::{HostError, HostPlatform, SshHostEntry};

use crate::launcher::{LaunchedVm, LauncherSource, VmLauncher};
use crate::remote::RemoteExecutor;
use crate::step::{ActionStep, StepOutcome, StepRecord};
use crate::workspace::WorkspaceSync;

/// Everything a run needs from its surroundings.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub inputs: ActionInputs,

    /// Checkout of the action itself; `anyvm.py` and `output/` live here.
    pub action_dir: PathBuf,

    /// Directory holding the release `.conf` files.
    pub conf_dir: PathBuf,

    /// Host workspace to sync. `None` disables sync and copy-back.
    pub workspace: Option<PathBuf>,

    /// Home directory whose `.ssh/config` gets the guest's stanza.
    pub home: Option<PathBuf>,

    pub platform: HostPlatform,

    pub launcher: LauncherSource,
}

impl ActionContext {
    pub fn new(inputs: ActionInputs, action_dir: impl Into<PathBuf>) -> Self {
        let action_dir = action_dir.into();
        Self {
            inputs,
            conf_dir: action_dir.join("conf"),
            action_dir,
            workspace: None,
            home: None,
            platform: HostPlatform::current(),
            launcher: LauncherSource::Download,
        }
    }

    pub fn with_conf_dir(mut self, conf_dir: impl Into<PathBuf>) -> Self {
        self.conf_dir = conf_dir.into();
        self
    }

    pub fn with_workspace(mut self, workspace: Option<PathBuf>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_launcher(mut self, launcher: LauncherSource) -> Self {
        self.launcher = launcher;
        self
    }
}

/// Result of a complete action run.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    /// One record per step, in execution order.
    pub steps: Vec<StepRecord>,

    /// Whether every executed step finished.
    pub success: bool,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    /// The fatal error, when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionReport {
    pub fn outcome(&self, step: ActionStep) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|r| r.step == step)
            .map(|r| r.outcome)
    }

    /// The step that stopped the run.
    pub fn failed_step(&self) -> Option<ActionStep> {
        self.steps
            .iter()
            .find(|r| r.outcome == StepOutcome::Failed)
            .map(|r| r.step)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Run one step inside a log group and record how it ended.
async fn track<T, F>(steps: &mut Vec<StepRecord>, step: ActionStep, body: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let _group = workflow::group(step.title());
    info!(step = step.name(), "Executing step");
    let start = Instant::now();
    match body.await {
        Ok(value) => {
            steps.push(StepRecord::done(step, elapsed_ms(start)));
            Ok(value)
        }
        Err(e) => {
            error!(step = step.name(), error = %format!("{e:#}"), "Step failed");
            steps.push(StepRecord::failed(step, elapsed_ms(start), format!("{e:#}")));
            Err(e)
        }
    }
}

fn skip(steps: &mut Vec<StepRecord>, step: ActionStep, reason: &str) {
    info!(step = step.name(), reason, "Skipping step");
    steps.push(StepRecord::skipped(step, reason));
}

/// Sequences the steps of one action run.
pub struct ActionDriver {
    runner: Arc<dyn CommandRunner>,
    ctx: ActionContext,
}

impl ActionDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, ctx: ActionContext) -> Self {
        Self { runner, ctx }
    }

    /// Execute every step in order. The first fatal error stops the run;
    /// steps after it are recorded as skipped.
    pub async fn run(&self) -> ActionReport {
        let start = Instant::now();
        info!(osname = %self.ctx.inputs.osname, "Starting action");

        let mut steps = Vec::with_capacity(ActionStep::ALL.len());
        let outcome = self.execute(&mut steps).await;

        for step in ActionStep::ALL.iter().skip(steps.len()) {
            steps.push(StepRecord::skipped(*step, "not reached"));
        }

        let duration_ms = elapsed_ms(start);
        match outcome {
            Ok(()) => {
                info!(duration_ms, "Action completed successfully");
                ActionReport {
                    steps,
                    success: true,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                info!(duration_ms, "Action failed");
                ActionReport {
                    steps,
                    success: false,
                    duration_ms,
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }

    async fn execute(&self, steps: &mut Vec<StepRecord>) -> anyhow::Result<()> {
        let inputs = &self.ctx.inputs;

        let (config, launcher) =
            track(steps, ActionStep::ResolveConfig, self.resolve_config()).await?;

        let backend = config.backend()?;
        if vmrun_host::install_plan(self.ctx.platform, backend).is_empty() {
            skip(steps, ActionStep::InstallDeps, "no installer for this host platform");
        } else {
            track(steps, ActionStep::InstallDeps, self.install_deps(&config)).await?;
        }

        let vm = track(
            steps,
            ActionStep::LaunchVm,
            launcher.launch(self.runner.clone(), &self.ctx.action_dir),
        )
        .await?;

        let mut entry = vm.ssh_entry.clone();
        if let Some(envs) = inputs.envs() {
            entry = entry.send_env(envs);
        }
        if entry.is_empty() {
            skip(steps, ActionStep::ConfigureSsh, "nothing to configure");
        } else {
            track(steps, ActionStep::ConfigureSsh, self.configure_ssh(&entry)).await?;
        }

        let remote = RemoteExecutor::new(self.runner.clone(), &vm.alias).use_sh(inputs.usesh());

        match inputs.prepare() {
            Some(cmd) => track(steps, ActionStep::Prepare, exec(&remote, cmd)).await?,
            None => skip(steps, ActionStep::Prepare, "no prepare command"),
        }

        let strategy = inputs.sync_strategy()?;
        let sync = match &self.ctx.workspace {
            Some(ws) => Some(self.workspace_sync(&remote, &vm, ws.clone(), strategy)),
            None => {
                warn!("GITHUB_WORKSPACE is not set, skipping workspace sync");
                None
            }
        };

        match &sync {
            None => skip(steps, ActionStep::SyncIn, "no workspace"),
            Some(_) if !strategy.transfers() => skip(steps, ActionStep::SyncIn, "sync disabled"),
            Some(sync) => track(steps, ActionStep::SyncIn, sync.sync_in()).await?,
        }

        match inputs.run() {
            Some(cmd) => track(steps, ActionStep::Run, exec(&remote, cmd)).await?,
            None => skip(steps, ActionStep::Run, "no run command"),
        }

        match &sync {
            None => skip(steps, ActionStep::CopyBack, "no workspace"),
            Some(_) if strategy.is_live_mount() => {
                skip(steps, ActionStep::CopyBack, "workspace is a live mount")
            }
            Some(_) if !strategy.transfers() => skip(steps, ActionStep::CopyBack, "sync disabled"),
            Some(_) if !strategy.copies_back(inputs.copyback()) => {
                skip(steps, ActionStep::CopyBack, "copyback disabled")
            }
            Some(sync) => track(steps, ActionStep::CopyBack, sync.copy_back()).await?,
        }

        Ok(())
    }

    async fn resolve_config(&self) -> anyhow::Result<(ResolvedConfig, VmLauncher)> {
        let inputs = &self.ctx.inputs;
        inputs.validate()?;

        let config = ConfigResolver::new(&self.ctx.conf_dir)
            .resolve(inputs.release(), inputs.arch())?;

        let launcher = VmLauncher::from_config(
            &config,
            inputs,
            &self.ctx.action_dir,
            self.ctx.launcher.clone(),
        )?;
        Ok((config, launcher))
    }

    async fn install_deps(&self, config: &ResolvedConfig) -> anyhow::Result<()> {
        vmrun_host::install_dependencies(self.runner.as_ref(), self.ctx.platform, config.backend()?)
            .await?;
        Ok(())
    }

    async fn configure_ssh(&self, entry: &SshHostEntry) -> anyhow::Result<()> {
        let home = self.ctx.home.as_deref().ok_or(HostError::NoHome)?;
        let path = vmrun_host::append_ssh_config(home, entry)?;
        info!(path = %path.display(), host = %entry.alias, "SSH config updated");
        Ok(())
    }

    fn workspace_sync(
        &self,
        remote: &RemoteExecutor,
        vm: &LaunchedVm,
        workspace: PathBuf,
        strategy: vmrun_core::SyncStrategy,
    ) -> WorkspaceSync {
        WorkspaceSync::new(
            self.runner.clone(),
            remote.clone(),
            strategy,
            workspace,
            vm.backend,
        )
        .excluding(&self.ctx.action_dir)
    }
}

async fn exec(remote: &RemoteExecutor, cmd: &str) -> anyhow::Result<()> {
    remote.exec(cmd, FailurePolicy::Fatal).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_helpers() {
        let report = ActionReport {
            steps: vec![
                StepRecord::done(ActionStep::ResolveConfig, 3),
                StepRecord::failed(ActionStep::InstallDeps, 10, "apt-get exited with code 100"),
                StepRecord::skipped(ActionStep::LaunchVm, "not reached"),
            ],
            success: false,
            duration_ms: 13,
            error: Some("apt-get exited with code 100".to_string()),
        };

        assert_eq!(report.failed_step(), Some(ActionStep::InstallDeps));
        assert_eq!(report.outcome(ActionStep::LaunchVm), Some(StepOutcome::Skipped));
        assert_eq!(report.outcome(ActionStep::Run), None);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["steps"][1]["outcome"], "failed");
    }

    #[test]
    fn test_context_defaults() {
        let ctx = ActionContext::new(ActionInputs::default(), "/a");
        assert_eq!(ctx.conf_dir, PathBuf::from("/a/conf"));
        assert_eq!(ctx.launcher, LauncherSource::Download);
        assert!(ctx.workspace.is_none());
    }
}
