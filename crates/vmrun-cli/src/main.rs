//! vmrun - run a workflow's commands inside a throwaway VM
//!
//! Every action input is accepted as a flag or from the `INPUT_<NAME>`
//! variable the Actions runner sets, so the same binary serves as the
//! action's entry point and as a local tool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use vmrun_action::{ActionContext, ActionDriver, ActionReport, LauncherSource};
use vmrun_core::{workflow, ActionInputs, SystemRunner};
use vmrun_host::HostPlatform;

#[derive(Parser, Debug)]
#[command(name = "vmrun")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision a VM, sync the workspace in, run commands, copy results back", long_about = None)]
struct Cli {
    /// Raise log verbosity to debug ("true" to enable)
    #[arg(long, env = "INPUT_DEBUG")]
    debug: Option<String>,

    /// OS release; defaults to DEFAULT_RELEASE from the config
    #[arg(long, env = "INPUT_RELEASE")]
    release: Option<String>,

    /// Guest architecture (x86_64, aarch64, ...)
    #[arg(long, env = "INPUT_ARCH")]
    arch: Option<String>,

    /// Guest OS name; also the SSH host alias
    #[arg(long, env = "INPUT_OSNAME")]
    osname: Option<String>,

    /// Guest memory in MB
    #[arg(long, env = "INPUT_MEM")]
    mem: Option<String>,

    /// Guest CPU count
    #[arg(long, env = "INPUT_CPU")]
    cpu: Option<String>,

    /// Port forwards, one `[proto:]hostPort:vmPort` per line
    #[arg(long, env = "INPUT_NAT")]
    nat: Option<String>,

    /// Space-separated host variables forwarded over SSH
    #[arg(long, env = "INPUT_ENVS")]
    envs: Option<String>,

    /// Command run in the guest before the workspace is synced
    #[arg(long, env = "INPUT_PREPARE")]
    prepare: Option<String>,

    /// Command run in the guest after the workspace is synced
    #[arg(long, env = "INPUT_RUN")]
    run: Option<String>,

    /// Sync strategy: rsync, scp, sshfs, nfs or no
    #[arg(long, env = "INPUT_SYNC")]
    sync: Option<String>,

    /// Copy the guest workspace back ("false" to disable)
    #[arg(long, env = "INPUT_COPYBACK")]
    copyback: Option<String>,

    /// Feed commands to `sh` on stdin ("true" to enable)
    #[arg(long, env = "INPUT_USESH")]
    usesh: Option<String>,

    /// Checkout of the action (holds conf/ and receives anyvm.py)
    #[arg(long, env = "GITHUB_ACTION_PATH", default_value = ".")]
    action_dir: PathBuf,

    /// Release config directory (default: <action-dir>/conf)
    #[arg(long)]
    conf_dir: Option<PathBuf>,

    /// Host workspace to sync into the guest
    #[arg(long, env = "GITHUB_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Use a local anyvm.py instead of downloading the pinned version
    #[arg(long)]
    anyvm: Option<PathBuf>,

    /// Write the run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Ok(cwd.join(path))
    }
}

impl Cli {
    fn inputs(&self) -> ActionInputs {
        ActionInputs {
            debug: self.debug.clone(),
            release: self.release.clone(),
            arch: self.arch.clone(),
            osname: self.osname.clone().unwrap_or_default(),
            mem: self.mem.clone(),
            cpu: self.cpu.clone(),
            nat: self.nat.clone(),
            envs: self.envs.clone(),
            prepare: self.prepare.clone(),
            run: self.run.clone(),
            sync: self.sync.clone(),
            copyback: self.copyback.clone(),
            usesh: self.usesh.clone(),
        }
    }

    fn level(&self) -> Level {
        if self.verbose || self.inputs().debug() {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    fn context(&self) -> Result<ActionContext> {
        let action_dir = absolute(&self.action_dir)?;
        let mut ctx = ActionContext::new(self.inputs(), &action_dir)
            .with_workspace(self.workspace.as_deref().map(absolute).transpose()?)
            .with_home(std::env::var_os("HOME").map(PathBuf::from))
            .with_platform(HostPlatform::current());
        if let Some(conf_dir) = &self.conf_dir {
            ctx = ctx.with_conf_dir(absolute(conf_dir)?);
        }
        if let Some(script) = &self.anyvm {
            ctx = ctx.with_launcher(LauncherSource::Local(absolute(script)?));
        }
        Ok(ctx)
    }
}

fn write_report(report: &ActionReport, path: &Path) -> Result<()> {
    let json = report.to_json().context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report to {:?}", path))?;
    info!(path = %path.display(), "Report written");
    Ok(())
}

/// Write the optional report, annotate a failed run, and return the exit code.
/// A report write failure is logged and does not change the exit code.
fn finish(report: &ActionReport, report_path: Option<&Path>) -> i32 {
    if let Some(path) = report_path {
        if let Err(e) = write_report(report, path) {
            warn!(error = %format!("{e:#}"), "Report not written");
        }
    }

    if report.success {
        return 0;
    }
    let message = report
        .error
        .clone()
        .unwrap_or_else(|| "action failed".to_string());
    workflow::error_annotation(&message);
    1
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    vmrun_core::init_tracing(cli.json, cli.level());

    let ctx = match cli.context() {
        Ok(ctx) => ctx,
        Err(e) => {
            workflow::error_annotation(&format!("{e:#}"));
            std::process::exit(1);
        }
    };

    let driver = ActionDriver::new(Arc::new(SystemRunner::new()), ctx);
    let report = driver.run().await;

    let code = finish(&report, cli.report.as_deref());
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use vmrun_action::{ActionStep, StepRecord};

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_map_onto_inputs() {
        let cli = Cli::try_parse_from([
            "vmrun",
            "--osname",
            "openbsd",
            "--release",
            "7.6",
            "--sync",
            "scp",
            "--copyback",
            "false",
            "--usesh",
            "true",
            "--run",
            "uname -a\nmake",
        ])
        .unwrap();

        let inputs = cli.inputs();
        assert_eq!(inputs.osname, "openbsd");
        assert_eq!(inputs.release(), Some("7.6"));
        assert_eq!(inputs.run(), Some("uname -a\nmake"));
        assert!(!inputs.copyback());
        assert!(inputs.usesh());
    }

    #[test]
    fn test_debug_input_raises_level() {
        let cli = Cli::try_parse_from(["vmrun", "--osname", "x", "--debug", "true"]).unwrap();
        assert_eq!(cli.level(), Level::DEBUG);
    }

    #[test]
    fn test_context_paths() {
        let dir = tempfile::tempdir().unwrap();
        let action = dir.path().to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "vmrun",
            "--osname",
            "netbsd",
            "--action-dir",
            action.as_str(),
            "--anyvm",
            "/opt/anyvm.py",
        ])
        .unwrap();

        let ctx = cli.context().unwrap();
        assert_eq!(ctx.conf_dir, dir.path().join("conf"));
        assert_eq!(
            ctx.launcher,
            LauncherSource::Local(PathBuf::from("/opt/anyvm.py"))
        );
    }

    #[test]
    fn test_relative_paths_are_made_absolute() {
        assert!(absolute(Path::new("conf")).unwrap().is_absolute());
        assert_eq!(absolute(Path::new("/a/b")).unwrap(), PathBuf::from("/a/b"));
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = ActionReport {
            steps: vec![StepRecord::done(ActionStep::ResolveConfig, 1)],
            success: true,
            duration_ms: 1,
            error: None,
        };

        write_report(&report, &path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["steps"][0]["step"], "resolve_config");
    }

    #[test]
    fn test_unwritable_report_keeps_failure_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("report.json");
        let report = ActionReport {
            steps: vec![StepRecord::failed(ActionStep::Run, 4, "ssh exited with code 2")],
            success: false,
            duration_ms: 4,
            error: Some("ssh exited with code 2".to_string()),
        };

        assert_eq!(finish(&report, Some(&path)), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_unwritable_report_keeps_success_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("report.json");
        let report = ActionReport {
            steps: vec![StepRecord::done(ActionStep::ResolveConfig, 1)],
            success: true,
            duration_ms: 1,
            error: None,
        };

        assert_eq!(finish(&report, Some(&path)), 0);
        assert_eq!(finish(&report, None), 0);
    }
}
