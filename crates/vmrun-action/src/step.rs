//! Action step definitions and per-step records.

use serde::{Deserialize, Serialize};

/// The fixed steps of an action run, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionStep {
    /// Layer the conf files and validate inputs.
    ResolveConfig,

    /// Install hypervisor and sync tooling on the host.
    InstallDeps,

    /// Start the guest and wait until it is reachable.
    LaunchVm,

    /// Append the guest's `Host` stanza to `~/.ssh/config`.
    ConfigureSsh,

    /// The optional `prepare` command.
    Prepare,

    /// Mirror the workspace into the guest.
    SyncIn,

    /// The user's `run` command.
    Run,

    /// Mirror the guest workspace back to the host.
    CopyBack,
}

impl ActionStep {
    /// Every step, in order.
    pub const ALL: [ActionStep; 8] = [
        ActionStep::ResolveConfig,
        ActionStep::InstallDeps,
        ActionStep::LaunchVm,
        ActionStep::ConfigureSsh,
        ActionStep::Prepare,
        ActionStep::SyncIn,
        ActionStep::Run,
        ActionStep::CopyBack,
    ];

    /// Get the step name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ActionStep::ResolveConfig => "resolve_config",
            ActionStep::InstallDeps => "install_deps",
            ActionStep::LaunchVm => "launch_vm",
            ActionStep::ConfigureSsh => "configure_ssh",
            ActionStep::Prepare => "prepare",
            ActionStep::SyncIn => "sync_in",
            ActionStep::Run => "run",
            ActionStep::CopyBack => "copy_back",
        }
    }

    /// Log group title shown in the job log.
    pub fn title(&self) -> &'static str {
        match self {
            ActionStep::ResolveConfig => "Resolving config",
            ActionStep::InstallDeps => "Installing dependencies",
            ActionStep::LaunchVm => "Starting VM",
            ActionStep::ConfigureSsh => "Configuring SSH",
            ActionStep::Prepare => "Run 'prepare' in VM",
            ActionStep::SyncIn => "Syncing workspace into VM",
            ActionStep::Run => "Run 'run' in VM",
            ActionStep::CopyBack => "Copying back artifacts",
        }
    }
}

/// How a step ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    Skipped,
    Failed,
}

/// Record of one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step: ActionStep,

    pub outcome: StepOutcome,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Skip reason or error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StepRecord {
    pub fn done(step: ActionStep, duration_ms: u64) -> Self {
        Self {
            step,
            outcome: StepOutcome::Done,
            duration_ms,
            detail: None,
        }
    }

    pub fn skipped(step: ActionStep, reason: impl Into<String>) -> Self {
        Self {
            step,
            outcome: StepOutcome::Skipped,
            duration_ms: 0,
            detail: Some(reason.into()),
        }
    }

    pub fn failed(step: ActionStep, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            step,
            outcome: StepOutcome::Failed,
            duration_ms,
            detail: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names() {
        assert_eq!(ActionStep::ResolveConfig.name(), "resolve_config");
        assert_eq!(ActionStep::LaunchVm.name(), "launch_vm");
        assert_eq!(ActionStep::CopyBack.name(), "copy_back");
    }

    #[test]
    fn test_all_is_in_execution_order() {
        assert_eq!(ActionStep::ALL.first(), Some(&ActionStep::ResolveConfig));
        assert_eq!(ActionStep::ALL.last(), Some(&ActionStep::CopyBack));
        let prepare = ActionStep::ALL.iter().position(|s| *s == ActionStep::Prepare);
        let sync = ActionStep::ALL.iter().position(|s| *s == ActionStep::SyncIn);
        assert!(prepare < sync);
    }

    #[test]
    fn test_record_serializes_snake_case() {
        let record = StepRecord::skipped(ActionStep::CopyBack, "live mount");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["step"], "copy_back");
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["detail"], "live mount");

        let json = serde_json::to_value(StepRecord::done(ActionStep::Run, 5)).unwrap();
        assert!(json.get("detail").is_none());
    }
}
