//! vmrun Action - guest orchestration
//!
//! Drives one action run end to end:
//! - Launches the guest through `anyvm.py` (QEMU) or `vboxmanage` (VirtualBox)
//! - Waits for VirtualBox guests with a fixed-budget readiness poll
//! - Runs the user's commands over SSH
//! - Mirrors the workspace in and out per sync strategy

pub mod boot;
pub mod launcher;
pub mod pipeline;
pub mod remote;
pub mod step;
pub mod workspace;

// Re-export key types
pub use boot::{BootDetector, OcrProbe, ReadinessProbe, SshProbe};
pub use launcher::{LaunchedVm, LauncherSource, QemuLauncher, VboxLauncher, VmLauncher};
pub use pipeline::{ActionContext, ActionDriver, ActionReport};
pub use remote::RemoteExecutor;
pub use step::{ActionStep, StepOutcome, StepRecord};
pub use workspace::WorkspaceSync;
