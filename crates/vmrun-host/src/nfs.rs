//! Host-side NFS export of the workspace.
//!
//! Every step here is best-effort: NFS depends on the runner image, and a
//! failed export surfaces later as a failed (and equally tolerated) mount
//! inside the guest.

use std::path::Path;

use tracing::info;
use vmrun_core::{CommandRunner, CommandSpec, FailurePolicy};

use crate::Result;

/// Export table the workspace line is appended to.
pub const EXPORTS_FILE: &str = "/etc/exports";

/// `/etc/exports` line for `workspace`. Anonymous access maps to the
/// runner's own uid/gid when known.
pub fn export_line(workspace: &Path, ids: Option<(&str, &str)>) -> String {
    let mut options = String::from("rw,insecure,async,no_subtree_check");
    if let Some((uid, gid)) = ids {
        options.push_str(&format!(",anonuid={uid},anongid={gid}"));
    }
    format!("{} *({options})", workspace.display())
}

async fn query_id(runner: &dyn CommandRunner, flag: &str) -> Result<Option<String>> {
    let out = runner
        .run_with(
            &CommandSpec::new("id").arg(flag).captured(),
            FailurePolicy::BestEffort,
        )
        .await?;
    let id = out.stdout.trim().to_string();
    Ok((out.success() && !id.is_empty()).then_some(id))
}

/// Install the NFS server, export `workspace` and reload the export table.
pub async fn export_workspace(runner: &dyn CommandRunner, workspace: &Path) -> Result<()> {
    info!(workspace = %workspace.display(), "exporting workspace over NFS");

    runner
        .run_with(
            &CommandSpec::new("sudo").args(["apt-get", "update"]).captured(),
            FailurePolicy::BestEffort,
        )
        .await?;
    runner
        .run_with(
            &CommandSpec::new("sudo")
                .args(["apt-get", "install", "-y", "nfs-kernel-server"])
                .captured(),
            FailurePolicy::BestEffort,
        )
        .await?;

    let uid = query_id(runner, "-u").await?;
    let gid = query_id(runner, "-g").await?;
    let ids = uid.as_deref().zip(gid.as_deref());

    let line = export_line(workspace, ids);
    runner
        .run_with(
            &CommandSpec::new("sudo")
                .args(["tee", "-a", EXPORTS_FILE])
                .stdin(format!("{line}\n"))
                .captured(),
            FailurePolicy::BestEffort,
        )
        .await?;
    runner
        .run_with(
            &CommandSpec::new("sudo").args(["exportfs", "-a"]),
            FailurePolicy::BestEffort,
        )
        .await?;
    Ok(())
}
