//! Host dependency installation.
//!
//! The package set depends on two discriminators: the host OS the runner
//! uses ([`HostPlatform`]) and the hypervisor backend the release config
//! selects. The plan is plain data so it can be inspected before anything
//! runs.

use tracing::info;
use vmrun_core::{Backend, CommandRunner, CommandSpec, FailurePolicy};

use crate::Result;

/// Operating system of the CI runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Linux,
    MacOs,
    Windows,
    /// No known package manager; installation is skipped.
    Other,
}

impl HostPlatform {
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => HostPlatform::Linux,
            "macos" => HostPlatform::MacOs,
            "windows" => HostPlatform::Windows,
            _ => HostPlatform::Other,
        }
    }
}

const QEMU_APT_PACKAGES: &[&str] = &[
    "qemu-system-x86",
    "qemu-system-arm",
    "qemu-efi-aarch64",
    "nfs-kernel-server",
    "rsync",
    "zstd",
    "ovmf",
    "xz-utils",
    "qemu-utils",
];

const VBOX_APT_PACKAGES: &[&str] = &["virtualbox", "tesseract-ocr", "rsync"];

/// One step of an install plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub command: CommandSpec,
    pub policy: FailurePolicy,
}

impl InstallStep {
    fn fatal(command: CommandSpec) -> Self {
        Self {
            command,
            policy: FailurePolicy::Fatal,
        }
    }

    fn best_effort(command: CommandSpec) -> Self {
        Self {
            command,
            policy: FailurePolicy::BestEffort,
        }
    }
}

/// Commands that install everything `backend` needs on `platform`.
///
/// Index refreshes and permission tweaks are best-effort; the install
/// command itself is fatal.
pub fn install_plan(platform: HostPlatform, backend: Backend) -> Vec<InstallStep> {
    match (platform, backend) {
        (HostPlatform::Linux, backend) => {
            let packages = match backend {
                Backend::Qemu => QEMU_APT_PACKAGES,
                Backend::VirtualBox => VBOX_APT_PACKAGES,
            };
            let mut plan = vec![
                InstallStep::best_effort(CommandSpec::new("sudo").args(["apt-get", "update"])),
                InstallStep::fatal(
                    CommandSpec::new("sudo")
                        .args(["apt-get", "install", "-y"])
                        .args(packages.iter().copied()),
                ),
            ];
            if backend == Backend::Qemu {
                plan.push(InstallStep::best_effort(
                    CommandSpec::new("sudo").args(["chmod", "666", "/dev/kvm"]),
                ));
            }
            plan
        }
        (HostPlatform::MacOs, Backend::Qemu) => {
            vec![InstallStep::fatal(CommandSpec::new("brew").args(["install", "qemu"]))]
        }
        (HostPlatform::MacOs, Backend::VirtualBox) => {
            vec![InstallStep::fatal(CommandSpec::new("brew").args(["install", "tesseract"]))]
        }
        (HostPlatform::Windows, Backend::Qemu) => {
            vec![InstallStep::fatal(CommandSpec::new("choco").args(["install", "qemu", "-y"]))]
        }
        (HostPlatform::Windows, Backend::VirtualBox) => vec![InstallStep::fatal(
            CommandSpec::new("choco").args(["install", "virtualbox", "tesseract", "-y"]),
        )],
        (HostPlatform::Other, _) => Vec::new(),
    }
}

/// Run the install plan for this host.
pub async fn install_dependencies(
    runner: &dyn CommandRunner,
    platform: HostPlatform,
    backend: Backend,
) -> Result<()> {
    let plan = install_plan(platform, backend);
    if plan.is_empty() {
        info!(?platform, "no package manager for this host, skipping dependency install");
        return Ok(());
    }
    info!(?platform, ?backend, steps = plan.len(), "installing host dependencies");
    for step in plan {
        runner.run_with(&step.command, step.policy).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrun_core::fakes::{FakeResponse, FakeRunner};

    #[test]
    fn test_os_discriminator() {
        assert_eq!(HostPlatform::from_os("linux"), HostPlatform::Linux);
        assert_eq!(HostPlatform::from_os("macos"), HostPlatform::MacOs);
        assert_eq!(HostPlatform::from_os("windows"), HostPlatform::Windows);
        assert_eq!(HostPlatform::from_os("freebsd"), HostPlatform::Other);
    }

    #[test]
    fn test_linux_qemu_plan() {
        let plan = install_plan(HostPlatform::Linux, Backend::Qemu);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].policy, FailurePolicy::BestEffort);
        assert_eq!(plan[1].policy, FailurePolicy::Fatal);
        assert!(plan[1].command.args.contains(&"qemu-system-arm".to_string()));
        assert_eq!(plan[2].command.command_line(), "sudo chmod 666 /dev/kvm");
    }

    #[test]
    fn test_virtualbox_plans_pull_in_ocr() {
        let linux = install_plan(HostPlatform::Linux, Backend::VirtualBox);
        assert_eq!(linux.len(), 2);
        assert!(linux[1].command.args.contains(&"tesseract-ocr".to_string()));

        let mac = install_plan(HostPlatform::MacOs, Backend::VirtualBox);
        assert_eq!(mac[0].command.command_line(), "brew install tesseract");
    }

    #[tokio::test]
    async fn test_failed_update_is_tolerated_failed_install_is_not() {
        let runner = FakeRunner::new().on(FakeResponse::exit("apt-get update", 100));
        install_dependencies(&runner, HostPlatform::Linux, Backend::Qemu)
            .await
            .expect("update failure is best-effort");
        assert_eq!(runner.calls().len(), 3);

        let runner = FakeRunner::new().on(FakeResponse::exit("apt-get install", 100));
        assert!(install_dependencies(&runner, HostPlatform::Linux, Backend::Qemu)
            .await
            .is_err());
        assert_eq!(runner.count_matching("chmod"), 0);
    }

    #[tokio::test]
    async fn test_other_platform_runs_nothing() {
        let runner = FakeRunner::new();
        install_dependencies(&runner, HostPlatform::Other, Backend::Qemu)
            .await
            .unwrap();
        assert!(runner.calls().is_empty());
    }
}
