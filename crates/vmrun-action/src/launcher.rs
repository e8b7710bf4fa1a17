//! Guest launch for both hypervisor backends.
//!
//! QEMU guests are started by the pinned `anyvm.py` script, which also
//! writes the guest's SSH alias and waits for sshd itself. VirtualBox
//! guests are driven directly with `vboxmanage`, forwarded an SSH port over
//! NAT, and watched by the [`BootDetector`] until they are up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use vmrun_core::{
    ActionInputs, Backend, CommandRunner, CommandSpec, FailurePolicy, PortForward,
    ReadyProbeKind, ResolvedConfig,
};
use vmrun_host::SshHostEntry;

use crate::boot::{BootDetector, OcrProbe, ReadinessProbe, SshProbe};
use crate::remote::RemoteExecutor;

/// Where the `anyvm.py` launcher comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherSource {
    /// Fetch the version pinned by `ANYVM_VERSION`.
    Download,
    /// Use a script already on disk.
    Local(PathBuf),
}

/// A started guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedVm {
    /// SSH host alias and hypervisor VM name.
    pub alias: String,
    pub backend: Backend,
    /// Settings the host's SSH config needs for `alias`.
    pub ssh_entry: SshHostEntry,
}

// ---------------------------------------------------------------------------
// QEMU via anyvm.py
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuLauncher {
    pub os_name: String,
    pub release: String,
    pub arch: Option<String>,
    pub anyvm_version: String,
    pub builder_version: Option<String>,
    pub cpu: Option<String>,
    pub mem: Option<String>,
    pub nat: Option<String>,
    pub sync: Option<String>,
    pub data_dir: PathBuf,
    pub source: LauncherSource,
}

fn python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

impl QemuLauncher {
    pub fn from_config(
        config: &ResolvedConfig,
        inputs: &ActionInputs,
        data_dir: PathBuf,
        source: LauncherSource,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            os_name: inputs.osname.trim().to_string(),
            release: config.release.clone(),
            arch: config.arch.clone(),
            anyvm_version: config.anyvm_version()?.to_string(),
            builder_version: config.builder_version().map(str::to_string),
            cpu: inputs.cpu().map(str::to_string),
            mem: inputs.mem().map(str::to_string),
            nat: inputs.nat().map(str::to_string),
            sync: inputs.sync_arg().map(str::to_string),
            data_dir,
            source,
        })
    }

    /// The `anyvm.py` invocation, daemonized (`-d`).
    pub fn launch_command(&self, script: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(python())
            .arg(script.to_string_lossy())
            .args(["--os", self.os_name.as_str(), "--release", self.release.as_str()]);
        if let Some(arch) = &self.arch {
            spec = spec.args(["--arch", arch.as_str()]);
        }
        spec = spec
            .arg("--data-dir")
            .arg(self.data_dir.to_string_lossy());
        let optional = [
            ("--builder", &self.builder_version),
            ("--cpu", &self.cpu),
            ("--mem", &self.mem),
            ("--nat", &self.nat),
            ("--sync", &self.sync),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                spec = spec.args([flag, value.as_str()]);
            }
        }
        spec.args(["-d", "--ssh-name", self.os_name.as_str()])
    }

    async fn script(&self, action_dir: &Path) -> anyhow::Result<PathBuf> {
        match &self.source {
            LauncherSource::Local(path) => Ok(path.clone()),
            LauncherSource::Download => {
                let client = vmrun_host::http_client()?;
                let path =
                    vmrun_host::fetch_launcher(&client, &self.anyvm_version, action_dir).await?;
                Ok(path)
            }
        }
    }

    pub async fn launch(
        &self,
        runner: &dyn CommandRunner,
        action_dir: &Path,
    ) -> anyhow::Result<LaunchedVm> {
        info!(version = %self.anyvm_version, builder = ?self.builder_version, "Using anyvm");
        let script = self.script(action_dir).await?;
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create data dir {:?}", self.data_dir))?;

        runner
            .run_with(&self.launch_command(&script), FailurePolicy::Fatal)
            .await
            .context("anyvm.py failed to start the VM")?;

        Ok(LaunchedVm {
            alias: self.os_name.clone(),
            backend: Backend::Qemu,
            ssh_entry: SshHostEntry::new(&self.os_name),
        })
    }
}

// ---------------------------------------------------------------------------
// VirtualBox via vboxmanage
// ---------------------------------------------------------------------------

/// Name of the NAT rule carrying SSH.
const SSH_RULE: &str = "vmrun-ssh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VboxLauncher {
    pub vm_name: String,
    pub ova_url: Option<String>,
    pub cpu: Option<String>,
    pub mem: Option<String>,
    pub forwards: Vec<PortForward>,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub login_tag: Option<String>,
    pub probe: ReadyProbeKind,
    pub boot: BootDetector,
    pub data_dir: PathBuf,
}

impl VboxLauncher {
    pub fn from_config(
        config: &ResolvedConfig,
        inputs: &ActionInputs,
        data_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            vm_name: config.get_or("VBOX_VM_NAME", inputs.osname.trim()).to_string(),
            ova_url: config.get("VBOX_OVA_URL").map(str::to_string),
            cpu: inputs.cpu().map(str::to_string),
            mem: inputs.mem().map(str::to_string),
            forwards: inputs.port_forwards()?,
            ssh_user: config.get_or("VM_SSH_USER", "root").to_string(),
            ssh_port: config.parse_or("VM_SSH_PORT", 2222u16)?,
            login_tag: config.get("VM_LOGIN_TAG").map(str::to_string),
            probe: config.ready_probe()?,
            boot: BootDetector {
                max_attempts: config
                    .parse_or("VM_BOOT_ATTEMPTS", BootDetector::DEFAULT_MAX_ATTEMPTS)?,
                ..BootDetector::default()
            },
            data_dir,
        })
    }

    fn vbox(&self) -> CommandSpec {
        CommandSpec::new("vboxmanage")
    }

    pub fn import_command(&self, ova: &Path) -> CommandSpec {
        self.vbox()
            .arg("import")
            .arg(ova.to_string_lossy())
            .args(["--vsys", "0", "--vmname", self.vm_name.as_str()])
    }

    /// Resources plus every NAT rule, SSH first.
    pub fn modify_command(&self) -> CommandSpec {
        let mut spec = self.vbox().args(["modifyvm", self.vm_name.as_str()]);
        if let Some(cpu) = &self.cpu {
            spec = spec.args(["--cpus", cpu.as_str()]);
        }
        if let Some(mem) = &self.mem {
            spec = spec.args(["--memory", mem.as_str()]);
        }
        spec = spec
            .arg("--natpf1")
            .arg(format!("{SSH_RULE},tcp,,{},,22", self.ssh_port));
        for (index, forward) in self.forwards.iter().enumerate() {
            spec = spec.arg("--natpf1").arg(forward.to_vbox_rule(index));
        }
        spec
    }

    pub fn start_command(&self) -> CommandSpec {
        self.vbox()
            .args(["startvm", self.vm_name.as_str(), "--type", "headless"])
    }

    fn ssh_target(&self) -> String {
        format!("{}@127.0.0.1", self.ssh_user)
    }

    fn readiness_probe(&self, runner: Arc<dyn CommandRunner>) -> Box<dyn ReadinessProbe> {
        match self.probe {
            ReadyProbeKind::Ocr => Box::new(OcrProbe::new(
                runner,
                &self.vm_name,
                self.data_dir.join("screen.png"),
                self.login_tag.clone(),
            )),
            ReadyProbeKind::Ssh => Box::new(SshProbe::new(
                RemoteExecutor::new(runner, self.ssh_target()).port(self.ssh_port),
            )),
        }
    }

    pub async fn launch(&self, runner: Arc<dyn CommandRunner>) -> anyhow::Result<LaunchedVm> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create data dir {:?}", self.data_dir))?;

        if let Some(url) = &self.ova_url {
            let ova = self.data_dir.join(format!("{}.ova", self.vm_name));
            let client = vmrun_host::http_client()?;
            vmrun_host::download_file(&client, url, &ova).await?;
            runner
                .run_with(&self.import_command(&ova), FailurePolicy::Fatal)
                .await
                .context("Failed to import the VM image")?;
        }

        // A stale rule from the image would make the add below fail.
        runner
            .run_with(
                &self
                    .vbox()
                    .args(["modifyvm", self.vm_name.as_str(), "--natpf1", "delete", SSH_RULE])
                    .captured(),
                FailurePolicy::BestEffort,
            )
            .await?;
        runner
            .run_with(&self.modify_command(), FailurePolicy::Fatal)
            .await
            .context("Failed to configure the VM")?;
        runner
            .run_with(&self.start_command(), FailurePolicy::Fatal)
            .await
            .context("Failed to start the VM")?;

        let probe = self.readiness_probe(runner);
        self.boot.wait(probe.as_ref()).await?;

        Ok(LaunchedVm {
            alias: self.vm_name.clone(),
            backend: Backend::VirtualBox,
            ssh_entry: SshHostEntry::new(&self.vm_name)
                .user(&self.ssh_user)
                .hostname("127.0.0.1")
                .port(self.ssh_port),
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The backend-specific launcher for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmLauncher {
    Qemu(QemuLauncher),
    VirtualBox(VboxLauncher),
}

impl VmLauncher {
    pub fn from_config(
        config: &ResolvedConfig,
        inputs: &ActionInputs,
        action_dir: &Path,
        source: LauncherSource,
    ) -> anyhow::Result<Self> {
        let data_dir = action_dir.join("output");
        Ok(match config.backend()? {
            Backend::Qemu => {
                VmLauncher::Qemu(QemuLauncher::from_config(config, inputs, data_dir, source)?)
            }
            Backend::VirtualBox => {
                VmLauncher::VirtualBox(VboxLauncher::from_config(config, inputs, data_dir)?)
            }
        })
    }

    pub async fn launch(
        &self,
        runner: Arc<dyn CommandRunner>,
        action_dir: &Path,
    ) -> anyhow::Result<LaunchedVm> {
        match self {
            VmLauncher::Qemu(qemu) => qemu.launch(runner.as_ref(), action_dir).await,
            VmLauncher::VirtualBox(vbox) => vbox.launch(runner).await,
        }
    }
}
