//! Layered shell-style configuration.
//!
//! A release is described by two `KEY=VALUE` files under the action's
//! `conf/` directory: `default.release.conf`, holding process-wide pins such
//! as `ANYVM_VERSION`, and `<release>[-<arch>].conf`, holding the overrides
//! for one guest image. Both are folded into a single [`ConfigMap`].
//!
//! # Expansion
//!
//! `${NAME}` and `$NAME` are substituted once, at the moment the line is
//! read, against whatever the map holds at that point. Substituted text is
//! never scanned again. Names that are unknown or bound to an empty value
//! stay verbatim, and `\$` yields a literal `$`.
//!
//! The [`Display`](fmt::Display) form writes every value double-quoted with
//! each `$` escaped, so parsing it back yields the same map.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::{debug, info};

use crate::error::{Result, VmError};

/// File holding the process-wide defaults.
pub const DEFAULT_CONF_FILE: &str = "default.release.conf";

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_]+)=(.*)$").expect("valid assignment regex"))
}

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\\\$|\$\{([A-Za-z0-9_]+)\}|\$([A-Za-z0-9_]+)")
            .expect("valid reference regex")
    })
}

// ---------------------------------------------------------------------------
// ConfigMap
// ---------------------------------------------------------------------------

/// Insertion-ordered variable map.
///
/// Re-assigning a key replaces its value in place; the key keeps the
/// position of its first definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMap {
    entries: Vec<(String, String)>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Substitute `${NAME}` / `$NAME` references against the current map.
    /// `\$` is an escaped literal `$`.
    pub fn expand(&self, value: &str) -> String {
        reference_re()
            .replace_all(value, |caps: &Captures<'_>| {
                let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
                    return "$".to_string();
                };
                match self.get(name.as_str()).filter(|v| !v.is_empty()) {
                    Some(v) => v.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Fold the lines of one config file into this map.
    pub fn apply(&mut self, content: &str) {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(caps) = assignment_re().captures(trimmed) else {
                debug!(line = trimmed, "ignoring non-assignment config line");
                continue;
            };
            let key = caps[1].to_string();
            let value = self.expand(strip_quotes(&caps[2]));
            self.insert(key, value);
        }
    }

    /// Parse a standalone config text.
    pub fn parse(content: &str) -> Self {
        let mut map = Self::new();
        map.apply(content);
        map
    }
}

impl fmt::Display for ConfigMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            writeln!(f, "{k}=\"{}\"", v.replace('$', "\\$"))?;
        }
        Ok(())
    }
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Hypervisor backend named by `VM_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// `anyvm.py` driving QEMU.
    #[default]
    Qemu,
    /// Direct `vboxmanage` calls.
    VirtualBox,
}

impl Backend {
    /// Address under which the guest reaches the host.
    pub fn host_gateway(&self) -> &'static str {
        match self {
            Backend::Qemu => "192.168.122.1",
            Backend::VirtualBox => "10.0.2.2",
        }
    }
}

impl FromStr for Backend {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "qemu" => Ok(Backend::Qemu),
            "virtualbox" | "vbox" => Ok(Backend::VirtualBox),
            other => Err(VmError::InvalidInput {
                name: "VM_BACKEND".to_string(),
                reason: format!("unknown backend {other:?}"),
            }),
        }
    }
}

/// Readiness signal used while waiting for a VirtualBox guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyProbeKind {
    /// Screenshot the console and OCR it.
    #[default]
    Ocr,
    /// `ssh -p <VM_SSH_PORT> <VM_SSH_USER>@127.0.0.1 true` succeeds.
    Ssh,
}

impl FromStr for ReadyProbeKind {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "ocr" => Ok(ReadyProbeKind::Ocr),
            "ssh" => Ok(ReadyProbeKind::Ssh),
            other => Err(VmError::InvalidInput {
                name: "VM_READY_PROBE".to_string(),
                reason: format!("unknown probe {other:?}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Map the `arch` input onto the conf-file suffix. `None` means the
/// implicit x86_64 image.
pub fn normalize_arch(arch: Option<&str>) -> Option<String> {
    match arch.map(str::trim) {
        None | Some("") | Some("x86_64") | Some("amd64") => None,
        Some("arm64") => Some("aarch64".to_string()),
        Some(other) => Some(other.to_string()),
    }
}

/// The flattened configuration for one run.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub release: String,
    pub arch: Option<String>,
    pub vars: ConfigMap,
}

impl ResolvedConfig {
    /// Value of `key`, treating an empty value as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| VmError::MissingConfigKey(key.to_string()))
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parse `key` as `T`, falling back to `default` when unset.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| VmError::InvalidInput {
                name: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn anyvm_version(&self) -> Result<&str> {
        self.require("ANYVM_VERSION")
    }

    pub fn builder_version(&self) -> Option<&str> {
        self.get("BUILDER_VERSION")
    }

    pub fn backend(&self) -> Result<Backend> {
        self.get_or("VM_BACKEND", "").parse()
    }

    pub fn ready_probe(&self) -> Result<ReadyProbeKind> {
        self.get_or("VM_READY_PROBE", "").parse()
    }
}

/// Resolves the two-layer configuration from a `conf/` directory.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    conf_dir: PathBuf,
}

impl ConfigResolver {
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
        }
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// Path of the release/arch specific file.
    pub fn release_file(&self, release: &str, arch: Option<&str>) -> PathBuf {
        let name = match arch {
            Some(arch) => format!("{release}-{arch}.conf"),
            None => format!("{release}.conf"),
        };
        self.conf_dir.join(name)
    }

    /// Load the default layer, pick the release, then load its override file.
    ///
    /// A missing default file yields an empty layer; a missing release file
    /// is [`VmError::ConfigNotFound`].
    pub fn resolve(&self, release: Option<&str>, arch: Option<&str>) -> Result<ResolvedConfig> {
        let mut vars = ConfigMap::new();

        let default_path = self.conf_dir.join(DEFAULT_CONF_FILE);
        if default_path.exists() {
            vars.apply(&std::fs::read_to_string(&default_path)?);
        } else {
            debug!(path = %default_path.display(), "no default config layer");
        }

        let release = match release.map(str::trim).filter(|r| !r.is_empty()) {
            Some(r) => r.to_string(),
            None => vars
                .get("DEFAULT_RELEASE")
                .filter(|r| !r.is_empty())
                .ok_or_else(|| VmError::MissingConfigKey("DEFAULT_RELEASE".to_string()))?
                .to_string(),
        };
        let arch = normalize_arch(arch);

        let path = self.release_file(&release, arch.as_deref());
        if !path.exists() {
            return Err(VmError::ConfigNotFound { path });
        }
        vars.apply(&std::fs::read_to_string(&path)?);

        info!(release = %release, arch = arch.as_deref().unwrap_or("x86_64"), keys = vars.len(), "resolved config");
        debug!("config:\n{vars}");

        Ok(ResolvedConfig {
            release,
            arch,
            vars,
        })
    }
}
