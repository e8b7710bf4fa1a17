//! Action inputs.
//!
//! GitHub hands every input over as a free-form string (`INPUT_<NAME>`).
//! They are kept raw here and interpreted through the accessor methods, so
//! the comparison rules live in one place: `copyback` is on unless it is
//! exactly `"false"`, `usesh` and `debug` are off unless exactly `"true"`.

use crate::error::{Result, VmError};
use crate::nat::{parse_nat_spec, PortForward};
use crate::sync::SyncStrategy;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionInputs {
    pub debug: Option<String>,
    pub release: Option<String>,
    pub arch: Option<String>,
    pub osname: String,
    pub mem: Option<String>,
    pub cpu: Option<String>,
    pub nat: Option<String>,
    pub envs: Option<String>,
    pub prepare: Option<String>,
    pub run: Option<String>,
    pub sync: Option<String>,
    pub copyback: Option<String>,
    pub usesh: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ActionInputs {
    pub fn debug(&self) -> bool {
        non_empty(&self.debug) == Some("true")
    }

    pub fn usesh(&self) -> bool {
        non_empty(&self.usesh) == Some("true")
    }

    pub fn copyback(&self) -> bool {
        non_empty(&self.copyback) != Some("false")
    }

    pub fn sync_strategy(&self) -> Result<SyncStrategy> {
        non_empty(&self.sync).unwrap_or_default().parse()
    }

    /// The `sync` input as given, for handing through to the launcher.
    pub fn sync_arg(&self) -> Option<&str> {
        non_empty(&self.sync)
    }

    pub fn release(&self) -> Option<&str> {
        non_empty(&self.release)
    }

    pub fn arch(&self) -> Option<&str> {
        non_empty(&self.arch)
    }

    pub fn mem(&self) -> Option<&str> {
        non_empty(&self.mem)
    }

    pub fn cpu(&self) -> Option<&str> {
        non_empty(&self.cpu)
    }

    pub fn nat(&self) -> Option<&str> {
        non_empty(&self.nat)
    }

    pub fn port_forwards(&self) -> Result<Vec<PortForward>> {
        match self.nat() {
            Some(spec) => parse_nat_spec(spec),
            None => Ok(Vec::new()),
        }
    }

    pub fn envs(&self) -> Option<&str> {
        non_empty(&self.envs)
    }

    /// Commands keep their inner whitespace; only an all-blank command
    /// counts as absent.
    pub fn prepare(&self) -> Option<&str> {
        self.prepare.as_deref().filter(|c| !c.trim().is_empty())
    }

    pub fn run(&self) -> Option<&str> {
        self.run.as_deref().filter(|c| !c.trim().is_empty())
    }

    /// Reject inputs that can never lead to a successful run, before any
    /// side effect happens.
    pub fn validate(&self) -> Result<()> {
        if self.osname.trim().is_empty() {
            return Err(VmError::InvalidInput {
                name: "osname".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        self.sync_strategy()?;
        self.port_forwards()?;
        Ok(())
    }
}
