//! NAT port-forward specs.
//!
//! The `nat` input holds one forward per line, either `proto:hostPort:vmPort`
//! or `hostPort:vmPort` (tcp implied). Segments may be padded or quoted, so
//! YAML-ish lines like `"8080": "80"` parse too.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A single host → guest port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub proto: Protocol,
    pub host_port: u16,
    pub vm_port: u16,
}

impl PortForward {
    /// VirtualBox `--natpf1` rule; `index` keeps rule names unique.
    pub fn to_vbox_rule(&self, index: usize) -> String {
        format!(
            "nat{index},{},,{},,{}",
            self.proto.as_str(),
            self.host_port,
            self.vm_port
        )
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.proto.as_str(), self.host_port, self.vm_port)
    }
}

fn clean(segment: &str) -> &str {
    segment.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

fn invalid(entry: &str, reason: impl Into<String>) -> VmError {
    VmError::InvalidNat {
        entry: entry.to_string(),
        reason: reason.into(),
    }
}

fn parse_port(entry: &str, raw: &str) -> Result<u16> {
    clean(raw)
        .parse::<u16>()
        .map_err(|_| invalid(entry, format!("bad port {:?}", clean(raw))))
}

impl FromStr for PortForward {
    type Err = VmError;

    fn from_str(entry: &str) -> Result<Self> {
        let parts: Vec<&str> = entry.split(':').collect();
        let (proto, host, vm) = match parts.as_slice() {
            [host, vm] => (Protocol::Tcp, *host, *vm),
            [proto, host, vm] => {
                let proto = match clean(proto).to_ascii_lowercase().as_str() {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    other => return Err(invalid(entry, format!("unknown protocol {other:?}"))),
                };
                (proto, *host, *vm)
            }
            _ => return Err(invalid(entry, "expected [proto:]hostPort:vmPort")),
        };
        Ok(PortForward {
            proto,
            host_port: parse_port(entry, host)?,
            vm_port: parse_port(entry, vm)?,
        })
    }
}

/// Parse the multi-line `nat` input. Blank lines are skipped.
pub fn parse_nat_spec(spec: &str) -> Result<Vec<PortForward>> {
    spec.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::parse)
        .collect()
}
