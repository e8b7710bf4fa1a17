//! vmrun Core Library
//!
//! Domain types shared by the host-side and guest-side halves of vmrun:
//! the layered release configuration, the action inputs, NAT and sync
//! vocabularies, and the process-runner seam every external tool call goes
//! through.

pub mod config;
pub mod error;
pub mod fakes;
pub mod inputs;
pub mod nat;
pub mod process;
pub mod sync;
pub mod telemetry;
pub mod workflow;

pub use config::{
    normalize_arch, Backend, ConfigMap, ConfigResolver, ReadyProbeKind, ResolvedConfig,
    DEFAULT_CONF_FILE,
};
pub use error::{Result, VmError};
pub use inputs::ActionInputs;
pub use nat::{parse_nat_spec, PortForward, Protocol};
pub use process::{CommandOutput, CommandRunner, CommandSpec, FailurePolicy, SystemRunner};
pub use sync::SyncStrategy;
pub use telemetry::init_tracing;
