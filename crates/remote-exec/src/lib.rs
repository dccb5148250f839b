//! Remote execution for soak test VMs.
//!
//! Classifies target platforms, renders per-stage scripts for bash or
//! PowerShell, runs them through a single executor, and launches the
//! workload generator detached from the remote session.

pub mod agent_config;
pub mod error;
pub mod executor;
pub mod launcher;
pub mod platform;
pub mod script;

pub use agent_config::AgentConfig;
pub use error::{ExecutionError, LaunchError, RenderError};
pub use executor::{
    ExecutionResult, ExecutorConfig, RawOutput, RemoteExecutor, RemoteHost, SimulatedReply,
    SimulatedTransport, Transport, TransportError,
};
pub use launcher::{LaunchReceipt, Verification, WorkloadLauncher};
pub use platform::PlatformClass;
pub use script::{ExecMode, RemoteScript, Stage, WorkloadParams};
