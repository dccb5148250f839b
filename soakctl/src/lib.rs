//! Soak test orchestration: provision a VM, install the logging agent with a
//! generated configuration, start a detached log generator and verify it.

pub mod cleanup;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod plan;
pub mod provision;
pub mod transport;

pub use cleanup::CleanupStack;
pub use config::{ConfigError, LaunchArgs, RunConfig, Timing, WorkloadArgs};
pub use controller::{
    FailureCause, RunController, RunFailure, RunOutcome, RunReport, RunState,
    RunSummary,
};
pub use credentials::{SshKey, SshKeyStore};
pub use plan::RunPlan;
pub use provision::{GcloudProvisioner, InstanceRequest, ProvisionError, Provisioner, VmHandle};
pub use transport::SshTransport;
