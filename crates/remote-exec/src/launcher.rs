//! Detached workload launch and startup verification.

use std::time::Duration;
use tracing::{info, warn};

use crate::error::LaunchError;
use crate::executor::{RemoteExecutor, RemoteHost, Transport};
use crate::platform::PlatformClass;
use crate::script::{self, WorkloadParams};

/// What the launch left behind for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReceipt {
    pub platform: PlatformClass,
    /// Debug log capturing the generator's output. `None` on Windows, where
    /// the detached process has no capturable output.
    pub debug_log_path: Option<String>,
    /// Whatever the launching command printed (the process id on Windows).
    pub launch_output: String,
}

/// How the startup check concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The debug log was read back and is non-empty.
    DebugLog { contents: String },
    /// Only the launch call itself could be observed.
    LaunchAccepted,
}

pub struct WorkloadLauncher<'a, T> {
    executor: &'a RemoteExecutor<T>,
}

impl<'a, T: Transport> WorkloadLauncher<'a, T> {
    pub fn new(executor: &'a RemoteExecutor<T>) -> Self {
        Self { executor }
    }

    /// Start the generator so it keeps running after the session closes.
    ///
    /// Returns as soon as the remote host has accepted the command.
    pub async fn launch(
        &self,
        host: &RemoteHost,
        params: &WorkloadParams,
    ) -> Result<LaunchReceipt, LaunchError> {
        let script = script::start_workload(host.platform, params)?;
        let result = self.executor.execute(host, &script).await?;

        let debug_log_path = match host.platform {
            PlatformClass::Posix => Some(params.debug_log_path.clone()),
            PlatformClass::Windows => None,
        };

        info!(
            instance = %host.instance,
            rate = params.rate,
            record_size = params.record_size,
            "Workload generator launched"
        );

        Ok(LaunchReceipt {
            platform: host.platform,
            debug_log_path,
            launch_output: result.stdout,
        })
    }

    /// Wait `grace`, then check the generator started.
    pub async fn verify(
        &self,
        host: &RemoteHost,
        receipt: &LaunchReceipt,
        grace: Duration,
    ) -> Result<Verification, LaunchError> {
        let Some(path) = &receipt.debug_log_path else {
            warn!(
                instance = %host.instance,
                "Generator output is not capturable on this platform; launch acceptance is the only startup signal"
            );
            return Ok(Verification::LaunchAccepted);
        };

        tokio::time::sleep(grace).await;

        let script = script::read_debug_log(host.platform, path)?;
        let result = self.executor.execute(host, &script).await?;

        if result.stdout.trim().is_empty() {
            return Err(LaunchError::EmptyDebugLog { path: path.clone() });
        }

        Ok(Verification::DebugLog {
            contents: result.stdout,
        })
    }
}
