//! Run controller.
//!
//! Drives one soak run through its stages:
//!
//! ```text
//! Created -> Provisioned -> AgentInstalled -> InterpreterReady
//!         -> ContentUploaded -> WorkloadLaunched -> Verified
//! ```
//!
//! Any error stops the run, tagged with the state that was being attempted.
//! One deadline covers every stage. Cleanup runs exactly once whichever way
//! the run ends.

use remote_exec::{
    ExecutionError, LaunchError, RemoteExecutor, RemoteHost, RemoteScript, Transport,
    Verification, WorkloadLauncher,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cleanup::CleanupStack;
use crate::config::RunConfig;
use crate::plan::RunPlan;
use crate::provision::{ProvisionError, Provisioner, VmHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Created,
    Provisioned,
    AgentInstalled,
    InterpreterReady,
    ContentUploaded,
    WorkloadLaunched,
    Verified,
}

impl RunState {
    pub fn next(self) -> Option<RunState> {
        match self {
            RunState::Created => Some(RunState::Provisioned),
            RunState::Provisioned => Some(RunState::AgentInstalled),
            RunState::AgentInstalled => Some(RunState::InterpreterReady),
            RunState::InterpreterReady => Some(RunState::ContentUploaded),
            RunState::ContentUploaded => Some(RunState::WorkloadLaunched),
            RunState::WorkloadLaunched => Some(RunState::Verified),
            RunState::Verified => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Provisioned => "provisioned",
            RunState::AgentInstalled => "agent-installed",
            RunState::InterpreterReady => "interpreter-ready",
            RunState::ContentUploaded => "content-uploaded",
            RunState::WorkloadLaunched => "workload-launched",
            RunState::Verified => "verified",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum FailureCause {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("run deadline of {} elapsed", humantime::format_duration(*deadline))]
    Timeout { deadline: Duration },
}

/// Terminal failure, tagged with the state the run was trying to reach.
#[derive(Error, Debug)]
#[error("failed to reach {stage}: {cause}")]
pub struct RunFailure {
    pub stage: RunState,
    #[source]
    pub cause: FailureCause,
}

impl RunFailure {
    fn new(stage: RunState, cause: impl Into<FailureCause>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Verified(Verification),
    Failed(RunFailure),
}

/// Machine-readable account of a run, printed on stdout by `launch`.
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub verified: bool,
    pub states: &'a [RunState],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<&'a VmHandle>,
    pub cleaned_up: &'a [String],
}

#[derive(Debug)]
pub struct RunReport {
    /// States reached, in order, starting with `Created`.
    pub states: Vec<RunState>,
    pub outcome: RunOutcome,
    pub vm: Option<VmHandle>,
    /// Cleanup actions that ran, in the order they ran.
    pub cleaned_up: Vec<String>,
}

impl RunReport {
    pub fn is_verified(&self) -> bool {
        matches!(self.outcome, RunOutcome::Verified(_))
    }

    pub fn last_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Created)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_verified() {
            0
        } else {
            1
        }
    }

    pub fn summary(&self) -> RunSummary<'_> {
        let failure = match &self.outcome {
            RunOutcome::Failed(failure) => Some(failure),
            RunOutcome::Verified(_) => None,
        };
        RunSummary {
            verified: self.is_verified(),
            states: &self.states,
            failed_stage: failure.map(|f| f.stage),
            error: failure.map(|f| f.cause.to_string()),
            vm: self.vm.as_ref(),
            cleaned_up: &self.cleaned_up,
        }
    }

    pub fn log_summary(&self) {
        let instance = self.vm.as_ref().map(VmHandle::name).unwrap_or("-");
        match &self.outcome {
            RunOutcome::Verified(Verification::DebugLog { contents }) => {
                info!(instance, "Workload generator started; debug log follows");
                info!("{}", contents.trim_end());
            }
            RunOutcome::Verified(Verification::LaunchAccepted) => {
                info!(
                    instance,
                    "Workload generator launch accepted; startup output is not observable on this platform"
                );
            }
            RunOutcome::Failed(failure) => {
                error!(
                    instance,
                    stage = %failure.stage,
                    last_state = %self.last_state(),
                    "Soak run failed: {}",
                    failure.cause
                );
            }
        }
        if let Some(vm) = &self.vm {
            info!(
                instance = %vm.name(),
                project = %vm.project,
                zone = %vm.zone,
                expires_at = %vm.expires_at.to_rfc3339(),
                "VM left running until its TTL"
            );
        }
    }
}

#[derive(Debug)]
struct Progress {
    states: Vec<RunState>,
    vm: Option<VmHandle>,
}

impl Progress {
    fn new() -> Self {
        Self {
            states: vec![RunState::Created],
            vm: None,
        }
    }

    fn current(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Created)
    }

    fn reach(&mut self, state: RunState) {
        info!(state = %state, "Run state reached");
        self.states.push(state);
    }
}

pub struct RunController<P, T> {
    config: RunConfig,
    plan: RunPlan,
    provisioner: P,
    executor: RemoteExecutor<T>,
    cleanup: CleanupStack,
}

impl<P: Provisioner, T: Transport> RunController<P, T> {
    pub fn new(
        config: RunConfig,
        plan: RunPlan,
        provisioner: P,
        executor: RemoteExecutor<T>,
        cleanup: CleanupStack,
    ) -> Self {
        Self {
            config,
            plan,
            provisioner,
            executor,
            cleanup,
        }
    }

    pub async fn run(mut self) -> RunReport {
        let deadline = self.config.timing.deadline;
        let mut progress = Progress::new();

        info!(
            instance = %self.config.instance_name,
            platform = %self.config.platform,
            image_family = %self.config.platform_id,
            rate = self.config.rate,
            record_size = self.config.record_size,
            deadline = %humantime::format_duration(deadline),
            "Starting soak run"
        );

        let result = tokio::time::timeout(deadline, self.drive(&mut progress)).await;

        let outcome = match result {
            Ok(Ok(verification)) => RunOutcome::Verified(verification),
            Ok(Err(failure)) => RunOutcome::Failed(failure),
            Err(_) => {
                let stage = progress.current().next().unwrap_or(RunState::Verified);
                warn!(stage = %stage, "Run deadline elapsed");
                RunOutcome::Failed(RunFailure::new(stage, FailureCause::Timeout { deadline }))
            }
        };

        let cleaned_up = self.cleanup.run_all();

        RunReport {
            states: progress.states,
            outcome,
            vm: progress.vm,
            cleaned_up,
        }
    }

    async fn drive(&self, progress: &mut Progress) -> Result<Verification, RunFailure> {
        let vm = self
            .provisioner
            .provision(&self.config)
            .await
            .map_err(|err| RunFailure::new(RunState::Provisioned, err))?;
        let host = vm.host.clone();
        progress.vm = Some(vm);
        progress.reach(RunState::Provisioned);

        self.step(&host, &self.plan.install_agent, RunState::AgentInstalled, progress)
            .await?;
        self.step(
            &host,
            &self.plan.install_interpreter,
            RunState::InterpreterReady,
            progress,
        )
        .await?;
        self.step(
            &host,
            &self.plan.upload_generator,
            RunState::ContentUploaded,
            progress,
        )
        .await?;

        let launcher = WorkloadLauncher::new(&self.executor);
        let receipt = launcher
            .launch(&host, &self.plan.workload)
            .await
            .map_err(|err| RunFailure::new(RunState::WorkloadLaunched, err))?;
        progress.reach(RunState::WorkloadLaunched);

        let verification = launcher
            .verify(&host, &receipt, self.config.timing.verify_grace)
            .await
            .map_err(|err| RunFailure::new(RunState::Verified, err))?;
        progress.reach(RunState::Verified);

        Ok(verification)
    }

    async fn step(
        &self,
        host: &RemoteHost,
        script: &RemoteScript,
        target: RunState,
        progress: &mut Progress,
    ) -> Result<(), RunFailure> {
        self.executor
            .execute(host, script)
            .await
            .map_err(|err| RunFailure::new(target, err))?;
        progress.reach(target);
        Ok(())
    }
}
