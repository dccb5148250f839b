//! Remote execution.
//!
//! [`RemoteExecutor`] is the only way scripts reach a VM. It applies the
//! per-call timeout and retries transport failures; the actual connection is
//! provided by a [`Transport`] implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::platform::PlatformClass;
use crate::script::{ExecMode, RemoteScript, Stage};

/// Address of a provisioned VM as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    pub instance: String,
    pub address: String,
    pub platform: PlatformClass,
}

/// Output of one transport invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// The script never reached the host, or the connection dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `script` on `host`.
    ///
    /// A non-zero exit status of the script is reported through
    /// [`RawOutput::status`], not as an error.
    async fn run(&self, host: &RemoteHost, script: &RemoteScript)
        -> Result<RawOutput, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn run(
        &self,
        host: &RemoteHost,
        script: &RemoteScript,
    ) -> Result<RawOutput, TransportError> {
        (**self).run(host, script).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stage: Stage,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub call_timeout: Duration,
    /// Extra attempts allowed after a transport failure (0 = run once).
    pub max_transport_retries: u32,
    pub retry_backoff: Duration,
}

/// Upper bound on the wait between two transport attempts.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

impl ExecutorConfig {
    /// Wait before the attempt following failed attempt `attempt` (1-based):
    /// `retry_backoff * 2^(attempt - 1)`, capped at [`MAX_RETRY_BACKOFF`].
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor)
            .min(MAX_RETRY_BACKOFF)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(20 * 60),
            max_transport_retries: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

pub struct RemoteExecutor<T> {
    transport: T,
    config: ExecutorConfig,
}

impl<T: Transport> RemoteExecutor<T> {
    pub fn new(transport: T, config: ExecutorConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run `script` on `host`.
    ///
    /// Only transport failures are retried. A script that exits non-zero or
    /// runs past the call timeout may have changed the host, so it is
    /// surfaced immediately.
    pub async fn execute(
        &self,
        host: &RemoteHost,
        script: &RemoteScript,
    ) -> Result<ExecutionResult, ExecutionError> {
        let stage = script.stage;
        let max_attempts = self.config.max_transport_retries.saturating_add(1);

        debug!(
            instance = %host.instance,
            stage = %stage,
            mode = ?script.mode,
            "Rendered script:\n{}",
            script.body()
        );

        for attempt in 1..=max_attempts {
            let call = self.transport.run(host, script);
            let outcome = match tokio::time::timeout(self.config.call_timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(ExecutionError::TimedOut {
                        stage,
                        timeout: self.config.call_timeout,
                    })
                }
            };

            match outcome {
                Ok(output) if output.status == 0 => {
                    info!(
                        instance = %host.instance,
                        stage = %stage,
                        attempt,
                        "Remote step succeeded"
                    );
                    debug!(stage = %stage, stdout = %output.stdout, stderr = %output.stderr);
                    return Ok(ExecutionResult {
                        stage,
                        status: output.status,
                        stdout: output.stdout,
                        stderr: output.stderr,
                        attempts: attempt,
                    });
                }
                Ok(output) => {
                    return Err(ExecutionError::RemoteCommand {
                        stage,
                        status: output.status,
                        stdout: output.stdout,
                        stderr: output.stderr,
                    });
                }
                Err(err) if attempt < max_attempts => {
                    let backoff = self.config.backoff_for(attempt);
                    warn!(
                        instance = %host.instance,
                        stage = %stage,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transport failure, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(ExecutionError::Transport {
                        stage,
                        attempts: attempt,
                        message: err.message,
                    });
                }
            }
        }

        unreachable!("execute loop always returns on its final attempt")
    }
}

/// Scripted reply for [`SimulatedTransport`].
#[derive(Debug, Clone)]
pub enum SimulatedReply {
    Output(RawOutput),
    TransportFailure(String),
    /// Reply with the output after the given delay.
    Delayed(Duration, RawOutput),
    /// Never reply.
    Hang,
}

/// A call observed by [`SimulatedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub instance: String,
    pub stage: Stage,
    pub mode: ExecMode,
    pub body: String,
}

/// Deterministic transport used in tests where reaching a VM is undesirable.
///
/// Replies are queued per stage; a stage with no queued reply succeeds with
/// empty output. Clones share their script and call log.
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    replies: Arc<Mutex<HashMap<Stage, VecDeque<SimulatedReply>>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, stage: Stage, reply: SimulatedReply) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.entry(stage).or_default().push_back(reply);
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.calls().into_iter().map(|call| call.stage).collect()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn run(
        &self,
        host: &RemoteHost,
        script: &RemoteScript,
    ) -> Result<RawOutput, TransportError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                instance: host.instance.clone(),
                stage: script.stage,
                mode: script.mode,
                body: script.body().to_string(),
            });
        }

        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.get_mut(&script.stage)?.pop_front());

        match reply {
            None => Ok(RawOutput::default()),
            Some(SimulatedReply::Output(output)) => Ok(output),
            Some(SimulatedReply::TransportFailure(message)) => Err(TransportError::new(message)),
            Some(SimulatedReply::Delayed(delay, output)) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
            Some(SimulatedReply::Hang) => {
                std::future::pending::<()>().await;
                Ok(RawOutput::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script;

    fn host() -> RemoteHost {
        RemoteHost {
            instance: "soak-debian-11-test".to_string(),
            address: "10.0.0.2".to_string(),
            platform: PlatformClass::Posix,
        }
    }

    fn config(retries: u32) -> ExecutorConfig {
        ExecutorConfig {
            call_timeout: Duration::from_secs(30),
            max_transport_retries: retries,
            retry_backoff: Duration::from_millis(10),
        }
    }

    fn read_script() -> RemoteScript {
        script::read_debug_log(PlatformClass::Posix, "/tmp/log_generator.log").unwrap()
    }

    #[tokio::test]
    async fn given_successful_script_when_execute_then_returns_output() {
        let transport = SimulatedTransport::new().reply(
            Stage::ReadDebugLog,
            SimulatedReply::Output(RawOutput::success("started")),
        );
        let executor = RemoteExecutor::new(transport.clone(), config(0));

        let result = executor.execute(&host(), &read_script()).await.unwrap();

        assert_eq!(result.stdout, "started");
        assert_eq!(result.attempts, 1);
        assert_eq!(transport.stages(), vec![Stage::ReadDebugLog]);
    }

    #[tokio::test(start_paused = true)]
    async fn given_transport_failures_when_execute_then_retries_within_budget() {
        let transport = SimulatedTransport::new()
            .reply(
                Stage::ReadDebugLog,
                SimulatedReply::TransportFailure("connection refused".into()),
            )
            .reply(
                Stage::ReadDebugLog,
                SimulatedReply::TransportFailure("connection reset".into()),
            )
            .reply(
                Stage::ReadDebugLog,
                SimulatedReply::Output(RawOutput::success("ok")),
            );
        let executor = RemoteExecutor::new(transport.clone(), config(2));

        let result = executor.execute(&host(), &read_script()).await.unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn given_persistent_transport_failure_when_execute_then_transport_error() {
        let mut transport = SimulatedTransport::new();
        for _ in 0..3 {
            transport = transport.reply(
                Stage::ReadDebugLog,
                SimulatedReply::TransportFailure("permission denied (publickey)".into()),
            );
        }
        let executor = RemoteExecutor::new(transport.clone(), config(2));

        let err = executor.execute(&host(), &read_script()).await.unwrap_err();

        assert!(err.is_transport());
        assert!(matches!(err, ExecutionError::Transport { attempts: 3, .. }));
        assert_eq!(transport.calls().len(), 3);
    }

    #[test]
    fn given_many_failed_attempts_when_backoff_for_then_doubles_up_to_cap() {
        let config = ExecutorConfig {
            retry_backoff: Duration::from_secs(5),
            ..ExecutorConfig::default()
        };

        assert_eq!(config.backoff_for(1), Duration::from_secs(5));
        assert_eq!(config.backoff_for(2), Duration::from_secs(10));
        assert_eq!(config.backoff_for(4), Duration::from_secs(40));
        assert_eq!(config.backoff_for(5), MAX_RETRY_BACKOFF);
        assert_eq!(config.backoff_for(33), MAX_RETRY_BACKOFF);
        assert_eq!(config.backoff_for(u32::MAX), MAX_RETRY_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn given_retry_budget_past_exponent_range_when_execute_then_no_overflow() {
        let mut transport = SimulatedTransport::new();
        for _ in 0..40 {
            transport = transport.reply(
                Stage::ReadDebugLog,
                SimulatedReply::TransportFailure("connection timed out".into()),
            );
        }
        transport = transport.reply(
            Stage::ReadDebugLog,
            SimulatedReply::Output(RawOutput::success("ok")),
        );
        let executor = RemoteExecutor::new(transport.clone(), config(40));

        let result = executor.execute(&host(), &read_script()).await.unwrap();

        assert_eq!(result.attempts, 41);
        assert_eq!(transport.calls().len(), 41);
    }

    #[tokio::test(start_paused = true)]
    async fn given_unbounded_retry_budget_when_execute_then_attempt_count_saturates() {
        let transport = SimulatedTransport::new()
            .reply(
                Stage::ReadDebugLog,
                SimulatedReply::TransportFailure("connection reset".into()),
            )
            .reply(
                Stage::ReadDebugLog,
                SimulatedReply::Output(RawOutput::success("ok")),
            );
        let executor = RemoteExecutor::new(transport.clone(), config(u32::MAX));

        let result = executor.execute(&host(), &read_script()).await.unwrap();

        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn given_non_zero_exit_when_execute_then_remote_command_error_without_retry() {
        let transport = SimulatedTransport::new().reply(
            Stage::ReadDebugLog,
            SimulatedReply::Output(RawOutput::failure(1, "cat: No such file or directory")),
        );
        let executor = RemoteExecutor::new(transport.clone(), config(3));

        let err = executor.execute(&host(), &read_script()).await.unwrap_err();

        match err {
            ExecutionError::RemoteCommand { status, stderr, .. } => {
                assert_eq!(status, 1);
                assert_eq!(stderr, "cat: No such file or directory");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn given_hanging_call_when_execute_then_timed_out_without_retry() {
        let transport =
            SimulatedTransport::new().reply(Stage::ReadDebugLog, SimulatedReply::Hang);
        let executor = RemoteExecutor::new(transport.clone(), config(3));

        let err = executor.execute(&host(), &read_script()).await.unwrap_err();

        assert!(matches!(err, ExecutionError::TimedOut { stage: Stage::ReadDebugLog, .. }));
        assert_eq!(transport.calls().len(), 1);
    }
}
