//! Errors raised while rendering, executing and launching remote scripts.

use std::time::Duration;
use thiserror::Error;

use crate::script::Stage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("unsafe value for parameter '{parameter}': {reason}")]
    UnsafeParameter { parameter: String, reason: String },

    #[error("agent config could not be rendered: {message}")]
    ConfigRender { message: String },
}

impl RenderError {
    pub(crate) fn unsafe_parameter(parameter: &str, reason: impl Into<String>) -> Self {
        RenderError::UnsafeParameter {
            parameter: parameter.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Connection or authentication failure; the script may not have run.
    #[error("transport failure during {stage} after {attempts} attempt(s): {message}")]
    Transport {
        stage: Stage,
        attempts: u32,
        message: String,
    },

    /// The script ran and exited non-zero.
    #[error("{stage} exited with status {status}: {stderr}")]
    RemoteCommand {
        stage: Stage,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("{stage} did not finish within {timeout:?}")]
    TimedOut { stage: Stage, timeout: Duration },
}

impl ExecutionError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ExecutionError::Transport { .. })
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("workload debug log {path} is empty after startup grace period")]
    EmptyDebugLog { path: String },
}
