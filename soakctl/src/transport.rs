//! SSH transport for remote scripts.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use remote_exec::{
    ExecMode, PlatformClass, RawOutput, RemoteHost, RemoteScript, Transport, TransportError,
};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::credentials::SshKeyStore;

/// Exit status ssh itself uses for connection and authentication failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Command lines run through `cmd.exe` on Windows hosts may not exceed this.
pub const WINDOWS_COMMAND_LINE_LIMIT: usize = 8191;

/// Reads the whole script from stdin and runs it as one script block, so
/// multi-line statements parse the same way they would from a file.
const WINDOWS_STDIN_BOOTSTRAP: &str =
    "$script = [Console]::In.ReadToEnd(); & ([ScriptBlock]::Create($script))";

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "BatchMode=yes",
    "-o",
    "ConnectTimeout=30",
    "-o",
    "ServerAliveInterval=30",
    "-o",
    "ServerAliveCountMax=4",
];

/// Runs scripts with the system `ssh` client, authenticating with the
/// run's ephemeral key.
pub struct SshTransport {
    keys: Arc<SshKeyStore>,
}

impl SshTransport {
    pub fn new(keys: Arc<SshKeyStore>) -> Self {
        Self { keys }
    }
}

/// Remote command line and stdin payload for a script.
///
/// The script body always travels on stdin; the command line only carries a
/// fixed interpreter invocation and stays short whatever the script size.
pub fn remote_invocation(script: &RemoteScript) -> (String, Vec<u8>) {
    let command = match script.platform {
        PlatformClass::Posix => "bash -s".to_string(),
        PlatformClass::Windows => format!(
            "powershell -NonInteractive -NoProfile -EncodedCommand {}",
            encode_powershell(WINDOWS_STDIN_BOOTSTRAP)
        ),
    };
    (command, script.body().as_bytes().to_vec())
}

/// Base64 of the UTF-16LE script text, as `-EncodedCommand` expects.
pub fn encode_powershell(body: &str) -> String {
    let bytes: Vec<u8> = body.encode_utf16().flat_map(u16::to_le_bytes).collect();
    BASE64.encode(bytes)
}

#[async_trait]
impl Transport for SshTransport {
    async fn run(
        &self,
        host: &RemoteHost,
        script: &RemoteScript,
    ) -> Result<RawOutput, TransportError> {
        let key = self
            .keys
            .get()
            .await
            .map_err(|err| TransportError::new(format!("{:#}", err)))?;
        let (remote_command, stdin) = remote_invocation(script);

        if script.mode == ExecMode::Detached {
            debug!(instance = %host.instance, stage = %script.stage, "Launching detached work");
        }

        let mut child = Command::new("ssh")
            .args(SSH_OPTIONS)
            .arg("-i")
            .arg(&key.private_key)
            .arg(format!("{}@{}", key.user, host.address))
            .arg(remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TransportError::new(format!("failed to spawn ssh: {}", err)))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(&stdin)
                .await
                .map_err(|err| TransportError::new(format!("failed to send script: {}", err)))?;
            // Closing stdin ends the remote interpreter's input.
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| TransportError::new(format!("ssh did not complete: {}", err)))?;

        ssh_outcome(
            &host.address,
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        )
    }
}

/// Split ssh's own failures from the script's exit status.
///
/// Status 255 and termination by a signal (`None`) mean the connection
/// failed; any other status is what the remote script returned.
pub fn ssh_outcome(
    address: &str,
    status: Option<i32>,
    stdout: String,
    stderr: String,
) -> Result<RawOutput, TransportError> {
    match status {
        Some(SSH_FAILURE_STATUS) => Err(TransportError::new(format!(
            "ssh to {} failed with status {}: {}",
            address,
            SSH_FAILURE_STATUS,
            stderr.trim()
        ))),
        None => Err(TransportError::new(format!(
            "ssh to {} was terminated by a signal: {}",
            address,
            stderr.trim()
        ))),
        Some(status) => Ok(RawOutput {
            status,
            stdout,
            stderr,
        }),
    }
}
