//! Remote script rendering.
//!
//! Each stage of a soak run is expressed as script text for the target
//! platform: bash for POSIX hosts, PowerShell for Windows hosts. Rendering is
//! pure; the same inputs always produce the same text. Values that cannot be
//! embedded safely in the target dialect are rejected, never escaped on a
//! best-effort basis.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agent_config::AgentConfig;
use crate::error::RenderError;
use crate::platform::PlatformClass;

pub const POSIX_AGENT_REPO_SCRIPT: &str =
    "https://dl.google.com/cloudagents/add-google-cloud-ops-agent-repo.sh";
pub const WINDOWS_AGENT_REPO_SCRIPT: &str =
    "https://dl.google.com/cloudagents/add-google-cloud-ops-agent-repo.ps1";
pub const AGENT_SERVICE: &str = "google-cloud-ops-agent";
pub const WINDOWS_PYTHON_INSTALLER: &str =
    "https://www.python.org/ftp/python/3.11.2/python-3.11.2.exe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    InstallAgentConfig,
    InstallInterpreter,
    UploadContent,
    StartWorkload,
    ReadDebugLog,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::InstallAgentConfig => "install-agent-config",
            Stage::InstallInterpreter => "install-interpreter",
            Stage::UploadContent => "upload-content",
            Stage::StartWorkload => "start-workload",
            Stage::ReadDebugLog => "read-debug-log",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the transport should treat a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    /// Wait for the script to finish and capture its output.
    Blocking,
    /// The script starts work that outlives the session; return as soon as
    /// the launching command has been accepted.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteScript {
    pub stage: Stage,
    pub platform: PlatformClass,
    pub mode: ExecMode,
    body: String,
}

impl RemoteScript {
    fn blocking(stage: Stage, platform: PlatformClass, body: String) -> Self {
        Self {
            stage,
            platform,
            mode: ExecMode::Blocking,
            body,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Parameters for the workload generator launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadParams {
    pub generator_path: String,
    pub log_path: String,
    pub debug_log_path: String,
    /// Records per second.
    pub rate: u64,
    /// Bytes per record.
    pub record_size: u64,
}

/// Quote a value as a double-quoted bash word.
///
/// Inside double quotes bash still interprets `$`, backquote, `\` and `"`,
/// so any value containing one of them is rejected.
pub fn posix_quote(parameter: &str, value: &str) -> Result<String, RenderError> {
    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '"' | '`' | '$' | '\\' | '\0' | '\r' | '\n'))
    {
        return Err(RenderError::unsafe_parameter(
            parameter,
            format!("contains {:?}, which cannot appear in a double-quoted shell word", c),
        ));
    }
    Ok(format!("\"{}\"", value))
}

/// Quote a value as a single-quoted PowerShell literal.
///
/// Embedded `'` is doubled. Double quotes are rejected because the values end
/// up inside Win32 command lines, which have no reliable escape for them.
pub fn powershell_quote(parameter: &str, value: &str) -> Result<String, RenderError> {
    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '"' | '\0' | '\r' | '\n'))
    {
        return Err(RenderError::unsafe_parameter(
            parameter,
            format!("contains {:?}, which cannot be embedded in a PowerShell command line", c),
        ));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

fn quote(platform: PlatformClass, parameter: &str, value: &str) -> Result<String, RenderError> {
    match platform {
        PlatformClass::Posix => posix_quote(parameter, value),
        PlatformClass::Windows => powershell_quote(parameter, value),
    }
}

/// Validate that `value` is an absolute path for the platform, then quote it.
pub fn quote_path(
    platform: PlatformClass,
    parameter: &str,
    value: &str,
) -> Result<String, RenderError> {
    let absolute = match platform {
        PlatformClass::Posix => value.starts_with('/'),
        PlatformClass::Windows => {
            let bytes = value.as_bytes();
            value.starts_with('/')
                || value.starts_with('\\')
                || (bytes.len() >= 3
                    && bytes[0].is_ascii_alphabetic()
                    && bytes[1] == b':'
                    && (bytes[2] == b'\\' || bytes[2] == b'/'))
        }
    };
    if !absolute {
        return Err(RenderError::unsafe_parameter(
            parameter,
            format!("'{}' is not an absolute path", value),
        ));
    }
    quote(platform, parameter, value)
}

/// Install the agent, place its configuration and restart it.
pub fn install_agent(
    platform: PlatformClass,
    config: &AgentConfig,
) -> Result<RemoteScript, RenderError> {
    let encoded = BASE64.encode(config.to_yaml()?);
    let config_path = quote_path(platform, "agent_config_path", platform.agent_config_path())?;

    let body = match platform {
        PlatformClass::Posix => format!(
            r#"set -e
curl -sSfO {repo_script}
sudo bash add-google-cloud-ops-agent-repo.sh --also-install
sudo mkdir -p "$(dirname {config_path})"
echo '{encoded}' | base64 --decode | sudo tee {config_path} > /dev/null
sudo systemctl restart {service}
"#,
            repo_script = POSIX_AGENT_REPO_SCRIPT,
            config_path = config_path,
            encoded = encoded,
            service = AGENT_SERVICE,
        ),
        PlatformClass::Windows => format!(
            r#"$ErrorActionPreference = 'Stop'
$installer = Join-Path $env:TEMP 'add-google-cloud-ops-agent-repo.ps1'
(New-Object Net.WebClient).DownloadFile('{repo_script}', $installer)
& $installer -AlsoInstall
$configPath = {config_path}
New-Item -ItemType Directory -Force -Path (Split-Path -Parent $configPath) | Out-Null
[IO.File]::WriteAllBytes($configPath, [Convert]::FromBase64String('{encoded}'))
Restart-Service {service} -Force
"#,
            repo_script = WINDOWS_AGENT_REPO_SCRIPT,
            config_path = config_path,
            encoded = encoded,
            service = AGENT_SERVICE,
        ),
    };

    Ok(RemoteScript::blocking(
        Stage::InstallAgentConfig,
        platform,
        body,
    ))
}

/// Install a Python interpreter for the workload generator.
pub fn install_interpreter(platform: PlatformClass) -> Result<RemoteScript, RenderError> {
    let body = match platform {
        // The package manager is detected on the host so distro knowledge stays
        // out of the orchestrator.
        PlatformClass::Posix => r#"set -e
if command -v apt-get > /dev/null 2>&1; then
  sudo apt-get update -y
  sudo DEBIAN_FRONTEND=noninteractive apt-get install -y python3
elif command -v dnf > /dev/null 2>&1; then
  sudo dnf install -y python3
elif command -v yum > /dev/null 2>&1; then
  sudo yum install -y python3
elif command -v zypper > /dev/null 2>&1; then
  sudo zypper --non-interactive install python3
else
  echo "no supported package manager found" >&2
  exit 1
fi
python3 --version
"#
        .to_string(),
        PlatformClass::Windows => format!(
            r#"$ErrorActionPreference = 'Stop'
$tempDir = '/tmp'
New-Item -ItemType Directory -Force -Path $tempDir | Out-Null
$pythonUrl = '{installer}'
$installerPath = Join-Path $tempDir ($pythonUrl -replace '.*/')
[Net.ServicePointManager]::SecurityProtocol = [Net.SecurityProtocolType]::Tls12
(New-Object System.Net.WebClient).DownloadFile($pythonUrl, $installerPath)
$pythonInstallDir = "$env:SystemDrive\Python"
Start-Process $installerPath -Wait -ArgumentList "/quiet TargetDir=$pythonInstallDir InstallAllUsers=1"
"#,
            installer = WINDOWS_PYTHON_INSTALLER,
        ),
    };

    Ok(RemoteScript::blocking(
        Stage::InstallInterpreter,
        platform,
        body,
    ))
}

/// Place `content` at `remote_path`.
///
/// The content travels base64 encoded, so it never needs quoting.
pub fn upload_content(
    platform: PlatformClass,
    remote_path: &str,
    content: &[u8],
) -> Result<RemoteScript, RenderError> {
    let path = quote_path(platform, "remote_path", remote_path)?;
    let encoded = BASE64.encode(content);

    let body = match platform {
        PlatformClass::Posix => format!(
            r#"set -e
sudo mkdir -p "$(dirname {path})"
echo '{encoded}' | base64 --decode | sudo tee {path} > /dev/null
sudo chmod 0644 {path}
"#
        ),
        PlatformClass::Windows => format!(
            r#"$ErrorActionPreference = 'Stop'
$target = {path}
$parent = Split-Path -Parent $target
if ($parent -and -not (Test-Path $parent)) {{
  New-Item -ItemType Directory -Force -Path $parent | Out-Null
}}
[IO.File]::WriteAllBytes($target, [Convert]::FromBase64String('{encoded}'))
"#
        ),
    };

    Ok(RemoteScript::blocking(Stage::UploadContent, platform, body))
}

/// Start the workload generator detached from the remote session.
///
/// On POSIX the process runs under `nohup` in the background with all output
/// going to the debug log. On Windows the process is created through WMI,
/// which gives no access to its output.
pub fn start_workload(
    platform: PlatformClass,
    params: &WorkloadParams,
) -> Result<RemoteScript, RenderError> {
    let generator = quote_path(platform, "generator_path", &params.generator_path)?;
    let log_path = quote_path(platform, "log_path", &params.log_path)?;

    let body = match platform {
        PlatformClass::Posix => {
            let debug_log = quote_path(platform, "debug_log_path", &params.debug_log_path)?;
            format!(
                r#"nohup python3 {generator} \
  --log-size-in-bytes="{size}" \
  --log-rate="{rate}" \
  --log-write-type=file \
  --file-path={log_path} \
  < /dev/null &> {debug_log} &
"#,
                generator = generator,
                size = params.record_size,
                rate = params.rate,
                log_path = log_path,
                debug_log = debug_log,
            )
        }
        PlatformClass::Windows => format!(
            r#"$python = "$env:SystemDrive\Python\python.exe"
$generator = {generator}
$logFile = {log_path}
$commandLine = "`"$python`" `"$generator`" --log-size-in-bytes={size} --log-rate={rate} --log-write-type=file --file-path=`"$logFile`""
$result = Invoke-WmiMethod -ComputerName . -Class Win32_Process -Name Create -ArgumentList $commandLine
if ($result.ReturnValue -ne 0) {{
  throw "Win32_Process.Create returned $($result.ReturnValue)"
}}
Write-Output $result.ProcessId
"#,
            generator = generator,
            log_path = log_path,
            size = params.record_size,
            rate = params.rate,
        ),
    };

    Ok(RemoteScript {
        stage: Stage::StartWorkload,
        platform,
        mode: ExecMode::Detached,
        body,
    })
}

/// Print the contents of the workload's debug log.
pub fn read_debug_log(platform: PlatformClass, path: &str) -> Result<RemoteScript, RenderError> {
    let quoted = quote_path(platform, "debug_log_path", path)?;
    let body = match platform {
        PlatformClass::Posix => format!("cat {}\n", quoted),
        PlatformClass::Windows => format!("Get-Content -Raw -Path {}\n", quoted),
    };
    Ok(RemoteScript::blocking(Stage::ReadDebugLog, platform, body))
}
