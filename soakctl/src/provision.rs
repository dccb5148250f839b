//! VM provisioning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remote_exec::{PlatformClass, RemoteHost};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::credentials::SshKeyStore;

const SSH_PORT: u16 = 22;

/// Longest a single readiness connect may take before it counts as a miss.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("could not obtain SSH credentials: {message}")]
    Credentials { message: String },

    #[error("failed to run gcloud: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("instance creation failed with status {status}: {stderr}")]
    Api { status: i32, stderr: String },

    #[error("unexpected response from instance creation: {message}")]
    MalformedResponse { message: String },

    #[error("instance {instance} did not accept SSH connections within {timeout:?}")]
    BootTimeout { instance: String, timeout: Duration },
}

/// A provisioned, running VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmHandle {
    pub host: RemoteHost,
    pub project: String,
    pub zone: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VmHandle {
    pub fn new(host: RemoteHost, config: &RunConfig) -> Self {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(config.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            host,
            project: config.project.clone(),
            zone: config.zone.clone(),
            created_at,
            expires_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.host.instance
    }

    pub fn platform(&self) -> PlatformClass {
        self.host.platform
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, config: &RunConfig) -> Result<VmHandle, ProvisionError>;
}

/// Everything sent with the single create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    pub boot_disk_size: String,
    pub image_family: String,
    pub image_project: String,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

impl InstanceRequest {
    pub fn new(config: &RunConfig, ssh_keys_entry: &str) -> Self {
        let labels = BTreeMap::from([("ttl".to_string(), config.ttl_minutes().to_string())]);

        let mut metadata = BTreeMap::from([
            // Keeps OS Config from running periodic tasks (including Windows
            // updates and reboots) that would disturb steady-state throughput.
            (
                "osconfig-disabled-features".to_string(),
                "tasks".to_string(),
            ),
            ("ssh-keys".to_string(), ssh_keys_entry.to_string()),
        ]);
        match config.platform {
            PlatformClass::Windows => {
                metadata.insert("enable-windows-ssh".to_string(), "TRUE".to_string());
            }
            PlatformClass::Posix => {}
        }

        Self {
            name: config.instance_name.clone(),
            project: config.project.clone(),
            zone: config.zone.clone(),
            machine_type: config.machine_type.clone(),
            boot_disk_size: config.boot_disk_size.clone(),
            image_family: config.platform_id.clone(),
            image_project: config.image_project.clone(),
            labels,
            metadata,
        }
    }

    pub fn gcloud_args(&self) -> Vec<String> {
        vec![
            "compute".to_string(),
            "instances".to_string(),
            "create".to_string(),
            self.name.clone(),
            format!("--project={}", self.project),
            format!("--zone={}", self.zone),
            format!("--machine-type={}", self.machine_type),
            format!("--image-family={}", self.image_family),
            format!("--image-project={}", self.image_project),
            format!("--boot-disk-size={}", self.boot_disk_size),
            format!("--labels={}", join_pairs(&self.labels, ",")),
            // "^;^" switches the list delimiter so values may contain commas
            format!("--metadata=^;^{}", join_pairs(&self.metadata, ";")),
            "--format=json".to_string(),
        ]
    }
}

fn join_pairs(pairs: &BTreeMap<String, String>, delimiter: &str) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(delimiter)
}

/// External IP of the first network interface in a create response.
pub fn parse_external_ip(response: &str) -> Result<String, ProvisionError> {
    let value: Value =
        serde_json::from_str(response).map_err(|err| ProvisionError::MalformedResponse {
            message: err.to_string(),
        })?;
    let instance = match &value {
        Value::Array(items) => items.first(),
        Value::Object(_) => Some(&value),
        _ => None,
    };

    instance
        .and_then(|i| i.pointer("/networkInterfaces/0/accessConfigs/0/natIP"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::MalformedResponse {
            message: "no external IP in response".to_string(),
        })
}

/// Creates instances with the `gcloud` CLI.
pub struct GcloudProvisioner {
    keys: Arc<SshKeyStore>,
    boot_timeout: Duration,
}

impl GcloudProvisioner {
    pub fn new(keys: Arc<SshKeyStore>, boot_timeout: Duration) -> Self {
        Self { keys, boot_timeout }
    }

}

/// Poll `address:port` until it accepts a TCP connection or `boot_timeout`
/// elapses. Each attempt is bounded so a silently dropped SYN cannot hold
/// the loop past its deadline.
pub async fn wait_for_port(
    instance: &str,
    address: &str,
    port: u16,
    boot_timeout: Duration,
) -> Result<(), ProvisionError> {
    let deadline = tokio::time::Instant::now() + boot_timeout;
    loop {
        match tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect((address, port)))
            .await
        {
            Ok(Ok(_)) => {
                info!(instance, address, port, "Instance is accepting connections");
                return Ok(());
            }
            Ok(Err(err)) => debug!(instance, port, error = %err, "Port not reachable yet"),
            Err(_) => debug!(instance, port, "Connect attempt timed out"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ProvisionError::BootTimeout {
                instance: instance.to_string(),
                timeout: boot_timeout,
            });
        }
        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
    }
}

#[async_trait]
impl Provisioner for GcloudProvisioner {
    async fn provision(&self, config: &RunConfig) -> Result<VmHandle, ProvisionError> {
        let key = self
            .keys
            .get()
            .await
            .map_err(|err| ProvisionError::Credentials {
                message: format!("{:#}", err),
            })?;
        let request = InstanceRequest::new(config, &key.metadata_entry());
        let args = request.gcloud_args();

        info!(
            instance = %request.name,
            zone = %request.zone,
            machine_type = %request.machine_type,
            image_family = %request.image_family,
            ttl_minutes = config.ttl_minutes(),
            "Creating instance"
        );
        debug!(args = ?args, "gcloud invocation");

        let output = Command::new("gcloud")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn { source })?;

        if !output.status.success() {
            return Err(ProvisionError::Api {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let address = parse_external_ip(&String::from_utf8_lossy(&output.stdout))?;
        wait_for_port(&request.name, &address, SSH_PORT, self.boot_timeout).await?;

        let host = RemoteHost {
            instance: request.name,
            address,
            platform: config.platform,
        };
        Ok(VmHandle::new(host, config))
    }
}
