//! Run configuration.
//!
//! Parameters come from flags or their environment variables and are
//! validated once into an immutable [`RunConfig`]. Nothing here touches the
//! network.

use clap::Args;
use once_cell::sync::Lazy;
use regex::Regex;
use remote_exec::{ExecutorConfig, PlatformClass};
use std::time::Duration;
use thiserror::Error;

const MAX_INSTANCE_NAME_LEN: usize = 63;

/// Largest accepted TRANSPORT_RETRIES.
pub const MAX_TRANSPORT_RETRIES: u32 = 10;

static INSTANCE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").expect("instance name pattern is valid")
});

static SSH_USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("user pattern is valid"));

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required parameter {name}")]
    Missing { name: String },

    #[error("could not parse {name} duration {value:?}: {reason}")]
    InvalidDuration {
        name: String,
        value: String,
        reason: String,
    },

    #[error("{name} must be greater than zero")]
    NonPositive { name: String },

    #[error("invalid instance name {name:?}: must match [a-z]([-a-z0-9]*[a-z0-9])? and be at most 63 characters")]
    InvalidInstanceName { name: String },

    #[error("invalid SSH user {user:?}: must be a lowercase POSIX user name")]
    InvalidSshUser { user: String },

    #[error("no public image project is known for image family {family:?}; set IMAGE_PROJECT")]
    UnknownImageProject { family: String },

    #[error("TRANSPORT_RETRIES is {value}; at most {max} retries are allowed")]
    TooManyRetries { value: u32, max: u32 },

    #[error("per-call timeout {call_timeout:?} must be shorter than the run deadline {deadline:?}")]
    InconsistentTimeouts {
        call_timeout: Duration,
        deadline: Duration,
    },
}

/// Workload parameters shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct WorkloadArgs {
    /// Image family to run, e.g. "debian-11" or "windows-2019"
    #[arg(long, env = "DISTRO")]
    pub distro: String,

    /// Log entries per second written by the generator
    #[arg(long, env = "LOG_RATE")]
    pub log_rate: u64,

    /// Size of each log entry in bytes
    #[arg(long, env = "LOG_SIZE_IN_BYTES")]
    pub log_size_in_bytes: u64,
}

#[derive(Debug, Clone, Args)]
pub struct LaunchArgs {
    #[command(flatten)]
    pub workload: WorkloadArgs,

    /// How long to keep the VM alive, e.g. "24h30m"
    #[arg(long, env = "TTL")]
    pub ttl: String,

    /// Instance name; generated when omitted
    #[arg(long, env = "VM_NAME")]
    pub vm_name: Option<String>,

    /// Cloud project to create the VM in
    #[arg(long, env = "PROJECT")]
    pub project: Option<String>,

    /// Zone to create the VM in
    #[arg(long, env = "ZONE")]
    pub zone: Option<String>,

    /// Comma-separated candidate zones; the first is used when ZONE is unset
    #[arg(long, env = "ZONES")]
    pub zones: Option<String>,

    #[arg(long, env = "MACHINE_TYPE", default_value = "e2-standard-16")]
    pub machine_type: String,

    #[arg(long, env = "BOOT_DISK_SIZE", default_value = "4000GB")]
    pub boot_disk_size: String,

    /// Image project; derived from the image family when omitted
    #[arg(long, env = "IMAGE_PROJECT")]
    pub image_project: Option<String>,

    /// Deadline for the whole launch, from provisioning to verification
    #[arg(long, env = "RUN_DEADLINE", default_value = "60m")]
    pub run_deadline: String,

    /// Timeout for a single remote call
    #[arg(long, env = "CALL_TIMEOUT", default_value = "20m")]
    pub call_timeout: String,

    /// Wait between launching the generator and reading its debug log
    #[arg(long, env = "VERIFY_GRACE", default_value = "5s")]
    pub verify_grace: String,

    /// Retries allowed for a remote call that failed to connect
    #[arg(long, env = "TRANSPORT_RETRIES", default_value_t = 3)]
    pub transport_retries: u32,

    /// How long to wait for the VM to accept SSH connections after creation
    #[arg(long, env = "BOOT_TIMEOUT", default_value = "10m")]
    pub boot_timeout: String,

    #[arg(long, env = "SSH_USER", default_value = "soak")]
    pub ssh_user: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub deadline: Duration,
    pub call_timeout: Duration,
    pub verify_grace: Duration,
    pub boot_timeout: Duration,
    pub transport_retries: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub platform_id: String,
    pub platform: PlatformClass,
    pub instance_name: String,
    pub rate: u64,
    pub record_size: u64,
    pub ttl: Duration,
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    pub boot_disk_size: String,
    pub image_project: String,
    pub ssh_user: String,
    pub timing: Timing,
}

impl RunConfig {
    pub fn ttl_minutes(&self) -> u64 {
        ttl_label_minutes(self.ttl)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            call_timeout: self.timing.call_timeout,
            max_transport_retries: self.timing.transport_retries,
            retry_backoff: self.timing.retry_backoff,
        }
    }
}

impl WorkloadArgs {
    pub fn validate(&self) -> Result<PlatformClass, ConfigError> {
        if self.distro.trim().is_empty() {
            return Err(ConfigError::Missing {
                name: "DISTRO".to_string(),
            });
        }
        if self.log_rate == 0 {
            return Err(ConfigError::NonPositive {
                name: "LOG_RATE".to_string(),
            });
        }
        if self.log_size_in_bytes == 0 {
            return Err(ConfigError::NonPositive {
                name: "LOG_SIZE_IN_BYTES".to_string(),
            });
        }
        Ok(PlatformClass::classify(&self.distro))
    }
}

impl LaunchArgs {
    pub fn into_run_config(self) -> Result<RunConfig, ConfigError> {
        let platform = self.workload.validate()?;
        let distro = self.workload.distro.trim().to_string();

        let ttl = parse_positive_duration("TTL", &self.ttl)?;
        let deadline = parse_positive_duration("RUN_DEADLINE", &self.run_deadline)?;
        let call_timeout = parse_positive_duration("CALL_TIMEOUT", &self.call_timeout)?;
        let verify_grace = parse_duration("VERIFY_GRACE", &self.verify_grace)?;
        let boot_timeout = parse_positive_duration("BOOT_TIMEOUT", &self.boot_timeout)?;
        if call_timeout >= deadline {
            return Err(ConfigError::InconsistentTimeouts {
                call_timeout,
                deadline,
            });
        }

        if self.transport_retries > MAX_TRANSPORT_RETRIES {
            return Err(ConfigError::TooManyRetries {
                value: self.transport_retries,
                max: MAX_TRANSPORT_RETRIES,
            });
        }

        let project = non_empty(self.project).ok_or_else(|| ConfigError::Missing {
            name: "PROJECT".to_string(),
        })?;
        let zone = resolve_zone(self.zone, self.zones.as_deref())?;

        let image_project = match non_empty(self.image_project) {
            Some(project) => project,
            None => remote_exec::platform::image_project_for(&distro)
                .map(str::to_string)
                .ok_or_else(|| ConfigError::UnknownImageProject {
                    family: distro.clone(),
                })?,
        };

        let instance_name = match non_empty(self.vm_name) {
            Some(name) => validate_instance_name(&name)?,
            None => generate_instance_name(&distro),
        };

        if !SSH_USER.is_match(&self.ssh_user) {
            return Err(ConfigError::InvalidSshUser {
                user: self.ssh_user,
            });
        }

        Ok(RunConfig {
            platform_id: distro,
            platform,
            instance_name,
            rate: self.workload.log_rate,
            record_size: self.workload.log_size_in_bytes,
            ttl,
            project,
            zone,
            machine_type: self.machine_type,
            boot_disk_size: self.boot_disk_size,
            image_project,
            ssh_user: self.ssh_user,
            timing: Timing {
                deadline,
                call_timeout,
                verify_grace,
                boot_timeout,
                transport_retries: self.transport_retries,
                retry_backoff: Duration::from_secs(5),
            },
        })
    }
}

/// TTL label value: whole minutes, rounded down.
pub fn ttl_label_minutes(ttl: Duration) -> u64 {
    ttl.as_secs() / 60
}

pub fn parse_duration(name: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|err| ConfigError::InvalidDuration {
        name: name.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}

pub fn parse_positive_duration(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let duration = parse_duration(name, value)?;
    if duration.is_zero() {
        return Err(ConfigError::NonPositive {
            name: name.to_string(),
        });
    }
    Ok(duration)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve_zone(zone: Option<String>, zones: Option<&str>) -> Result<String, ConfigError> {
    if let Some(zone) = non_empty(zone) {
        return Ok(zone);
    }
    zones
        .and_then(|list| {
            list.split(',')
                .map(str::trim)
                .find(|candidate| !candidate.is_empty())
        })
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Missing {
            name: "ZONE".to_string(),
        })
}

fn validate_instance_name(name: &str) -> Result<String, ConfigError> {
    if name.len() > MAX_INSTANCE_NAME_LEN || !INSTANCE_NAME.is_match(name) {
        return Err(ConfigError::InvalidInstanceName {
            name: name.to_string(),
        });
    }
    Ok(name.to_string())
}

/// `soak-<family>-<8 hex>`, squeezed into the instance name rules.
pub fn generate_instance_name(family: &str) -> String {
    let slug: String = family
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let suffix = &suffix[..8];

    // "soak-" + slug + "-" + suffix
    let max_slug = MAX_INSTANCE_NAME_LEN - 5 - 1 - suffix.len();
    let slug = slug[..slug.len().min(max_slug)].trim_end_matches('-');

    if slug.is_empty() {
        format!("soak-{}", suffix)
    } else {
        format!("soak-{}-{}", slug, suffix)
    }
}

#[cfg(test)]
pub(crate) fn sample_launch_args() -> LaunchArgs {
    LaunchArgs {
        workload: WorkloadArgs {
            distro: "debian-11".to_string(),
            log_rate: 500,
            log_size_in_bytes: 2000,
        },
        ttl: "30m".to_string(),
        vm_name: None,
        project: Some("soak-project".to_string()),
        zone: None,
        zones: Some("us-central1-b,us-central1-c".to_string()),
        machine_type: "e2-standard-16".to_string(),
        boot_disk_size: "4000GB".to_string(),
        image_project: None,
        run_deadline: "60m".to_string(),
        call_timeout: "20m".to_string(),
        verify_grace: "5s".to_string(),
        transport_retries: 3,
        boot_timeout: "10m".to_string(),
        ssh_user: "soak".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_whole_minutes_when_ttl_label_then_exact() {
        let ttl = parse_positive_duration("TTL", "100m").unwrap();
        assert_eq!(ttl_label_minutes(ttl), 100);
    }

    #[test]
    fn given_partial_minute_when_ttl_label_then_rounds_down() {
        let ttl = parse_positive_duration("TTL", "90m30s").unwrap();
        assert_eq!(ttl_label_minutes(ttl), 90);

        let ttl = parse_positive_duration("TTL", "24h30m").unwrap();
        assert_eq!(ttl_label_minutes(ttl), 24 * 60 + 30);
    }

    #[test]
    fn given_malformed_ttl_when_into_run_config_then_invalid_duration() {
        let mut args = sample_launch_args();
        args.ttl = "forever".to_string();

        let err = args.into_run_config().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { ref name, .. } if name == "TTL"));
    }

    #[test]
    fn given_zero_ttl_when_into_run_config_then_non_positive() {
        let mut args = sample_launch_args();
        args.ttl = "0s".to_string();

        assert_eq!(
            args.into_run_config().unwrap_err(),
            ConfigError::NonPositive {
                name: "TTL".to_string()
            }
        );
    }

    #[test]
    fn given_valid_args_when_into_run_config_then_resolves_defaults() {
        let config = sample_launch_args().into_run_config().unwrap();

        assert_eq!(config.platform, PlatformClass::Posix);
        assert_eq!(config.zone, "us-central1-b");
        assert_eq!(config.image_project, "debian-cloud");
        assert_eq!(config.ttl_minutes(), 30);
        assert!(config.instance_name.starts_with("soak-debian-11-"));
        assert_eq!(config.timing.deadline, Duration::from_secs(3600));
    }

    #[test]
    fn given_missing_project_when_into_run_config_then_missing() {
        let mut args = sample_launch_args();
        args.project = Some("  ".to_string());

        assert_eq!(
            args.into_run_config().unwrap_err(),
            ConfigError::Missing {
                name: "PROJECT".to_string()
            }
        );
    }

    #[test]
    fn given_no_zone_when_into_run_config_then_missing_zone() {
        let mut args = sample_launch_args();
        args.zones = Some(" , ".to_string());

        assert_eq!(
            args.into_run_config().unwrap_err(),
            ConfigError::Missing {
                name: "ZONE".to_string()
            }
        );
    }

    #[test]
    fn given_call_timeout_not_below_deadline_when_into_run_config_then_rejected() {
        let mut args = sample_launch_args();
        args.call_timeout = "60m".to_string();

        assert!(matches!(
            args.into_run_config().unwrap_err(),
            ConfigError::InconsistentTimeouts { .. }
        ));
    }

    #[test]
    fn given_retries_above_cap_when_into_run_config_then_rejected() {
        let mut args = sample_launch_args();
        args.transport_retries = u32::MAX;
        assert_eq!(
            args.into_run_config().unwrap_err(),
            ConfigError::TooManyRetries {
                value: u32::MAX,
                max: MAX_TRANSPORT_RETRIES
            }
        );

        let mut args = sample_launch_args();
        args.transport_retries = MAX_TRANSPORT_RETRIES;
        let config = args.into_run_config().unwrap();
        assert_eq!(config.timing.transport_retries, MAX_TRANSPORT_RETRIES);
    }

    #[test]
    fn given_explicit_name_when_into_run_config_then_validated() {
        let mut args = sample_launch_args();
        args.vm_name = Some("Bad_Name".to_string());
        assert!(matches!(
            args.into_run_config().unwrap_err(),
            ConfigError::InvalidInstanceName { .. }
        ));

        let mut args = sample_launch_args();
        args.vm_name = Some("my-soak-vm".to_string());
        assert_eq!(args.into_run_config().unwrap().instance_name, "my-soak-vm");
    }

    #[test]
    fn given_custom_family_without_image_project_when_into_run_config_then_unknown() {
        let mut args = sample_launch_args();
        args.workload.distro = "my-custom-image".to_string();
        assert!(matches!(
            args.into_run_config().unwrap_err(),
            ConfigError::UnknownImageProject { .. }
        ));

        let mut args = sample_launch_args();
        args.workload.distro = "my-custom-image".to_string();
        args.image_project = Some("my-images".to_string());
        assert_eq!(args.into_run_config().unwrap().image_project, "my-images");
    }

    #[test]
    fn given_zero_rate_when_validate_then_non_positive() {
        let mut args = sample_launch_args();
        args.workload.log_rate = 0;
        assert_eq!(
            args.workload.validate().unwrap_err(),
            ConfigError::NonPositive {
                name: "LOG_RATE".to_string()
            }
        );
    }

    #[test]
    fn given_long_family_when_generate_instance_name_then_fits_rules() {
        let name = generate_instance_name("SQL_2019-Web-Windows-2022-with-a-very-long-suffix-indeed");
        assert!(name.len() <= MAX_INSTANCE_NAME_LEN, "{name}");
        assert!(INSTANCE_NAME.is_match(&name), "{name}");
    }
}
