//! Logging agent pipeline configuration.
//!
//! The configuration is built from typed structures and serialised with
//! `serde_yaml`, so receiver paths never become YAML syntax.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::RenderError;

pub const WORKLOAD_RECEIVER: &str = "mylog_source";
pub const DEBUG_RECEIVER: &str = "generator_debug_logs";
pub const EXPORTER: &str = "google";
pub const PIPELINE: &str = "my_pipeline";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub receivers: BTreeMap<String, ReceiverConfig>,
    pub exporters: BTreeMap<String, ExporterConfig>,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub include_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub pipelines: BTreeMap<String, PipelineConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub receivers: Vec<String>,
    pub exporters: Vec<String>,
}

impl AgentConfig {
    /// Pipeline tailing the workload log and the generator's own debug log,
    /// both shipped to Cloud Logging.
    pub fn soak_pipeline(workload_log: &str, debug_log: &str) -> Result<Self, RenderError> {
        validate_receiver_path("workload_log", workload_log)?;
        validate_receiver_path("debug_log", debug_log)?;

        let receivers = BTreeMap::from([
            (WORKLOAD_RECEIVER.to_string(), files_receiver(workload_log)),
            (DEBUG_RECEIVER.to_string(), files_receiver(debug_log)),
        ]);
        let exporters = BTreeMap::from([(
            EXPORTER.to_string(),
            ExporterConfig {
                kind: "google_cloud_logging".to_string(),
            },
        )]);
        let pipelines = BTreeMap::from([(
            PIPELINE.to_string(),
            PipelineConfig {
                receivers: vec![WORKLOAD_RECEIVER.to_string(), DEBUG_RECEIVER.to_string()],
                exporters: vec![EXPORTER.to_string()],
            },
        )]);

        Ok(Self {
            logging: LoggingConfig {
                receivers,
                exporters,
                service: ServiceConfig { pipelines },
            },
        })
    }

    pub fn to_yaml(&self) -> Result<String, RenderError> {
        serde_yaml::to_string(self).map_err(|err| RenderError::ConfigRender {
            message: err.to_string(),
        })
    }
}

fn files_receiver(path: &str) -> ReceiverConfig {
    ReceiverConfig {
        kind: "files".to_string(),
        include_paths: vec![path.to_string()],
    }
}

fn validate_receiver_path(name: &str, path: &str) -> Result<(), RenderError> {
    let reason = if path.is_empty() {
        Some("path is empty".to_string())
    } else if !(path.starts_with('/') || path.starts_with('\\') || path.get(1..2) == Some(":")) {
        Some(format!("'{}' is not absolute", path))
    } else if path.chars().any(char::is_control) {
        Some("path contains control characters".to_string())
    } else if path.contains('#') || path.contains(": ") {
        Some(format!("'{}' contains YAML structural characters", path))
    } else {
        None
    };

    match reason {
        Some(reason) => Err(RenderError::ConfigRender {
            message: format!("{}: {}", name, reason),
        }),
        None => Ok(()),
    }
}
