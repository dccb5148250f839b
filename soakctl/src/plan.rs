//! The scripts a run will execute, rendered ahead of time.
//!
//! Every script is rendered before the VM exists, so a value that cannot be
//! embedded safely fails the run without any remote side effect.

use remote_exec::{script, AgentConfig, PlatformClass, RemoteScript, RenderError, WorkloadParams};
use std::fmt::Write;

use crate::config::RunConfig;

pub const WORKLOAD_LOG_PATH: &str = "/tmp/tail_file";
pub const GENERATOR_PATH: &str = "/log_generator.py";
pub const DEBUG_LOG_PATH: &str = "/tmp/log_generator.log";

pub const LOG_GENERATOR_SOURCE: &str = include_str!("../assets/log_generator.py");

#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub platform: PlatformClass,
    pub agent_config: AgentConfig,
    pub install_agent: RemoteScript,
    pub install_interpreter: RemoteScript,
    pub upload_generator: RemoteScript,
    pub workload: WorkloadParams,
    pub start_workload: RemoteScript,
}

impl RunPlan {
    pub fn build(platform: PlatformClass, rate: u64, record_size: u64) -> Result<Self, RenderError> {
        let agent_config = AgentConfig::soak_pipeline(WORKLOAD_LOG_PATH, DEBUG_LOG_PATH)?;
        let workload = WorkloadParams {
            generator_path: GENERATOR_PATH.to_string(),
            log_path: WORKLOAD_LOG_PATH.to_string(),
            debug_log_path: DEBUG_LOG_PATH.to_string(),
            rate,
            record_size,
        };

        Ok(Self {
            platform,
            install_agent: script::install_agent(platform, &agent_config)?,
            install_interpreter: script::install_interpreter(platform)?,
            upload_generator: script::upload_content(
                platform,
                GENERATOR_PATH,
                LOG_GENERATOR_SOURCE.as_bytes(),
            )?,
            start_workload: script::start_workload(platform, &workload)?,
            agent_config,
            workload,
        })
    }

    pub fn for_config(config: &RunConfig) -> Result<Self, RenderError> {
        Self::build(config.platform, config.rate, config.record_size)
    }

    /// Human-readable dump of the agent config and every stage script.
    pub fn render_text(&self) -> Result<String, RenderError> {
        let mut out = String::new();
        let _ = writeln!(out, "# platform: {}", self.platform);
        let _ = writeln!(out, "# agent config ({})", self.platform.agent_config_path());
        out.push_str(&self.agent_config.to_yaml()?);

        for script in [
            &self.install_agent,
            &self.install_interpreter,
            &self.upload_generator,
            &self.start_workload,
        ] {
            let _ = writeln!(out, "\n# stage: {} ({:?})", script.stage, script.mode);
            out.push_str(script.body());
        }
        Ok(out)
    }
}
