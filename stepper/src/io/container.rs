//! Container runtime abstraction for running the agent.
//!
//! The [`ContainerRuntime`] trait decouples step orchestration from the actual
//! engine (currently the `docker` CLI). Tests use scripted runtimes that mimic
//! an agent without spawning containers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::log_metrics::classify_logs;
use crate::core::types::StepId;
use crate::error::{Result, StepError};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Environment variable carrying the project id into the container.
pub const ENV_PROJECT_ID: &str = "STEPPER_PROJECT_ID";
/// Environment variable carrying the step id into the container.
pub const ENV_STEP_ID: &str = "STEPPER_STEP_ID";
/// Environment variable marking the run as a step (`1`).
pub const ENV_STEP_MODE: &str = "STEPPER_STEP_MODE";
/// Environment variable naming the in-container database path.
pub const ENV_DATABASE: &str = "STEPPER_DATABASE";

/// Docker's own exit status for daemon, image or start failures.
const DOCKER_LAUNCH_FAILURE: i32 = 125;
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_OUTPUT_LIMIT: usize = 4096;

/// Launch contract for one agent container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    /// Command override; empty runs the image's default entrypoint.
    pub command: Vec<String>,
    /// Host path of the isolated worktree.
    pub worktree_path: PathBuf,
    /// Host path of the isolated database copy.
    pub database_path: PathBuf,
    /// In-container working directory the worktree is mounted at.
    pub workdir_mount: String,
    /// In-container path the database copy is mounted at.
    pub database_mount: String,
    pub project_id: String,
    pub step_id: StepId,
    /// Extra environment variables, applied after the built-in ones.
    pub env: BTreeMap<String, String>,
    /// Wall-clock bound; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub log_limit_bytes: usize,
    /// Mirror container output to this file while it runs.
    pub log_path: Option<PathBuf>,
}

/// Metrics collected for one container run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerMetrics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Total bytes the container logged, including bytes beyond the capture limit.
    pub log_bytes: u64,
    pub log_lines: u64,
    pub error_lines: u64,
    pub warning_lines: u64,
}

impl ContainerMetrics {
    /// Fill the log-derived fields from captured text.
    pub fn record_logs(&mut self, logs: &str, total_bytes: u64) {
        let stats = classify_logs(logs);
        self.log_bytes = total_bytes;
        self.log_lines = stats.lines;
        self.error_lines = stats.error_lines;
        self.warning_lines = stats.warning_lines;
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Result of a container that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRun {
    pub exit_code: i32,
    pub logs: String,
}

/// A connected container engine client.
pub trait ContainerRuntime {
    /// Run the agent container to completion.
    ///
    /// `metrics` is filled even when the run fails with [`StepError::ContainerTimeout`].
    fn run_agent_container_with_metrics(
        &self,
        config: &ContainerConfig,
        metrics: &mut ContainerMetrics,
    ) -> Result<ContainerRun>;

    /// Release client resources. Safe to call when nothing ran, and more than once.
    fn close(&mut self) -> Result<()>;
}

/// Factory for container engine clients.
pub trait ContainerConnector {
    type Client: ContainerRuntime;

    /// Connect to the engine; fails with [`StepError::ContainerRuntime`] if unreachable.
    fn new_client(&self) -> Result<Self::Client>;
}

/// Connector for the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerConnector {
    docker_bin: String,
}

impl DockerConnector {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }
}

impl Default for DockerConnector {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerConnector for DockerConnector {
    type Client = DockerClient;

    fn new_client(&self) -> Result<DockerClient> {
        DockerClient::connect(&self.docker_bin)
    }
}

/// Client driving containers through the `docker` CLI.
#[derive(Debug)]
pub struct DockerClient {
    docker_bin: String,
    server_version: String,
    closed: bool,
}

impl DockerClient {
    /// Probe the engine with `docker version` and return a client if the daemon answers.
    #[instrument(skip_all, fields(docker_bin))]
    pub fn connect(docker_bin: &str) -> Result<Self> {
        let mut cmd = Command::new(docker_bin);
        cmd.args(["version", "--format", "{{.Server.Version}}"]);
        let output = run_command_with_timeout(cmd, None, Some(PROBE_TIMEOUT), PROBE_OUTPUT_LIMIT, None)
            .map_err(|err| StepError::ContainerRuntime(format!("spawn {docker_bin}: {err}")))?;
        if output.timed_out {
            return Err(StepError::ContainerRuntime(format!(
                "{docker_bin} version did not answer within {PROBE_TIMEOUT:?}"
            )));
        }
        if !output.status.success() {
            return Err(StepError::ContainerRuntime(format!(
                "container engine unreachable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let server_version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(server_version = %server_version, "connected to container engine");
        Ok(Self {
            docker_bin: docker_bin.to_string(),
            server_version,
            closed: false,
        })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    fn force_stop(&self, name: &str) {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["kill", name]);
        match run_command_with_timeout(cmd, None, Some(PROBE_TIMEOUT), PROBE_OUTPUT_LIMIT, None) {
            Ok(out) if out.status.success() => debug!(name, "container killed"),
            Ok(out) => warn!(
                name,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "docker kill failed"
            ),
            Err(err) => warn!(name, err = %err, "docker kill could not be spawned"),
        }
    }
}

impl ContainerRuntime for DockerClient {
    #[instrument(skip_all, fields(name = %config.name, image = %config.image, timeout_secs = config.timeout.map(|t| t.as_secs())))]
    fn run_agent_container_with_metrics(
        &self,
        config: &ContainerConfig,
        metrics: &mut ContainerMetrics,
    ) -> Result<ContainerRun> {
        if self.closed {
            return Err(StepError::ContainerRuntime("client already closed".to_string()));
        }
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(docker_run_args(config));

        info!("starting agent container");
        metrics.start_time = Some(Utc::now());
        let result = run_command_with_timeout(
            cmd,
            None,
            config.timeout,
            config.log_limit_bytes,
            config.log_path.as_deref(),
        );
        metrics.end_time = Some(Utc::now());
        let output = result
            .map_err(|err| StepError::ContainerRuntime(format!("spawn {}: {err}", self.docker_bin)))?;

        if output.timed_out {
            self.force_stop(&config.name);
            let logs = record_output(metrics, &output);
            let timeout = config.timeout.unwrap_or_default();
            warn!(timeout_secs = timeout.as_secs(), "agent container timed out");
            return Err(StepError::ContainerTimeout { timeout, logs });
        }

        let exit_code = output.exit_code();
        if exit_code == DOCKER_LAUNCH_FAILURE {
            return Err(StepError::ContainerLaunch(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let logs = record_output(metrics, &output);
        metrics.exit_code = Some(exit_code);
        if exit_code != 0 {
            warn!(exit_code, "agent container exited non-zero");
        } else {
            debug!("agent container finished");
        }
        Ok(ContainerRun { exit_code, logs })
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            debug!("closing container client");
            self.closed = true;
        }
        Ok(())
    }
}

fn record_output(metrics: &mut ContainerMetrics, output: &CommandOutput) -> String {
    let logs = output.combined_text();
    metrics.record_logs(&logs, output.total_bytes());
    logs
}

/// Arguments for `docker run` implementing the launch contract.
pub fn docker_run_args(config: &ContainerConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        config.name.clone(),
        "--workdir".into(),
        config.workdir_mount.clone(),
        "--volume".into(),
        bind_mount(&config.worktree_path, &config.workdir_mount),
        "--volume".into(),
        bind_mount(&config.database_path, &config.database_mount),
    ];
    let mut env = BTreeMap::new();
    env.insert(ENV_PROJECT_ID.to_string(), config.project_id.clone());
    env.insert(ENV_STEP_ID.to_string(), config.step_id.to_string());
    env.insert(ENV_STEP_MODE.to_string(), "1".to_string());
    env.insert(ENV_DATABASE.to_string(), config.database_mount.clone());
    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }
    args.push(config.image.clone());
    args.extend(config.command.iter().cloned());
    args
}

fn bind_mount(host: &Path, target: &str) -> String {
    format!("{}:{target}", host.display())
}
