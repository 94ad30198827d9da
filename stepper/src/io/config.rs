//! Stepper configuration stored under `.stepper/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::AgentConfig;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".stepper/config.toml";

/// Stepper configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StepperConfig {
    pub ledger: LedgerConfig,
    pub container: ContainerSettings,
    pub isolation: IsolationConfig,
    /// Default agent configuration recorded on new steps.
    pub agent: AgentConfig,
    /// Project registry keyed by project id.
    pub projects: BTreeMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".stepper/steps.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerSettings {
    pub image: String,
    /// Command override; empty runs the image entrypoint.
    pub command: Vec<String>,
    pub docker_bin: String,
    /// Wall-clock bound per container run; `0` disables the bound.
    pub timeout_secs: u64,
    pub workdir_mount: String,
    pub database_mount: String,
    /// Captured container output beyond this many bytes is dropped (still counted).
    pub log_limit_bytes: usize,
    /// Directory receiving one log file per step; unset disables log files.
    pub log_dir: Option<PathBuf>,
    pub extra_env: BTreeMap<String, String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: "stepper-agent:latest".to_string(),
            command: Vec::new(),
            docker_bin: "docker".to_string(),
            timeout_secs: 30 * 60,
            workdir_mount: "/workspace".to_string(),
            database_mount: "/data/tasks.db".to_string(),
            log_limit_bytes: 1_000_000,
            log_dir: None,
            extra_env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IsolationConfig {
    /// Prefix for temp worktrees, their branches and database copies.
    pub temp_prefix: String,
    /// Root for temp worktrees and database copies; unset uses the system temp directory.
    pub temp_dir: Option<PathBuf>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            temp_prefix: "step".to_string(),
            temp_dir: None,
        }
    }
}

/// One registered project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProjectConfig {
    pub repo: PathBuf,
    pub database: PathBuf,
}

/// Runtime settings the orchestrator needs, derived from [`StepperConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepConfig {
    pub image: String,
    pub command: Vec<String>,
    pub timeout: Option<Duration>,
    pub workdir_mount: String,
    pub database_mount: String,
    pub log_limit_bytes: usize,
    pub log_dir: Option<PathBuf>,
    pub extra_env: BTreeMap<String, String>,
    pub temp_prefix: String,
    pub temp_dir: PathBuf,
}

impl Default for StepConfig {
    fn default() -> Self {
        StepperConfig::default().step_config()
    }
}

impl StepperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ledger.path.as_os_str().is_empty() {
            return Err(anyhow!("ledger.path must not be empty"));
        }
        if self.container.image.trim().is_empty() {
            return Err(anyhow!("container.image must not be empty"));
        }
        if self.container.docker_bin.trim().is_empty() {
            return Err(anyhow!("container.docker_bin must not be empty"));
        }
        if self.container.log_limit_bytes == 0 {
            return Err(anyhow!("container.log_limit_bytes must be > 0"));
        }
        for (name, mount) in [
            ("container.workdir_mount", &self.container.workdir_mount),
            ("container.database_mount", &self.container.database_mount),
        ] {
            if !mount.starts_with('/') {
                return Err(anyhow!("{name} must be an absolute container path"));
            }
        }
        if self.container.workdir_mount == self.container.database_mount {
            return Err(anyhow!(
                "container.workdir_mount and container.database_mount must differ"
            ));
        }
        if self.isolation.temp_prefix.trim().is_empty() {
            return Err(anyhow!("isolation.temp_prefix must not be empty"));
        }
        for (id, project) in &self.projects {
            if id.trim().is_empty() {
                return Err(anyhow!("project ids must not be empty"));
            }
            if project.repo.as_os_str().is_empty() || project.database.as_os_str().is_empty() {
                return Err(anyhow!("projects.{id} needs both repo and database"));
            }
            if project.database == self.ledger.path {
                return Err(anyhow!(
                    "projects.{id}.database must not be the ledger file"
                ));
            }
        }
        Ok(())
    }

    pub fn step_config(&self) -> StepConfig {
        let timeout = match self.container.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        StepConfig {
            image: self.container.image.clone(),
            command: self.container.command.clone(),
            timeout,
            workdir_mount: self.container.workdir_mount.clone(),
            database_mount: self.container.database_mount.clone(),
            log_limit_bytes: self.container.log_limit_bytes,
            log_dir: self.container.log_dir.clone(),
            extra_env: self.container.extra_env.clone(),
            temp_prefix: self.isolation.temp_prefix.clone(),
            temp_dir: self
                .isolation
                .temp_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StepperConfig::default()`.
pub fn load_config(path: &Path) -> Result<StepperConfig> {
    if !path.exists() {
        let cfg = StepperConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StepperConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StepperConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
