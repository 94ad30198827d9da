//! Project registry: maps a project id to its repository and task database.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Result, StepError};
use crate::io::config::{ProjectConfig, StepperConfig};

/// Filesystem locations of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub repo_dir: PathBuf,
    pub database_path: PathBuf,
}

/// Resolves project ids to their locations.
pub trait ProjectRegistry {
    fn resolve(&self, project_id: &str) -> Result<ProjectPaths>;
}

/// Registry backed by the `[projects]` table of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigRegistry {
    projects: BTreeMap<String, ProjectConfig>,
}

impl ConfigRegistry {
    pub fn new(projects: BTreeMap<String, ProjectConfig>) -> Self {
        Self { projects }
    }

    pub fn from_config(cfg: &StepperConfig) -> Self {
        Self::new(cfg.projects.clone())
    }

    pub fn project_ids(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }
}

impl ProjectRegistry for ConfigRegistry {
    fn resolve(&self, project_id: &str) -> Result<ProjectPaths> {
        if project_id.trim().is_empty() {
            return Err(StepError::validation("project id must not be empty"));
        }
        let project = self
            .projects
            .get(project_id)
            .ok_or_else(|| StepError::validation(format!("unknown project '{project_id}'")))?;
        Ok(ProjectPaths {
            repo_dir: project.repo.clone(),
            database_path: project.database.clone(),
        })
    }
}
