//! Error kinds shared by every stepper component.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = StepError> = std::result::Result<T, E>;

/// Hard failures surfaced by the orchestration engine.
#[derive(Debug, Error)]
pub enum StepError {
    /// Malformed step input or request.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Repository, worktree, commit or reset failure.
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    /// The database file is missing, empty, unreadable, or failed its integrity check.
    #[error("database {} is corrupt: {reason}", path.display())]
    DatabaseCorrupt { path: PathBuf, reason: String },

    /// Image pull or container start failure.
    #[error("container launch failed: {0}")]
    ContainerLaunch(String),

    /// The container exceeded its wall-clock budget and was stopped.
    /// `logs` holds what was captured before the kill.
    #[error("container timed out after {timeout:?}")]
    ContainerTimeout { timeout: Duration, logs: String },

    /// The container engine is unreachable or misbehaved.
    #[error("container runtime error: {0}")]
    ContainerRuntime(String),

    /// Rollback precondition: the repository has uncommitted changes.
    #[error("working tree not clean ({} changed paths): {}", paths.len(), paths.join(", "))]
    DirtyWorkingTree { paths: Vec<String> },

    #[error("step {0} not found")]
    StepNotFound(i64),

    #[error("ledger: {0}")]
    Ledger(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StepError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn git(args: &[&str], message: impl Into<String>) -> Self {
        Self::Git {
            command: args.join(" "),
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DatabaseCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Resource released during cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStage {
    ContainerClient,
    TempDatabase,
    Worktree,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ContainerClient => "container client",
            Self::TempDatabase => "temp database",
            Self::Worktree => "worktree",
        };
        f.write_str(name)
    }
}

/// Non-fatal cleanup failure. Never replaces the primary result of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub stage: CleanupStage,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup of {} failed: {}", self.stage, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_error_names_the_command() {
        let err = StepError::git(&["reset", "--hard", "abc"], "unknown revision");
        assert_eq!(
            err.to_string(),
            "git reset --hard abc failed: unknown revision"
        );
    }

    #[test]
    fn dirty_tree_lists_paths() {
        let err = StepError::DirtyWorkingTree {
            paths: vec!["a.txt".to_string(), "b.txt".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "working tree not clean (2 changed paths): a.txt, b.txt"
        );
    }

    #[test]
    fn cleanup_warning_display_names_stage() {
        let warning = CleanupWarning {
            stage: CleanupStage::TempDatabase,
            message: "permission denied".to_string(),
        };
        assert_eq!(
            warning.to_string(),
            "cleanup of temp database failed: permission denied"
        );
    }
}
