//! Rollback of a project's repository and ledger to an earlier step.
//!
//! There is no transaction spanning the git reset and the ledger update. A
//! crash between the two is repaired by re-running the same rollback: planning
//! counts inactive steps too, so it resets to the same commit again.

use std::path::Path;

use serde::Serialize;
use tracing::{info, instrument};

use crate::core::rollback_plan::{RollbackMode, plan_rollback};
use crate::core::types::StepId;
use crate::error::{Result, StepError};
use crate::events::{EventSink, StepEvent};
use crate::io::git::Git;
use crate::io::ledger::StepLedger;
use crate::io::worktree::{get_current_commit_sha, reset_to_commit};

/// What a rollback changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    /// Commit the repository was reset to; `None` if nothing needed undoing.
    pub restored_sha: Option<String>,
    /// Steps this call flipped to inactive, ascending.
    pub deactivated: Vec<StepId>,
}

/// Roll `project_id` back relative to step `target`.
///
/// Fails with [`StepError::StepNotFound`] if `target` is not one of the
/// project's steps and with [`StepError::DirtyWorkingTree`] before touching
/// anything if the repository has uncommitted changes.
#[instrument(skip_all, fields(project_id = %project_id, target_step = target, mode = ?mode))]
pub fn rollback(
    ledger: &StepLedger,
    repo_dir: &Path,
    project_id: &str,
    target: StepId,
    mode: RollbackMode,
    sink: &impl EventSink,
) -> Result<RollbackOutcome> {
    let steps = ledger.list_steps(project_id, false)?;
    let plan = plan_rollback(&steps, target, mode).ok_or(StepError::StepNotFound(target))?;
    if plan.is_noop() {
        info!("no steps after the boundary, nothing to roll back");
        return Ok(RollbackOutcome {
            restored_sha: None,
            deactivated: Vec::new(),
        });
    }

    Git::new(repo_dir).ensure_clean()?;

    if let Some(sha) = &plan.restore_sha {
        if get_current_commit_sha(repo_dir)? == *sha {
            info!(sha = %sha, "repository already at restore commit");
        } else {
            reset_to_commit(repo_dir, sha)?;
            info!(sha = %sha, "repository reset");
        }
    }

    ledger.deactivate_project_steps_from_id(project_id, plan.boundary)?;
    info!(
        boundary = plan.boundary,
        deactivated = plan.to_deactivate.len(),
        "steps deactivated"
    );

    let outcome = RollbackOutcome {
        restored_sha: plan.restore_sha,
        deactivated: plan.to_deactivate,
    };
    sink.publish(&StepEvent::RolledBack {
        project_id: project_id.to_string(),
        restored_sha: outcome.restored_sha.clone(),
        deactivated: outcome.deactivated.clone(),
    });
    Ok(outcome)
}
