//! Pure rollback planning over a project's step list.

use crate::core::types::{Step, StepId};

/// Which steps a rollback to `target` removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RollbackMode {
    /// Deactivate the target and every later step (`id >= target`).
    #[default]
    UndoFrom,
    /// Keep the target; deactivate only later steps (`id > target`).
    KeepTarget,
}

impl RollbackMode {
    /// First id deactivated under the inclusive ledger rule.
    pub fn boundary(self, target: StepId) -> StepId {
        match self {
            Self::UndoFrom => target,
            Self::KeepTarget => target + 1,
        }
    }
}

/// What a rollback will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Inclusive lower bound passed to the ledger.
    pub boundary: StepId,
    /// Commit to reset the repository to; `None` when nothing follows the boundary.
    pub restore_sha: Option<String>,
    /// Steps at or after the boundary that are still active, ascending.
    pub to_deactivate: Vec<StepId>,
}

impl RollbackPlan {
    pub fn is_noop(&self) -> bool {
        self.restore_sha.is_none()
    }
}

/// Plan a rollback from the full step list of one project (any order).
///
/// Returns `None` if `target` is not one of the project's steps. Inactive steps
/// still count when choosing the restore commit so an interrupted rollback
/// re-plans to the same commit.
pub fn plan_rollback(steps: &[Step], target: StepId, mode: RollbackMode) -> Option<RollbackPlan> {
    if !steps.iter().any(|step| step.id == target) {
        return None;
    }
    let boundary = mode.boundary(target);
    let mut affected: Vec<&Step> = steps.iter().filter(|step| step.id >= boundary).collect();
    affected.sort_by_key(|step| step.id);

    let restore_sha = affected
        .first()
        .map(|step| step.commit_sha_before.clone());
    let to_deactivate = affected
        .iter()
        .filter(|step| step.active)
        .map(|step| step.id)
        .collect();

    Some(RollbackPlan {
        boundary,
        restore_sha,
        to_deactivate,
    })
}
