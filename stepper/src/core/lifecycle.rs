//! Strictly sequential phases of one step cycle.

use std::fmt;

use serde::Serialize;

/// Phase reached by a step cycle.
///
/// `Idle → WorktreeAcquired → DatabaseIsolated → ContainerRan → ChangesCommitted →
/// DatabaseMerged`, then `CleanedUp` from wherever the pipeline stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Idle,
    WorktreeAcquired,
    DatabaseIsolated,
    ContainerRan,
    ChangesCommitted,
    DatabaseMerged,
    CleanedUp,
}

impl StepPhase {
    /// The next phase in the main sequence, or `None` after `DatabaseMerged`.
    pub fn next(self) -> Option<StepPhase> {
        match self {
            Self::Idle => Some(Self::WorktreeAcquired),
            Self::WorktreeAcquired => Some(Self::DatabaseIsolated),
            Self::DatabaseIsolated => Some(Self::ContainerRan),
            Self::ContainerRan => Some(Self::ChangesCommitted),
            Self::ChangesCommitted => Some(Self::DatabaseMerged),
            Self::DatabaseMerged | Self::CleanedUp => None,
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::WorktreeAcquired => "worktree_acquired",
            Self::DatabaseIsolated => "database_isolated",
            Self::ContainerRan => "container_ran",
            Self::ChangesCommitted => "changes_committed",
            Self::DatabaseMerged => "database_merged",
            Self::CleanedUp => "cleaned_up",
        };
        f.write_str(name)
    }
}

/// Terminal classification once cleanup has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleResult {
    Success,
    Failure,
}

/// Tracks the phase of one cycle and rejects out-of-order transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    phase: StepPhase,
    /// Last main-sequence phase reached before cleanup.
    reached: StepPhase,
    result: Option<CycleResult>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: StepPhase::Idle,
            reached: StepPhase::Idle,
            result: None,
        }
    }
}

impl Lifecycle {
    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn reached(&self) -> StepPhase {
        self.reached
    }

    pub fn result(&self) -> Option<CycleResult> {
        self.result
    }

    /// Move to `to`, which must be the immediate successor of the current phase.
    pub fn advance(&mut self, to: StepPhase) -> Result<(), String> {
        if self.phase.next() != Some(to) {
            return Err(format!("illegal step transition {} -> {}", self.phase, to));
        }
        self.phase = to;
        self.reached = to;
        Ok(())
    }

    /// Enter `CleanedUp`. Allowed from any phase, at most once.
    pub fn clean_up(&mut self, result: CycleResult) -> Result<(), String> {
        if self.phase == StepPhase::CleanedUp {
            return Err("step already cleaned up".to_string());
        }
        self.phase = StepPhase::CleanedUp;
        self.result = Some(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_through_full_sequence() {
        let mut lc = Lifecycle::default();
        for phase in [
            StepPhase::WorktreeAcquired,
            StepPhase::DatabaseIsolated,
            StepPhase::ContainerRan,
            StepPhase::ChangesCommitted,
            StepPhase::DatabaseMerged,
        ] {
            lc.advance(phase).expect("advance");
        }
        lc.clean_up(CycleResult::Success).expect("cleanup");
        assert_eq!(lc.phase(), StepPhase::CleanedUp);
        assert_eq!(lc.reached(), StepPhase::DatabaseMerged);
        assert_eq!(lc.result(), Some(CycleResult::Success));
    }

    #[test]
    fn rejects_skipped_phase() {
        let mut lc = Lifecycle::default();
        lc.advance(StepPhase::WorktreeAcquired).expect("advance");
        let err = lc.advance(StepPhase::ContainerRan).unwrap_err();
        assert!(err.contains("worktree_acquired -> container_ran"));
        assert_eq!(lc.phase(), StepPhase::WorktreeAcquired);
    }

    #[test]
    fn cleanup_from_middle_keeps_reached_phase() {
        let mut lc = Lifecycle::default();
        lc.advance(StepPhase::WorktreeAcquired).expect("advance");
        lc.advance(StepPhase::DatabaseIsolated).expect("advance");
        lc.clean_up(CycleResult::Failure).expect("cleanup");
        assert_eq!(lc.reached(), StepPhase::DatabaseIsolated);
        assert!(lc.advance(StepPhase::ContainerRan).is_err());
        assert!(lc.clean_up(CycleResult::Failure).is_err());
    }
}
