//! Stable exit codes for `stepper` commands.

/// Command succeeded; for `step`, the agent exited 0.
pub const OK: i32 = 0;
/// Invalid configuration or arguments, or a hard failure of the cycle.
pub const INVALID: i32 = 1;
/// `stepper step` completed but the agent exited non-zero.
pub const AGENT_FAILED: i32 = 2;
/// `stepper step` completed but the agent hit its timeout.
pub const AGENT_TIMED_OUT: i32 = 3;
/// `stepper step` completed but the agent's commit is left on an unmerged branch.
pub const CHANGES_UNMERGED: i32 = 4;

/// Exit code for a completed step cycle.
pub fn for_step(exit_code: i32, timed_out: bool) -> i32 {
    if timed_out {
        AGENT_TIMED_OUT
    } else if exit_code != 0 {
        AGENT_FAILED
    } else {
        OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_wins_over_exit_code() {
        assert_eq!(for_step(0, false), OK);
        assert_eq!(for_step(7, false), AGENT_FAILED);
        assert_eq!(for_step(124, true), AGENT_TIMED_OUT);
    }
}
