//! Isolated, reversible agent step cycles.
//!
//! Each step runs an agent container against a disposable git worktree and a
//! private copy of the project's task database, commits what the agent
//! changed, merges the database back, and records the cycle in a SQLite
//! ledger. Rollback resets the repository and tombstones later steps.
//!
//! - **[`core`]**: Pure, deterministic logic (data model, lifecycle, naming,
//!   rollback planning, log classification). No I/O.
//! - **[`io`]**: Side-effecting adapters (git, worktrees, database files,
//!   container engine, ledger, config).
//!
//! Orchestration modules ([`step`], [`rollback`]) coordinate the two.

pub mod core;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod rollback;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
