//! I/O adapters used by the step cycle and rollback.

pub mod config;
pub mod container;
pub mod database;
pub mod git;
pub mod ledger;
pub mod process;
pub mod registry;
pub mod worktree;
