//! Git adapter for worktree, commit and reset operations.
//!
//! All repository access goes through `git` subprocess calls in an explicit
//! working directory; failures surface as [`StepError::Git`].

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, instrument, warn};

use crate::error::{Result, StepError};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    /// HEAD commit; empty for a bare repository.
    pub head: String,
    /// Checked-out branch without `refs/heads/`; `None` when detached or bare.
    pub branch: Option<String>,
    pub bare: bool,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the full HEAD commit SHA.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Resolve `rev` to a full commit SHA, failing if it does not name a commit.
    pub fn resolve_commit(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if the working tree has any modification, staged or not, including untracked files.
    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Ensure the worktree is fully clean (including untracked files).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(changed = entries.len(), "worktree not clean");
        Err(StepError::DirtyWorkingTree {
            paths: entries
                .into_iter()
                .map(|entry| format!("{} {}", entry.code, entry.path))
                .collect(),
        })
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Force-delete a local branch.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Create `branch` at HEAD and check it out into a new worktree at `path`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "-b", branch, path_arg.as_ref(), "HEAD"])?;
        Ok(())
    }

    /// Unregister a worktree and delete its directory.
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", path_arg.as_ref()])?;
        Ok(())
    }

    /// Drop registrations of worktrees whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeInfo>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Stage everything and commit if the tree has any modification.
    ///
    /// Returns the new HEAD, or `None` when there was nothing to commit.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        if !self.has_changes()? {
            debug!("nothing to commit");
            return Ok(None);
        }
        self.add_all()?;
        if !self.commit_staged(message)? {
            return Ok(None);
        }
        Ok(Some(self.head_sha()?))
    }

    /// Fast-forward the current branch to `rev`.
    #[instrument(skip_all, fields(rev))]
    pub fn merge_ff_only(&self, rev: &str) -> Result<()> {
        self.run_checked(&["merge", "--ff-only", rev])?;
        Ok(())
    }

    /// Hard-reset the working tree and current branch to `sha`.
    #[instrument(skip_all, fields(sha))]
    pub fn reset_hard(&self, sha: &str) -> Result<()> {
        warn!(sha, "hard reset");
        self.run_checked(&["reset", "--hard", sha])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("exit status {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            };
            return Err(StepError::git(args, message));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|err| {
                StepError::git(
                    args,
                    format!("spawn in {}: {err}", self.workdir.display()),
                )
            })
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(StepError::git(
            &["status"],
            format!("unexpected porcelain line: '{line}'"),
        ));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeInfo> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeInfo> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(done) = current.take() {
                entries.push(done);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: String::new(),
                branch: None,
                bare: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        } else if line == "bare" {
            entry.bare = true;
        }
    }
    if let Some(done) = current {
        entries.push(done);
    }
    entries
}
