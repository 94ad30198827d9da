//! Disposable git worktrees on throwaway branches.
//!
//! A step never touches the canonical checkout: it works in a worktree created
//! from the current HEAD and removed (together with its branch) at cleanup.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::core::naming::{unique_token, worktree_branch_name, worktree_dir_name};
use crate::error::{Result, StepError};
use crate::io::git::{Git, WorktreeInfo};

/// Attempts at finding an unused temp directory before giving up.
const MAX_NAME_ATTEMPTS: u32 = 16;

/// An isolated checkout owned by one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    /// Repository the worktree was created from.
    pub original_dir: PathBuf,
}

impl Worktree {
    pub fn git(&self) -> Git {
        Git::new(&self.path)
    }
}

/// True if `path` holds repository metadata (`.git` directory or worktree file).
pub fn is_git_repository(path: &Path) -> bool {
    path.join(".git").exists()
}

fn ensure_repository(repo_dir: &Path, command: &str) -> Result<()> {
    if is_git_repository(repo_dir) {
        return Ok(());
    }
    Err(StepError::git(
        &[command],
        format!("{} is not a git repository", repo_dir.display()),
    ))
}

/// Create `branch` at the current HEAD of `repo_dir` and check it out into `worktree_dir`.
#[instrument(skip_all, fields(repo = %repo_dir.display(), branch))]
pub fn create_worktree(repo_dir: &Path, worktree_dir: &Path, branch: &str) -> Result<Worktree> {
    ensure_repository(repo_dir, "worktree add")?;
    let git = Git::new(repo_dir);
    if git.branch_exists(branch)? {
        return Err(StepError::git(
            &["worktree", "add", "-b", branch],
            format!("branch '{branch}' already exists"),
        ));
    }
    git.worktree_add(worktree_dir, branch)?;
    info!(path = %worktree_dir.display(), branch, "worktree created");
    Ok(Worktree {
        path: worktree_dir.to_path_buf(),
        branch: branch.to_string(),
        original_dir: repo_dir.to_path_buf(),
    })
}

/// Create a worktree under the system temp directory with a unique name derived from `prefix`.
pub fn create_temp_worktree(repo_dir: &Path, prefix: &str) -> Result<Worktree> {
    create_temp_worktree_in(&std::env::temp_dir(), repo_dir, prefix)
}

/// Like [`create_temp_worktree`], rooted at `base_dir`.
///
/// The directory is reserved with an exclusive `create_dir` before git uses it,
/// so concurrent callers can never receive the same path.
pub fn create_temp_worktree_in(base_dir: &Path, repo_dir: &Path, prefix: &str) -> Result<Worktree> {
    ensure_repository(repo_dir, "worktree add")?;
    fs::create_dir_all(base_dir)?;
    for _ in 0..MAX_NAME_ATTEMPTS {
        let token = unique_token();
        let path = base_dir.join(worktree_dir_name(prefix, &token));
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
        let branch = worktree_branch_name(prefix, &token);
        return match create_worktree(repo_dir, &path, &branch) {
            Ok(worktree) => Ok(worktree),
            Err(err) => {
                let _ = fs::remove_dir(&path);
                Err(err)
            }
        };
    }
    Err(StepError::git(
        &["worktree", "add"],
        format!("no unused worktree name for prefix '{prefix}'"),
    ))
}

/// Remove the worktree registration, its directory, and its disposable branch.
///
/// An already-removed directory is not an error; only git-level failures are.
#[instrument(skip_all, fields(path = %worktree.path.display(), branch = %worktree.branch))]
pub fn remove_worktree(worktree: &Worktree) -> Result<()> {
    let git = Git::new(&worktree.original_dir);
    remove_checkout(&git, worktree)?;
    if git.branch_exists(&worktree.branch)? {
        git.delete_branch(&worktree.branch)?;
    }
    info!("worktree removed");
    Ok(())
}

/// Remove the worktree registration and directory but keep its branch, so
/// commits not yet merged into the repository stay reachable.
#[instrument(skip_all, fields(path = %worktree.path.display(), branch = %worktree.branch))]
pub fn remove_worktree_keep_branch(worktree: &Worktree) -> Result<()> {
    let git = Git::new(&worktree.original_dir);
    remove_checkout(&git, worktree)?;
    info!("worktree removed, branch kept");
    Ok(())
}

fn remove_checkout(git: &Git, worktree: &Worktree) -> Result<()> {
    if worktree.path.exists() {
        git.worktree_remove(&worktree.path)?;
    } else {
        debug!("worktree directory already gone, pruning registration");
        git.worktree_prune()?;
    }
    if worktree.path.exists() {
        warn!("worktree directory survived git removal, deleting");
        fs::remove_dir_all(&worktree.path)?;
    }
    Ok(())
}

/// Known worktrees of `repo_dir`, main checkout first.
pub fn get_worktrees(repo_dir: &Path) -> Result<Vec<WorktreeInfo>> {
    ensure_repository(repo_dir, "worktree list")?;
    Git::new(repo_dir).worktree_list()
}

/// Current HEAD of `repo_dir`. Fails for non-repositories and repositories without commits.
pub fn get_current_commit_sha(repo_dir: &Path) -> Result<String> {
    ensure_repository(repo_dir, "rev-parse")?;
    Git::new(repo_dir).head_sha()
}

/// Hard-reset `repo_dir` to `sha`, discarding local modifications and later commits.
///
/// Destructive: callers must make sure nothing valuable is uncommitted.
pub fn reset_to_commit(repo_dir: &Path, sha: &str) -> Result<()> {
    ensure_repository(repo_dir, "reset")?;
    let git = Git::new(repo_dir);
    let resolved = git.resolve_commit(sha).map_err(|_| {
        StepError::git(&["reset", "--hard", sha], format!("unknown commit '{sha}'"))
    })?;
    git.reset_hard(&resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn temp_worktree_checks_out_head_under_temp_dir() {
        let repo = TestRepo::new().expect("repo");
        let base = tempfile::tempdir().expect("tempdir");

        let wt = create_temp_worktree_in(base.path(), repo.path(), "step").expect("worktree");
        assert!(wt.path.starts_with(base.path()));
        let name = wt.path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("step-"));
        assert!(wt.branch.starts_with("step/"));
        assert!(wt.path.join("README.md").is_file());
        assert_eq!(
            get_current_commit_sha(&wt.path).expect("sha"),
            repo.head().expect("head")
        );

        remove_worktree(&wt).expect("remove");
        assert!(!wt.path.exists());
        assert!(!repo.git().branch_exists(&wt.branch).expect("branch check"));
    }

    #[test]
    fn keep_branch_removal_leaves_commit_reachable() {
        let repo = TestRepo::new().expect("repo");
        let base = tempfile::tempdir().expect("tempdir");
        let wt = create_temp_worktree_in(base.path(), repo.path(), "step").expect("worktree");
        fs::write(wt.path.join("agent.txt"), "work\n").expect("write");
        let sha = wt.git().commit_all("agent work").expect("commit").expect("sha");

        remove_worktree_keep_branch(&wt).expect("remove");
        assert!(!wt.path.exists());
        assert!(repo.git().branch_exists(&wt.branch).expect("branch check"));
        assert_eq!(repo.git().resolve_commit(&wt.branch).expect("resolve"), sha);
        assert_eq!(get_worktrees(repo.path()).expect("list").len(), 1);
    }

    #[test]
    fn default_temp_worktree_lives_in_system_temp() {
        let repo = TestRepo::new().expect("repo");
        let wt = create_temp_worktree(repo.path(), "step").expect("worktree");
        assert!(wt.path.starts_with(std::env::temp_dir()));
        remove_worktree(&wt).expect("remove");
    }

    #[test]
    fn concurrent_temp_worktrees_get_distinct_paths() {
        let repo = TestRepo::new().expect("repo");
        let base = tempfile::tempdir().expect("tempdir");
        let a = create_temp_worktree_in(base.path(), repo.path(), "step").expect("a");
        let b = create_temp_worktree_in(base.path(), repo.path(), "step").expect("b");
        assert_ne!(a.path, b.path);
        assert_ne!(a.branch, b.branch);
        remove_worktree(&a).expect("remove a");
        remove_worktree(&b).expect("remove b");
    }

    #[test]
    fn create_worktree_rejects_existing_branch() {
        let repo = TestRepo::new().expect("repo");
        let base = tempfile::tempdir().expect("tempdir");
        let first = create_worktree(repo.path(), &base.path().join("one"), "dup").expect("first");
        let err = create_worktree(repo.path(), &base.path().join("two"), "dup").unwrap_err();
        assert!(matches!(err, StepError::Git { .. }));
        remove_worktree(&first).expect("remove");
    }

    #[test]
    fn create_worktree_rejects_non_repository() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = create_worktree(dir.path(), &dir.path().join("wt"), "b").unwrap_err();
        assert!(matches!(err, StepError::Git { .. }));
    }

    #[test]
    fn remove_is_idempotent_for_missing_directory() {
        let repo = TestRepo::new().expect("repo");
        let base = tempfile::tempdir().expect("tempdir");
        let wt = create_temp_worktree_in(base.path(), repo.path(), "step").expect("worktree");
        fs::remove_dir_all(&wt.path).expect("rm");

        remove_worktree(&wt).expect("remove after manual delete");
        remove_worktree(&wt).expect("second remove");
        let listed = get_worktrees(repo.path()).expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn lists_main_and_linked_worktrees() {
        let repo = TestRepo::new().expect("repo");
        let base = tempfile::tempdir().expect("tempdir");
        let wt = create_temp_worktree_in(base.path(), repo.path(), "diag").expect("worktree");

        let listed = get_worktrees(repo.path()).expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].branch.as_deref(), Some("main"));
        assert_eq!(listed[1].branch.as_deref(), Some(wt.branch.as_str()));
        remove_worktree(&wt).expect("remove");
    }

    #[test]
    fn is_git_repository_without_error_path() {
        let repo = TestRepo::new().expect("repo");
        let plain = tempfile::tempdir().expect("tempdir");
        assert!(is_git_repository(repo.path()));
        assert!(!is_git_repository(plain.path()));
        assert!(!is_git_repository(&plain.path().join("missing")));
    }

    #[test]
    fn current_sha_fails_without_commits() {
        let dir = tempfile::tempdir().expect("tempdir");
        crate::test_support::git_init(dir.path()).expect("init");
        let err = get_current_commit_sha(dir.path()).unwrap_err();
        assert!(matches!(err, StepError::Git { .. }));
    }

    #[test]
    fn reset_removes_files_from_later_commits() {
        let repo = TestRepo::new().expect("repo");
        let a = repo.head().expect("head a");
        repo.write_file("file2.txt", "two\n").expect("write");
        repo.commit_all("add file2").expect("commit b");
        repo.write_file("file3.txt", "three\n").expect("write");
        repo.commit_all("add file3").expect("commit c");

        reset_to_commit(repo.path(), &a).expect("reset");
        assert!(!repo.path().join("file2.txt").exists());
        assert!(!repo.path().join("file3.txt").exists());
        assert_eq!(get_current_commit_sha(repo.path()).expect("sha"), a);
    }

    #[test]
    fn reset_to_current_commit_is_noop() {
        let repo = TestRepo::new().expect("repo");
        let head = repo.head().expect("head");
        reset_to_commit(repo.path(), &head).expect("reset");
        reset_to_commit(repo.path(), &head).expect("reset again");
        assert_eq!(repo.head().expect("head"), head);
    }

    #[test]
    fn reset_rejects_unknown_sha() {
        let repo = TestRepo::new().expect("repo");
        let err = reset_to_commit(repo.path(), "0123456789abcdef0123456789abcdef01234567")
            .unwrap_err();
        assert!(err.to_string().contains("unknown commit"));
    }
}
