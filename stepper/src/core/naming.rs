//! Names for disposable resources: worktree directories, branches, database copies.
//!
//! Every name embeds a uniqueness token (UTC timestamp, process id, random
//! suffix) so concurrent cycles never collide. Temporary database copies follow
//! a fixed convention so cleanup can recognize them and refuse anything else.

use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};

/// File name prefix of every temporary database copy.
pub const TEMP_DB_PREFIX: &str = "stepper-isolated-";
/// File name suffix of every temporary database copy.
pub const TEMP_DB_SUFFIX: &str = ".tmp.db";

/// Generate a fresh uniqueness token, e.g. `20260118t120000-4242-k3x9q2`.
pub fn unique_token() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    build_token(
        &Utc::now().format("%Y%m%dt%H%M%S").to_string(),
        std::process::id(),
        &suffix,
    )
}

pub fn build_token(timestamp: &str, pid: u32, suffix: &str) -> String {
    format!("{timestamp}-{pid}-{suffix}")
}

/// Reduce a caller-supplied prefix to characters safe for paths and ref names.
pub fn sanitize_prefix(prefix: &str) -> String {
    let cleaned: String = prefix
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        "step".to_string()
    } else {
        cleaned
    }
}

/// Directory name for a temporary worktree.
pub fn worktree_dir_name(prefix: &str, token: &str) -> String {
    format!("{}-{token}", sanitize_prefix(prefix))
}

/// Disposable branch name for a temporary worktree.
pub fn worktree_branch_name(prefix: &str, token: &str) -> String {
    format!("{}/{token}", sanitize_prefix(prefix))
}

/// File name for a temporary database copy.
pub fn temp_database_file_name(prefix: &str, token: &str) -> String {
    format!(
        "{TEMP_DB_PREFIX}{}-{token}{TEMP_DB_SUFFIX}",
        sanitize_prefix(prefix)
    )
}

/// True if `file_name` follows the temporary database convention.
pub fn is_temp_database_file_name(file_name: &str) -> bool {
    let Some(middle) = file_name
        .strip_prefix(TEMP_DB_PREFIX)
        .and_then(|rest| rest.strip_suffix(TEMP_DB_SUFFIX))
    else {
        return false;
    };
    !middle.is_empty()
        && middle
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_prefix("My Project/alpha"), "my-project-alpha");
        assert_eq!(sanitize_prefix("  "), "step");
        assert_eq!(sanitize_prefix("step_1"), "step_1");
    }

    #[test]
    fn names_use_expected_format() {
        let token = build_token("20260118t120000", 42, "abc123");
        assert_eq!(token, "20260118t120000-42-abc123");
        assert_eq!(
            worktree_dir_name("step", &token),
            "step-20260118t120000-42-abc123"
        );
        assert_eq!(
            worktree_branch_name("step", &token),
            "step/20260118t120000-42-abc123"
        );
        assert_eq!(
            temp_database_file_name("tasks", &token),
            "stepper-isolated-tasks-20260118t120000-42-abc123.tmp.db"
        );
    }

    #[test]
    fn tokens_do_not_repeat() {
        let a = unique_token();
        let b = unique_token();
        assert_ne!(a, b);
    }

    #[test]
    fn recognizes_only_temp_database_names() {
        let name = temp_database_file_name("tasks", &unique_token());
        assert!(is_temp_database_file_name(&name));
        assert!(!is_temp_database_file_name("tasks.db"));
        assert!(!is_temp_database_file_name("stepper-isolated-.tmp.db"));
        assert!(!is_temp_database_file_name("stepper-isolated-x.db"));
        assert!(!is_temp_database_file_name("stepper-isolated-a b.tmp.db"));
    }
}
