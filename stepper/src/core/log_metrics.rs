//! Classification of agent container logs.
//!
//! Lines are classified by simple pattern match: a line is an error if it
//! mentions error/fatal/panic, otherwise a warning if it mentions warn/warning.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::TokenUsage;

/// Prefix of the log line an agent prints to report token usage.
pub const TOKEN_USAGE_MARKER: &str = "STEPPER_TOKEN_USAGE";

static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(error|fatal|panic(ked)?)\b").unwrap());
static WARNING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwarn(ing)?\b").unwrap());

/// Counts derived from captured log text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub lines: u64,
    pub error_lines: u64,
    pub warning_lines: u64,
}

pub fn classify_logs(logs: &str) -> LogStats {
    let mut stats = LogStats::default();
    for line in logs.lines() {
        stats.lines += 1;
        if ERROR_RE.is_match(line) {
            stats.error_lines += 1;
        } else if WARNING_RE.is_match(line) {
            stats.warning_lines += 1;
        }
    }
    stats
}

/// Return the usage reported by the last well-formed marker line, if any.
pub fn extract_token_usage(logs: &str) -> Option<TokenUsage> {
    logs.lines().rev().find_map(|line| {
        let payload = line.trim().strip_prefix(TOKEN_USAGE_MARKER)?;
        serde_json::from_str::<TokenUsage>(payload.trim()).ok()
    })
}
