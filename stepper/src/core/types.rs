//! Step data model shared by the ledger, orchestrator and rollback engine.
//!
//! `AgentConfig` and `TokenUsage` are value objects: they are stored as opaque
//! JSON blobs inside a step row and compare structurally.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger-assigned step identifier (starts at 1, never reused).
pub type StepId = i64;

/// Configuration used to run the agent for one step. Immutable once the step exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub system_prompt: String,
    pub tools: Vec<String>,
    /// Free-form, caller-defined metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 4096,
            temperature: 0.0,
            system_prompt: String::new(),
            tools: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Token accounting for a step. Replaced wholesale at finalize, never accumulated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    /// Estimated cost in USD.
    pub cost: f64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// One recorded execution cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 0 until the ledger persists the step.
    pub id: StepId,
    pub active: bool,
    pub parent_step_id: Option<StepId>,
    pub commit_sha_before: String,
    pub commit_sha_after: Option<String>,
    pub agent_config: AgentConfig,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub token_usage: TokenUsage,
    pub exit_code: Option<i32>,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
}

impl Step {
    /// Build an unsaved, active step with only the "before" fields populated.
    pub fn new(
        project_id: impl Into<String>,
        commit_sha_before: impl Into<String>,
        agent_config: AgentConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            active: true,
            parent_step_id: None,
            commit_sha_before: commit_sha_before.into(),
            commit_sha_after: None,
            agent_config,
            start_time: now,
            end_time: None,
            duration_ms: None,
            token_usage: TokenUsage::default(),
            exit_code: None,
            project_id: project_id.into(),
            created_at: now,
        }
    }

    pub fn with_parent(mut self, parent: Option<StepId>) -> Self {
        self.parent_step_id = parent;
        self
    }

    /// True once finalize has written the "after" fields.
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    /// Apply finalize fields in one go, mirroring what the ledger persists.
    pub fn apply_finalization(&mut self, fin: &StepFinalization) {
        self.commit_sha_after = Some(fin.commit_sha_after.clone());
        self.end_time = Some(fin.end_time);
        self.duration_ms = Some(fin.duration_ms);
        self.exit_code = Some(fin.exit_code);
        self.token_usage = fin.token_usage.clone();
    }
}

/// The "after" fields written exactly once when a step completes.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFinalization {
    pub commit_sha_after: String,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub token_usage: TokenUsage,
}
