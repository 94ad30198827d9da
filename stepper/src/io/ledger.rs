//! SQLite-backed step ledger.
//!
//! The ledger is the append-only source of truth for steps: rows are created,
//! finalized once, and tombstoned by rollback. Nothing is ever deleted, so ids
//! are never reused. `AgentConfig` and `TokenUsage` are stored as JSON blobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, instrument};

use crate::core::types::{AgentConfig, Step, StepFinalization, StepId, TokenUsage};
use crate::error::{Result, StepError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS steps (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    active            INTEGER NOT NULL DEFAULT 1,
    parent_step_id    INTEGER REFERENCES steps(id),
    commit_sha_before TEXT NOT NULL,
    commit_sha_after  TEXT,
    agent_config_json TEXT NOT NULL,
    start_time        TEXT NOT NULL,
    end_time          TEXT,
    duration_ms       INTEGER,
    token_usage_json  TEXT NOT NULL DEFAULT '{}',
    exit_code         INTEGER,
    project_id        TEXT NOT NULL,
    created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_steps_project_id ON steps(project_id);
CREATE INDEX IF NOT EXISTS idx_steps_active ON steps(active);
CREATE INDEX IF NOT EXISTS idx_steps_parent_step_id ON steps(parent_step_id);
CREATE INDEX IF NOT EXISTS idx_steps_created_at ON steps(created_at);
";

const STEP_COLUMNS: &str = "id, active, parent_step_id, commit_sha_before, commit_sha_after, \
     agent_config_json, start_time, end_time, duration_ms, token_usage_json, exit_code, \
     project_id, created_at";

/// Handle to one step ledger file.
#[derive(Debug)]
pub struct StepLedger {
    conn: Connection,
    path: PathBuf,
}

impl StepLedger {
    /// Open (creating if absent) the ledger at `path` and ensure its schema.
    ///
    /// Safe to call repeatedly against the same path.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!("step ledger ready");
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a new step, writing the assigned `id` and `created_at` back into it.
    #[instrument(skip_all, fields(project_id = %step.project_id))]
    pub fn create_step(&self, step: &mut Step) -> Result<StepId> {
        validate_new_step(step)?;
        step.created_at = Utc::now();
        let row = StepRow::encode(step)?;
        self.conn.execute(
            "INSERT INTO steps(active, parent_step_id, commit_sha_before, commit_sha_after, \
             agent_config_json, start_time, end_time, duration_ms, token_usage_json, exit_code, \
             project_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.active,
                row.parent_step_id,
                row.commit_sha_before,
                row.commit_sha_after,
                row.agent_config_json,
                row.start_time,
                row.end_time,
                row.duration_ms,
                row.token_usage_json,
                row.exit_code,
                row.project_id,
                row.created_at,
            ],
        )?;
        step.id = self.conn.last_insert_rowid();
        info!(step_id = step.id, parent = ?step.parent_step_id, "step created");
        Ok(step.id)
    }

    /// Fetch a step; `Ok(None)` distinguishes absence from failure.
    pub fn get_step(&self, id: StepId) -> Result<Option<Step>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], StepRow::read)
            .optional()?;
        row.map(StepRow::decode).transpose()
    }

    /// Active step with the largest id for `project_id`.
    pub fn get_latest_active_step(&self, project_id: &str) -> Result<Option<Step>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE project_id = ?1 AND active = 1 \
             ORDER BY id DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, params![project_id], StepRow::read)
            .optional()?;
        row.map(StepRow::decode).transpose()
    }

    /// Write the finalize fields. Does not alter `active`.
    #[instrument(skip_all, fields(step_id = id, exit_code = fin.exit_code))]
    pub fn update_step(&self, id: StepId, fin: &StepFinalization) -> Result<()> {
        let token_usage_json = serde_json::to_string(&fin.token_usage)?;
        let changed = self.conn.execute(
            "UPDATE steps SET commit_sha_after = ?1, end_time = ?2, duration_ms = ?3, \
             exit_code = ?4, token_usage_json = ?5 WHERE id = ?6",
            params![
                fin.commit_sha_after,
                format_time(&fin.end_time),
                fin.duration_ms,
                fin.exit_code,
                token_usage_json,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(StepError::StepNotFound(id));
        }
        info!("step finalized");
        Ok(())
    }

    /// Tombstone exactly one step.
    pub fn deactivate_step(&self, id: StepId) -> Result<()> {
        let changed = self
            .conn
            .execute("UPDATE steps SET active = 0 WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StepError::StepNotFound(id));
        }
        debug!(step_id = id, "step deactivated");
        Ok(())
    }

    /// Tombstone every step with `id >= from_id` across the whole ledger.
    ///
    /// Returns the number of steps that were still active.
    pub fn deactivate_steps_from_id(&self, from_id: StepId) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE steps SET active = 0 WHERE id >= ?1 AND active = 1",
            params![from_id],
        )?;
        debug!(from_id, changed, "steps deactivated");
        Ok(changed)
    }

    /// Tombstone every step of `project_id` with `id >= from_id`.
    pub fn deactivate_project_steps_from_id(
        &self,
        project_id: &str,
        from_id: StepId,
    ) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE steps SET active = 0 WHERE project_id = ?1 AND id >= ?2 AND active = 1",
            params![project_id, from_id],
        )?;
        debug!(project_id, from_id, changed, "project steps deactivated");
        Ok(changed)
    }

    /// Steps of `project_id`, most recent first.
    pub fn list_steps(&self, project_id: &str, active_only: bool) -> Result<Vec<Step>> {
        let filter = if active_only { " AND active = 1" } else { "" };
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE project_id = ?1{filter} ORDER BY id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![project_id], StepRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StepRow::decode).collect()
    }

    pub fn get_step_count(&self, project_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM steps WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Id the next created step will receive (ledger-wide).
    pub fn get_next_step_id(&self) -> Result<StepId> {
        let max: Option<StepId> =
            self.conn
                .query_row("SELECT MAX(id) FROM steps", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Release the backing connection.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| StepError::from(err))
    }
}

fn validate_new_step(step: &Step) -> Result<()> {
    if step.project_id.trim().is_empty() {
        return Err(StepError::validation("step project_id must not be empty"));
    }
    if step.commit_sha_before.trim().is_empty() {
        return Err(StepError::validation(
            "step commit_sha_before must not be empty",
        ));
    }
    Ok(())
}

/// Storage representation of a step: the row as read before blob/timestamp decoding.
#[derive(Debug)]
struct StepRow {
    id: StepId,
    active: bool,
    parent_step_id: Option<StepId>,
    commit_sha_before: String,
    commit_sha_after: Option<String>,
    agent_config_json: String,
    start_time: String,
    end_time: Option<String>,
    duration_ms: Option<i64>,
    token_usage_json: String,
    exit_code: Option<i32>,
    project_id: String,
    created_at: String,
}

impl StepRow {
    fn encode(step: &Step) -> Result<Self> {
        Ok(Self {
            id: step.id,
            active: step.active,
            parent_step_id: step.parent_step_id,
            commit_sha_before: step.commit_sha_before.clone(),
            commit_sha_after: step.commit_sha_after.clone(),
            agent_config_json: serde_json::to_string(&step.agent_config)?,
            start_time: format_time(&step.start_time),
            end_time: step.end_time.as_ref().map(format_time),
            duration_ms: step.duration_ms,
            token_usage_json: serde_json::to_string(&step.token_usage)?,
            exit_code: step.exit_code,
            project_id: step.project_id.clone(),
            created_at: format_time(&step.created_at),
        })
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            active: row.get(1)?,
            parent_step_id: row.get(2)?,
            commit_sha_before: row.get(3)?,
            commit_sha_after: row.get(4)?,
            agent_config_json: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            duration_ms: row.get(8)?,
            token_usage_json: row.get(9)?,
            exit_code: row.get(10)?,
            project_id: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<Step> {
        let agent_config: AgentConfig = serde_json::from_str(&self.agent_config_json)?;
        let token_usage: TokenUsage = serde_json::from_str(&self.token_usage_json)?;
        Ok(Step {
            id: self.id,
            active: self.active,
            parent_step_id: self.parent_step_id,
            commit_sha_before: self.commit_sha_before,
            commit_sha_after: self.commit_sha_after,
            agent_config,
            start_time: parse_time(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            duration_ms: self.duration_ms,
            token_usage,
            exit_code: self.exit_code,
            project_id: self.project_id,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| StepError::validation(format!("invalid ledger timestamp '{raw}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ledger() -> (tempfile::TempDir, StepLedger) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = StepLedger::init(temp.path().join("state/steps.db")).expect("init");
        (temp, ledger)
    }

    fn new_step(project: &str, sha: &str) -> Step {
        Step::new(project, sha, AgentConfig::default())
    }

    fn rich_config() -> AgentConfig {
        AgentConfig {
            model: "model-x".to_string(),
            max_tokens: 8192,
            temperature: 0.25,
            system_prompt: "be careful".to_string(),
            tools: vec!["edit".to_string(), "shell".to_string()],
            metadata: BTreeMap::from([
                ("ticket".to_string(), serde_json::json!("T-1")),
                ("retries".to_string(), serde_json::json!(2)),
            ]),
        }
    }

    #[test]
    fn init_is_repeatable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("steps.db");
        let first = StepLedger::init(&path).expect("init");
        let mut step = new_step("p", "a1");
        first.create_step(&mut step).expect("create");
        first.close().expect("close");

        let second = StepLedger::init(&path).expect("re-init");
        assert_eq!(second.get_step_count("p").expect("count"), 1);
    }

    #[test]
    fn ids_increase_across_projects() {
        let (_temp, ledger) = ledger();
        let mut ids = Vec::new();
        for project in ["p", "q", "p", "r", "q"] {
            let mut step = new_step(project, "sha");
            ids.push(ledger.create_step(&mut step).expect("create"));
            assert_eq!(step.id, *ids.last().expect("id"));
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");
        assert_eq!(ledger.get_next_step_id().expect("next"), ids[4] + 1);
    }

    #[test]
    fn next_step_id_on_empty_ledger_is_one() {
        let (_temp, ledger) = ledger();
        assert_eq!(ledger.get_next_step_id().expect("next"), 1);
    }

    #[test]
    fn create_rejects_missing_required_fields() {
        let (_temp, ledger) = ledger();
        let mut no_project = new_step("  ", "sha");
        let mut no_sha = new_step("p", "");

        let err = ledger.create_step(&mut no_project).unwrap_err();
        assert!(matches!(err, StepError::Validation(_)));
        let err = ledger.create_step(&mut no_sha).unwrap_err();
        assert!(matches!(err, StepError::Validation(_)));
        assert_eq!(no_sha.id, 0);
        assert_eq!(ledger.get_next_step_id().expect("next"), 1);
    }

    #[test]
    fn step_round_trips_through_storage() {
        let (_temp, ledger) = ledger();
        let mut parent = new_step("p", "a1");
        ledger.create_step(&mut parent).expect("parent");

        let mut step = Step::new("p", "b2", rich_config()).with_parent(Some(parent.id));
        ledger.create_step(&mut step).expect("create");
        let fin = StepFinalization {
            commit_sha_after: "c3".to_string(),
            end_time: step.start_time + chrono::Duration::milliseconds(4321),
            duration_ms: 4321,
            exit_code: 2,
            token_usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
                cost: 0.125,
            },
        };
        ledger.update_step(step.id, &fin).expect("update");
        step.apply_finalization(&fin);

        let loaded = ledger.get_step(step.id).expect("get").expect("present");
        assert_eq!(loaded, step);
    }

    #[test]
    fn encode_decode_preserves_every_field() {
        let mut step = Step::new("p", "a1", rich_config()).with_parent(Some(3));
        step.id = 9;
        step.active = false;
        step.commit_sha_after = Some("z9".to_string());
        step.end_time = Some(step.start_time + chrono::Duration::seconds(2));
        step.duration_ms = Some(2000);
        step.exit_code = Some(-1);
        let decoded = StepRow::encode(&step).expect("encode").decode().expect("decode");
        assert_eq!(decoded, step);
    }

    #[test]
    fn get_missing_step_is_none() {
        let (_temp, ledger) = ledger();
        assert_eq!(ledger.get_step(42).expect("get"), None);
        assert_eq!(ledger.get_latest_active_step("p").expect("latest"), None);
    }

    #[test]
    fn latest_active_step_skips_inactive_and_other_projects() {
        let (_temp, ledger) = ledger();
        let mut s1 = new_step("p", "a");
        let mut s2 = new_step("p", "b");
        let mut s3 = new_step("q", "c");
        ledger.create_step(&mut s1).expect("s1");
        ledger.create_step(&mut s2).expect("s2");
        ledger.create_step(&mut s3).expect("s3");
        ledger.deactivate_step(s2.id).expect("deactivate");

        let latest = ledger.get_latest_active_step("p").expect("latest").expect("some");
        assert_eq!(latest.id, s1.id);
    }

    #[test]
    fn update_does_not_touch_active_flag() {
        let (_temp, ledger) = ledger();
        let mut step = new_step("p", "a");
        ledger.create_step(&mut step).expect("create");
        ledger.deactivate_step(step.id).expect("deactivate");
        let fin = StepFinalization {
            commit_sha_after: "b".to_string(),
            end_time: Utc::now(),
            duration_ms: 1,
            exit_code: 0,
            token_usage: TokenUsage::default(),
        };
        ledger.update_step(step.id, &fin).expect("update");
        let loaded = ledger.get_step(step.id).expect("get").expect("present");
        assert!(!loaded.active);
        assert!(loaded.is_finalized());
    }

    #[test]
    fn update_and_deactivate_missing_step_fail() {
        let (_temp, ledger) = ledger();
        let fin = StepFinalization {
            commit_sha_after: "b".to_string(),
            end_time: Utc::now(),
            duration_ms: 1,
            exit_code: 0,
            token_usage: TokenUsage::default(),
        };
        assert!(matches!(
            ledger.update_step(5, &fin).unwrap_err(),
            StepError::StepNotFound(5)
        ));
        assert!(matches!(
            ledger.deactivate_step(5).unwrap_err(),
            StepError::StepNotFound(5)
        ));
    }

    #[test]
    fn deactivate_from_id_is_inclusive() {
        let (_temp, ledger) = ledger();
        for sha in ["a", "b", "c"] {
            let mut step = new_step("p", sha);
            ledger.create_step(&mut step).expect("create");
        }
        assert_eq!(ledger.deactivate_steps_from_id(2).expect("deactivate"), 2);

        let active: Vec<StepId> = ledger
            .list_steps("p", true)
            .expect("list")
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(active, vec![1]);
        assert_eq!(ledger.list_steps("p", false).expect("all").len(), 3);
        assert_eq!(ledger.deactivate_steps_from_id(2).expect("again"), 0);
    }

    #[test]
    fn project_scoped_deactivation_spares_other_projects() {
        let (_temp, ledger) = ledger();
        let mut p1 = new_step("p", "a");
        let mut q2 = new_step("q", "b");
        let mut p3 = new_step("p", "c");
        ledger.create_step(&mut p1).expect("p1");
        ledger.create_step(&mut q2).expect("q2");
        ledger.create_step(&mut p3).expect("p3");

        assert_eq!(
            ledger
                .deactivate_project_steps_from_id("p", p1.id)
                .expect("deactivate"),
            2
        );
        assert!(ledger.list_steps("p", true).expect("p").is_empty());
        assert_eq!(ledger.list_steps("q", true).expect("q").len(), 1);
    }

    #[test]
    fn list_is_most_recent_first() {
        let (_temp, ledger) = ledger();
        for sha in ["a", "b", "c"] {
            let mut step = new_step("p", sha);
            ledger.create_step(&mut step).expect("create");
        }
        let shas: Vec<String> = ledger
            .list_steps("p", false)
            .expect("list")
            .into_iter()
            .map(|s| s.commit_sha_before)
            .collect();
        assert_eq!(shas, vec!["c", "b", "a"]);
        assert_eq!(ledger.get_step_count("p").expect("count"), 3);
        assert_eq!(ledger.get_step_count("other").expect("count"), 0);
    }

    #[test]
    fn parent_must_exist() {
        let (_temp, ledger) = ledger();
        let mut orphan = new_step("p", "a").with_parent(Some(99));
        let err = ledger.create_step(&mut orphan).unwrap_err();
        assert!(matches!(err, StepError::Ledger(_)));
    }
}
