//! Test-only fixtures: throwaway repositories, task databases and a scripted container engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, params};
use tempfile::TempDir;

use crate::error::{Result, StepError};
use crate::io::container::{
    ContainerConfig, ContainerConnector, ContainerMetrics, ContainerRun, ContainerRuntime,
};
use crate::io::git::Git;

/// Run git in `dir`, failing on a non-zero exit.
fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        return Err(StepError::git(
            args,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Initialize an empty repository on branch `main` with a local identity.
pub fn git_init(dir: &Path) -> Result<()> {
    git(dir, &["init", "-q"])?;
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
    git(dir, &["config", "user.name", "Stepper Test"])?;
    git(dir, &["config", "user.email", "stepper@example.invalid"])?;
    git(dir, &["config", "commit.gpgsign", "false"])?;
    Ok(())
}

/// A repository in a temp directory with one commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        git_init(dir.path())?;
        let repo = Self { dir };
        repo.write_file("README.md", "# test\n")?;
        repo.commit_all("initial")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn head(&self) -> Result<String> {
        self.git().head_sha()
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Commit everything and return the new HEAD.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        git(self.path(), &["add", "-A"])?;
        git(self.path(), &["commit", "-q", "--allow-empty", "-m", message])?;
        self.head()
    }
}

/// Create a `tasks` table holding one row per title.
pub fn create_task_db(path: &Path, titles: &[&str]) -> Result<()> {
    let conn = Connection::open(path)?;
    conn.execute_batch("CREATE TABLE tasks (id INTEGER PRIMARY KEY, title TEXT NOT NULL);")?;
    for title in titles {
        conn.execute("INSERT INTO tasks(title) VALUES (?1)", params![title])?;
    }
    Ok(())
}

pub fn insert_task(path: &Path, title: &str) -> Result<()> {
    let conn = Connection::open(path)?;
    conn.execute("INSERT INTO tasks(title) VALUES (?1)", params![title])?;
    Ok(())
}

pub fn count_rows(path: &Path, table: &str) -> Result<i64> {
    let conn = Connection::open(path)?;
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

pub fn task_titles(path: &Path) -> Result<Vec<String>> {
    let conn = Connection::open(path)?;
    let mut stmt = conn.prepare("SELECT title FROM tasks ORDER BY id")?;
    let titles = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(titles)
}

/// How a scripted run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ScriptedEnd {
    /// Exit with the given code.
    #[default]
    Exit,
    /// Exceed the wall-clock bound after doing the scripted work.
    Timeout,
    /// Fail to start; no work is done.
    LaunchFailure,
}

/// What the fake agent does inside its "container".
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    /// Files written into the worktree, relative path and contents.
    pub files: Vec<(String, String)>,
    /// Rows added to the isolated database's `tasks` table.
    pub tasks: Vec<String>,
    /// Overwrite the isolated database with garbage after the inserts.
    pub corrupt_database: bool,
    pub exit_code: i32,
    pub logs: String,
    pub end: ScriptedEnd,
}

/// What a scripted connector observed.
#[derive(Debug, Default)]
pub struct ScriptLog {
    pub clients: usize,
    pub closes: usize,
    pub launched: Vec<ContainerConfig>,
}

/// Container engine double that mutates the mounted worktree and database like an agent.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    run: ScriptedRun,
    unreachable: bool,
    fail_close: bool,
    log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedConnector {
    pub fn new(run: ScriptedRun) -> Self {
        Self {
            run,
            ..Self::default()
        }
    }

    /// Every `new_client` call fails.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Clients fail when closed.
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn log(&self) -> MutexGuard<'_, ScriptLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ContainerConnector for ScriptedConnector {
    type Client = ScriptedClient;

    fn new_client(&self) -> Result<ScriptedClient> {
        if self.unreachable {
            return Err(StepError::ContainerRuntime(
                "scripted engine unreachable".to_string(),
            ));
        }
        self.log().clients += 1;
        Ok(ScriptedClient {
            run: self.run.clone(),
            fail_close: self.fail_close,
            log: Arc::clone(&self.log),
        })
    }
}

#[derive(Debug)]
pub struct ScriptedClient {
    run: ScriptedRun,
    fail_close: bool,
    log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedClient {
    fn lock(&self) -> MutexGuard<'_, ScriptLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn do_work(&self, config: &ContainerConfig) -> Result<()> {
        for (rel, contents) in &self.run.files {
            let path = config.worktree_path.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents)?;
        }
        for title in &self.run.tasks {
            insert_task(&config.database_path, title)?;
        }
        if self.run.corrupt_database {
            fs::write(&config.database_path, vec![0x42u8; 4096])?;
        }
        Ok(())
    }
}

impl ContainerRuntime for ScriptedClient {
    fn run_agent_container_with_metrics(
        &self,
        config: &ContainerConfig,
        metrics: &mut ContainerMetrics,
    ) -> Result<ContainerRun> {
        self.lock().launched.push(config.clone());
        if self.run.end == ScriptedEnd::LaunchFailure {
            return Err(StepError::ContainerLaunch(format!(
                "pull access denied for {}",
                config.image
            )));
        }
        metrics.start_time = Some(Utc::now());
        self.do_work(config)
            .map_err(|err| StepError::ContainerRuntime(format!("scripted agent: {err}")))?;
        metrics.end_time = Some(Utc::now());
        metrics.record_logs(&self.run.logs, self.run.logs.len() as u64);

        if self.run.end == ScriptedEnd::Timeout {
            return Err(StepError::ContainerTimeout {
                timeout: config.timeout.unwrap_or(Duration::from_secs(1)),
                logs: self.run.logs.clone(),
            });
        }
        metrics.exit_code = Some(self.run.exit_code);
        Ok(ContainerRun {
            exit_code: self.run.exit_code,
            logs: self.run.logs.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.lock().closes += 1;
        if self.fail_close {
            return Err(StepError::ContainerRuntime("scripted close failure".to_string()));
        }
        Ok(())
    }
}

/// Paths of a project laid out for an end-to-end cycle: a repository, a task
/// database with two rows outside it, and a separate ledger file.
pub struct TestProject {
    pub repo: TestRepo,
    pub dir: TempDir,
    pub database: PathBuf,
    pub ledger: PathBuf,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let repo = TestRepo::new()?;
        let dir = tempfile::tempdir()?;
        let database = dir.path().join("tasks.db");
        create_task_db(&database, &["first", "second"])?;
        let ledger = dir.path().join("ledger/steps.db");
        Ok(Self {
            repo,
            dir,
            database,
            ledger,
        })
    }

    /// Scratch directory for temp worktrees and database copies.
    pub fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }
}
