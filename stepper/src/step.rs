//! Orchestration for a single step cycle.
//!
//! Acquires a worktree and an isolated database copy, runs the agent container,
//! commits its changes, merges the database back, then releases everything in
//! reverse order. Cleanup always runs; its failures are downgraded to warnings.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::lifecycle::{CycleResult, Lifecycle, StepPhase};
use crate::core::log_metrics::extract_token_usage;
use crate::core::naming::{sanitize_prefix, unique_token};
use crate::core::types::{AgentConfig, Step, StepFinalization, StepId};
use crate::error::{CleanupStage, CleanupWarning, Result, StepError};
use crate::events::{EventSink, NoopSink, StepEvent};
use crate::io::config::StepConfig;
use crate::io::container::{ContainerConfig, ContainerConnector, ContainerMetrics, ContainerRuntime};
use crate::io::database::{
    cleanup_temp_database, copy_database, create_temp_database_copy_in, verify_database_integrity,
};
use crate::io::git::Git;
use crate::io::ledger::StepLedger;
use crate::io::registry::ProjectRegistry;
use crate::io::worktree::{
    Worktree, create_temp_worktree_in, get_current_commit_sha, remove_worktree,
    remove_worktree_keep_branch,
};

/// Exit code recorded for a step whose container hit its wall-clock bound.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Inputs of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub project_id: String,
    pub repo_dir: PathBuf,
    /// Canonical task database; overwritten at merge-back.
    pub database_path: PathBuf,
    pub agent_config: AgentConfig,
}

impl StepRequest {
    /// Resolve the project's locations through `registry`.
    pub fn for_project(
        registry: &impl ProjectRegistry,
        project_id: &str,
        agent_config: AgentConfig,
    ) -> Result<Self> {
        let paths = registry.resolve(project_id)?;
        Ok(Self {
            project_id: project_id.to_string(),
            repo_dir: paths.repo_dir,
            database_path: paths.database_path,
            agent_config,
        })
    }
}

/// Result of a cycle that reached finalize.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// The finalized step as persisted.
    pub step: Step,
    pub exit_code: i32,
    pub timed_out: bool,
    pub metrics: ContainerMetrics,
    /// True if the agent's changes produced a commit.
    pub committed: bool,
    /// Last phase of the main sequence that completed.
    pub phase: StepPhase,
    /// Branch kept because the agent's commit could not be fast-forwarded
    /// into the repository.
    pub unmerged_branch: Option<String>,
    pub warnings: Vec<CleanupWarning>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Resources held by a cycle, released in reverse acquisition order.
struct Held<R> {
    worktree: Option<Worktree>,
    temp_database: Option<PathBuf>,
    client: Option<R>,
    step_id: Option<StepId>,
    keep_branch: bool,
}

impl<R> Default for Held<R> {
    fn default() -> Self {
        Self {
            worktree: None,
            temp_database: None,
            client: None,
            step_id: None,
            keep_branch: false,
        }
    }
}

struct Finished {
    step: Step,
    exit_code: i32,
    timed_out: bool,
    metrics: ContainerMetrics,
    committed: bool,
    unmerged_branch: Option<String>,
}

/// Drives step cycles against one ledger.
///
/// The caller must not run two cycles, or a cycle and a rollback, against the
/// same project at once: the canonical database is overwritten without a lock.
pub struct StepOrchestrator<'a, C, S = NoopSink> {
    ledger: &'a StepLedger,
    connector: C,
    sink: S,
    config: StepConfig,
}

impl<'a, C: ContainerConnector> StepOrchestrator<'a, C> {
    pub fn new(ledger: &'a StepLedger, connector: C, config: StepConfig) -> Self {
        Self {
            ledger,
            connector,
            sink: NoopSink,
            config,
        }
    }
}

impl<'a, C: ContainerConnector, S: EventSink> StepOrchestrator<'a, C, S> {
    pub fn with_sink<S2: EventSink>(self, sink: S2) -> StepOrchestrator<'a, C, S2> {
        StepOrchestrator {
            ledger: self.ledger,
            connector: self.connector,
            sink,
            config: self.config,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Execute one full cycle.
    ///
    /// A non-zero agent exit or a timeout is recorded on the step, not returned
    /// as an error. Any other failure aborts the main sequence, leaves the step
    /// row unfinalized, and is returned after cleanup. A commit that cannot be
    /// fast-forwarded into the repository does not abort the cycle; it is
    /// reported through [`StepOutcome::unmerged_branch`].
    #[instrument(skip_all, fields(project_id = %request.project_id))]
    pub fn run_step(&self, request: &StepRequest) -> Result<StepOutcome> {
        let mut lifecycle = Lifecycle::default();
        let mut held = Held::default();

        let result = self.drive(request, &mut lifecycle, &mut held);
        let step_id = held.step_id;
        let warnings = self.release(held);

        match result {
            Ok(finished) => {
                let _ = lifecycle.clean_up(CycleResult::Success);
                info!(
                    step_id = finished.step.id,
                    exit_code = finished.exit_code,
                    timed_out = finished.timed_out,
                    committed = finished.committed,
                    unmerged_branch = ?finished.unmerged_branch,
                    warnings = warnings.len(),
                    "step cycle complete"
                );
                self.sink.publish(&StepEvent::Completed {
                    step: finished.step.clone(),
                    timed_out: finished.timed_out,
                });
                Ok(StepOutcome {
                    step: finished.step,
                    exit_code: finished.exit_code,
                    timed_out: finished.timed_out,
                    metrics: finished.metrics,
                    committed: finished.committed,
                    phase: lifecycle.reached(),
                    unmerged_branch: finished.unmerged_branch,
                    warnings,
                })
            }
            Err(err) => {
                let _ = lifecycle.clean_up(CycleResult::Failure);
                warn!(
                    step_id = ?step_id,
                    phase = %lifecycle.reached(),
                    error = %err,
                    "step cycle failed"
                );
                self.sink.publish(&StepEvent::Failed {
                    step_id,
                    project_id: request.project_id.clone(),
                    phase: lifecycle.reached(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn drive(
        &self,
        request: &StepRequest,
        lifecycle: &mut Lifecycle,
        held: &mut Held<C::Client>,
    ) -> Result<Finished> {
        self.validate(request)?;
        let prefix = &self.config.temp_prefix;

        let worktree = create_temp_worktree_in(&self.config.temp_dir, &request.repo_dir, prefix)?;
        let worktree = held.worktree.insert(worktree).clone();
        advance(lifecycle, StepPhase::WorktreeAcquired)?;

        let sha_before = get_current_commit_sha(&worktree.path)?;
        let parent = self
            .ledger
            .get_latest_active_step(&request.project_id)?
            .map(|step| step.id);
        let mut step = Step::new(&request.project_id, sha_before, request.agent_config.clone())
            .with_parent(parent);
        self.ledger.create_step(&mut step)?;
        held.step_id = Some(step.id);
        self.sink.publish(&StepEvent::Created { step: step.clone() });

        let temp_database =
            create_temp_database_copy_in(&self.config.temp_dir, &request.database_path, prefix)?;
        let temp_database = held.temp_database.insert(temp_database).clone();
        verify_database_integrity(&temp_database)?;
        advance(lifecycle, StepPhase::DatabaseIsolated)?;

        let client = held.client.insert(self.connector.new_client()?);
        let container = self.container_config(request, &step, &worktree, &temp_database);
        let mut metrics = ContainerMetrics::default();
        let (exit_code, logs, timed_out) =
            match client.run_agent_container_with_metrics(&container, &mut metrics) {
                Ok(run) => (run.exit_code, run.logs, false),
                Err(StepError::ContainerTimeout { timeout, logs }) => {
                    warn!(step_id = step.id, ?timeout, "agent timed out, preserving its work");
                    metrics.exit_code = Some(TIMEOUT_EXIT_CODE);
                    (TIMEOUT_EXIT_CODE, logs, true)
                }
                Err(err) => return Err(err),
            };
        advance(lifecycle, StepPhase::ContainerRan)?;

        let message = commit_message(&step, exit_code, timed_out);
        let committed = worktree.git().commit_all(&message)?;
        let has_commit = committed.is_some();
        let mut unmerged_branch = None;
        let commit_sha_after = match committed {
            Some(sha) => {
                // A failed fast-forward keeps the branch so the commit stays reachable.
                match Git::new(&request.repo_dir).merge_ff_only(&worktree.branch) {
                    Ok(()) => {
                        info!(step_id = step.id, sha = %sha, "agent changes merged into repository");
                    }
                    Err(err) => {
                        warn!(
                            step_id = step.id,
                            sha = %sha,
                            branch = %worktree.branch,
                            error = %err,
                            "agent changes not merged into repository, keeping branch"
                        );
                        held.keep_branch = true;
                        unmerged_branch = Some(worktree.branch.clone());
                    }
                }
                sha
            }
            None => {
                debug!(step_id = step.id, "agent left no changes");
                step.commit_sha_before.clone()
            }
        };
        advance(lifecycle, StepPhase::ChangesCommitted)?;

        verify_database_integrity(&temp_database)?;
        copy_database(&temp_database, &request.database_path)?;
        advance(lifecycle, StepPhase::DatabaseMerged)?;

        let end_time = Utc::now();
        let fin = StepFinalization {
            commit_sha_after,
            end_time,
            duration_ms: (end_time - step.start_time).num_milliseconds(),
            exit_code,
            token_usage: extract_token_usage(&logs).unwrap_or_default(),
        };
        self.ledger.update_step(step.id, &fin)?;
        step.apply_finalization(&fin);

        Ok(Finished {
            step,
            exit_code,
            timed_out,
            metrics,
            committed: has_commit,
            unmerged_branch,
        })
    }

    fn validate(&self, request: &StepRequest) -> Result<()> {
        if request.project_id.trim().is_empty() {
            return Err(StepError::validation("project id must not be empty"));
        }
        if same_file(&request.database_path, self.ledger.path()) {
            return Err(StepError::validation(format!(
                "project database {} is the step ledger; merge-back would overwrite it",
                request.database_path.display()
            )));
        }
        Ok(())
    }

    fn container_config(
        &self,
        request: &StepRequest,
        step: &Step,
        worktree: &Worktree,
        temp_database: &Path,
    ) -> ContainerConfig {
        let project = sanitize_prefix(&request.project_id);
        ContainerConfig {
            image: self.config.image.clone(),
            name: format!("stepper-{project}-{}-{}", step.id, unique_token()),
            command: self.config.command.clone(),
            worktree_path: worktree.path.clone(),
            database_path: temp_database.to_path_buf(),
            workdir_mount: self.config.workdir_mount.clone(),
            database_mount: self.config.database_mount.clone(),
            project_id: request.project_id.clone(),
            step_id: step.id,
            env: self.config.extra_env.clone(),
            timeout: self.config.timeout,
            log_limit_bytes: self.config.log_limit_bytes,
            log_path: self
                .config
                .log_dir
                .as_ref()
                .map(|dir| dir.join(format!("{project}-step-{}.log", step.id))),
        }
    }

    /// Release in reverse acquisition order: client, temp database, worktree.
    fn release(&self, held: Held<C::Client>) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        let mut note = |stage: CleanupStage, result: Result<()>| {
            if let Err(err) = result {
                let warning = CleanupWarning {
                    stage,
                    message: err.to_string(),
                };
                warn!(%warning, "cleanup incomplete");
                warnings.push(warning);
            }
        };
        if let Some(mut client) = held.client {
            note(CleanupStage::ContainerClient, client.close());
        }
        if let Some(path) = held.temp_database {
            note(CleanupStage::TempDatabase, cleanup_temp_database(&path));
        }
        if let Some(worktree) = held.worktree {
            let removed = if held.keep_branch {
                remove_worktree_keep_branch(&worktree)
            } else {
                remove_worktree(&worktree)
            };
            note(CleanupStage::Worktree, removed);
        }
        warnings
    }
}

fn advance(lifecycle: &mut Lifecycle, phase: StepPhase) -> Result<()> {
    lifecycle.advance(phase).map_err(StepError::Validation)?;
    debug!(%phase, "step phase reached");
    Ok(())
}

fn commit_message(step: &Step, exit_code: i32, timed_out: bool) -> String {
    let status = if timed_out {
        "timed out".to_string()
    } else {
        format!("exit {exit_code}")
    };
    format!(
        "step {}: agent changes for {} ({status})",
        step.id, step.project_id
    )
}

/// True if both paths name the same file, falling back to lexical equality
/// when either cannot be resolved.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::{ProjectConfig, StepperConfig};
    use crate::io::registry::ConfigRegistry;
    use crate::test_support::{ScriptedConnector, ScriptedRun, TestProject};

    fn config_for(project: &TestProject) -> StepConfig {
        StepConfig {
            temp_dir: project.scratch(),
            ..StepConfig::default()
        }
    }

    #[test]
    fn request_resolves_through_registry() {
        let mut cfg = StepperConfig::default();
        cfg.projects.insert(
            "alpha".into(),
            ProjectConfig {
                repo: "/src/alpha".into(),
                database: "/src/alpha/tasks.db".into(),
            },
        );
        let registry = ConfigRegistry::from_config(&cfg);
        let request = StepRequest::for_project(&registry, "alpha", cfg.agent.clone()).expect("request");
        assert_eq!(request.repo_dir, PathBuf::from("/src/alpha"));
        assert!(StepRequest::for_project(&registry, "beta", AgentConfig::default()).is_err());
    }

    #[test]
    fn rejects_database_that_is_the_ledger() {
        let project = TestProject::new().expect("project");
        let ledger = StepLedger::init(&project.ledger).expect("ledger");
        let connector = ScriptedConnector::new(ScriptedRun::default());
        let orchestrator = StepOrchestrator::new(&ledger, connector, config_for(&project));

        let request = StepRequest {
            project_id: "p".into(),
            repo_dir: project.repo.path().to_path_buf(),
            database_path: project.ledger.clone(),
            agent_config: AgentConfig::default(),
        };
        let err = orchestrator.run_step(&request).unwrap_err();
        assert!(matches!(err, StepError::Validation(_)), "{err}");
        assert_eq!(orchestrator.connector().log().clients, 0);
        assert_eq!(ledger.get_next_step_id().expect("next"), 1);
    }

    #[test]
    fn commit_message_tags_step() {
        let mut step = Step::new("p", "a", AgentConfig::default());
        step.id = 12;
        assert_eq!(commit_message(&step, 0, false), "step 12: agent changes for p (exit 0)");
        assert_eq!(
            commit_message(&step, TIMEOUT_EXIT_CODE, true),
            "step 12: agent changes for p (timed out)"
        );
    }

    #[test]
    fn lifecycle_rejects_skipped_phase() {
        let mut lifecycle = Lifecycle::default();
        let err = advance(&mut lifecycle, StepPhase::ContainerRan).unwrap_err();
        assert!(matches!(err, StepError::Validation(_)));
    }
}
