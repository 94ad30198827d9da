use std::sync::mpsc;

use stepper::core::rollback_plan::RollbackMode;
use stepper::core::types::AgentConfig;
use stepper::error::StepError;
use stepper::events::{NoopSink, StepEvent};
use stepper::io::config::StepConfig;
use stepper::io::ledger::StepLedger;
use stepper::rollback::rollback;
use stepper::step::{StepOrchestrator, StepOutcome, StepRequest};
use stepper::test_support::{ScriptedConnector, ScriptedRun, TestProject, count_rows};

fn run_agent(project: &TestProject, ledger: &StepLedger, file: &str) -> StepOutcome {
    let run = ScriptedRun {
        files: vec![(file.to_string(), format!("{file}\n"))],
        tasks: vec![format!("task for {file}")],
        ..ScriptedRun::default()
    };
    let config = StepConfig {
        temp_dir: project.scratch(),
        ..StepConfig::default()
    };
    let request = StepRequest {
        project_id: "demo".to_string(),
        repo_dir: project.repo.path().to_path_buf(),
        database_path: project.database.clone(),
        agent_config: AgentConfig::default(),
    };
    StepOrchestrator::new(ledger, ScriptedConnector::new(run), config)
        .run_step(&request)
        .expect("step")
}

fn active_ids(ledger: &StepLedger) -> Vec<i64> {
    let mut ids: Vec<i64> = ledger
        .list_steps("demo", true)
        .expect("list")
        .into_iter()
        .map(|step| step.id)
        .collect();
    ids.sort_unstable();
    ids
}

#[test]
fn rollback_undoes_recorded_steps() {
    let project = TestProject::new().expect("project");
    let ledger = StepLedger::init(&project.ledger).expect("ledger");
    let s1 = run_agent(&project, &ledger, "a.txt");
    let s2 = run_agent(&project, &ledger, "b.txt");
    let s3 = run_agent(&project, &ledger, "c.txt");
    assert_eq!(active_ids(&ledger), vec![s1.step.id, s2.step.id, s3.step.id]);

    let (tx, rx) = mpsc::channel();
    let outcome = rollback(
        &ledger,
        project.repo.path(),
        "demo",
        s2.step.id,
        RollbackMode::UndoFrom,
        &tx,
    )
    .expect("rollback");

    assert_eq!(outcome.restored_sha.as_ref(), Some(&s2.step.commit_sha_before));
    assert_eq!(outcome.deactivated, vec![s2.step.id, s3.step.id]);
    assert_eq!(project.repo.head().expect("head"), s2.step.commit_sha_before);
    assert!(project.repo.path().join("a.txt").exists());
    assert!(!project.repo.path().join("b.txt").exists());
    assert!(!project.repo.path().join("c.txt").exists());
    assert_eq!(active_ids(&ledger), vec![s1.step.id]);
    // Rollback restores code, not the task database.
    assert_eq!(count_rows(&project.database, "tasks").expect("rows"), 5);
    assert!(matches!(rx.try_recv(), Ok(StepEvent::RolledBack { .. })));

    let next = run_agent(&project, &ledger, "d.txt");
    assert_eq!(next.step.parent_step_id, Some(s1.step.id));
    assert!(next.step.id > s3.step.id);
}

#[test]
fn keep_target_leaves_target_active() {
    let project = TestProject::new().expect("project");
    let ledger = StepLedger::init(&project.ledger).expect("ledger");
    let s1 = run_agent(&project, &ledger, "a.txt");
    let s2 = run_agent(&project, &ledger, "b.txt");

    let outcome = rollback(
        &ledger,
        project.repo.path(),
        "demo",
        s1.step.id,
        RollbackMode::KeepTarget,
        &NoopSink,
    )
    .expect("rollback");

    assert_eq!(outcome.deactivated, vec![s2.step.id]);
    assert_eq!(
        project.repo.head().expect("head"),
        s1.step.commit_sha_after.clone().expect("finalized")
    );
    assert!(project.repo.path().join("a.txt").exists());
    assert!(!project.repo.path().join("b.txt").exists());
    assert_eq!(active_ids(&ledger), vec![s1.step.id]);
}

#[test]
fn shared_ledger_keeps_other_projects_active() {
    let project = TestProject::new().expect("project");
    let ledger = StepLedger::init(&project.ledger).expect("ledger");
    let s1 = run_agent(&project, &ledger, "a.txt");
    let mut other = stepper::core::types::Step::new("other", "f00d", AgentConfig::default());
    ledger.create_step(&mut other).expect("other project step");

    rollback(
        &ledger,
        project.repo.path(),
        "demo",
        s1.step.id,
        RollbackMode::UndoFrom,
        &NoopSink,
    )
    .expect("rollback");

    assert!(active_ids(&ledger).is_empty());
    let other_active = ledger.list_steps("other", true).expect("list");
    assert_eq!(other_active.len(), 1);
}

#[test]
fn dirty_repository_blocks_rollback() {
    let project = TestProject::new().expect("project");
    let ledger = StepLedger::init(&project.ledger).expect("ledger");
    let s1 = run_agent(&project, &ledger, "a.txt");
    let head = project.repo.head().expect("head");
    project.repo.write_file("scratch.txt", "wip\n").expect("write");

    let err = rollback(
        &ledger,
        project.repo.path(),
        "demo",
        s1.step.id,
        RollbackMode::UndoFrom,
        &NoopSink,
    )
    .unwrap_err();

    assert!(matches!(err, StepError::DirtyWorkingTree { .. }), "{err}");
    assert_eq!(project.repo.head().expect("head"), head);
    assert!(project.repo.path().join("scratch.txt").exists());
    assert_eq!(active_ids(&ledger), vec![s1.step.id]);
}
