//! Ledger failures and ledger-backed history queries.

mod support;

use ironbatch::testing::{RecordingSink, VecSource};
use ironbatch::*;
use std::sync::Arc;
use support::{ProbeLedger, engine_with};
use tempfile::TempDir;

fn params() -> JobParameters {
    JobParameters::builder().add_long("startAt", 5).build()
}

fn job(sink: Arc<RecordingSink<u32>>) -> Job {
    let step = StepBuilder::new("load", VecSource::new((0..30u32).collect()), PassThrough, sink)
        .chunk_size(10)
        .concurrency_limit(1)
        .build()
        .unwrap();
    Job::builder("import").step(step).build().unwrap()
}

#[test]
fn test_checkpoint_write_failure_aborts_the_run() {
    // Update 0 marks the step STARTED, update 1 persists the initial
    // checkpoint, update 2 is the first chunk acknowledgement.
    let ledger = Arc::new(ProbeLedger::failing_after(2));
    let engine = engine_with(Arc::clone(&ledger));
    let sink = Arc::new(RecordingSink::new());

    let err = engine.run(&job(Arc::clone(&sink)), params()).unwrap_err();

    assert!(matches!(err, LaunchError::Ledger(LedgerError::Io(_))), "{err:?}");
    assert!(engine.running_executions(None).unwrap().is_empty());
    let history = engine.job_executions("import", &params()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, BatchStatus::Failed);
    assert!(history[0].failures[0].contains("ledger volume offline"));
    // The first chunk reached the sink but its checkpoint never did.
    assert_eq!(sink.commit_calls(), 1);
    assert_eq!(history[0].step_executions[0].context.position(), Some(Position(0)));
}

#[test]
fn test_explorer_queries_reflect_history() {
    let sink = Arc::new(RecordingSink::new().fail_when(|n: &u32| *n == 15, ItemError::io("disk full")));
    let job = job(Arc::clone(&sink));
    let engine = JobEngine::in_memory();

    let failed = engine.run(&job, params()).unwrap();
    sink.clear_failures();
    let completed = engine.run(&job, params()).unwrap();

    let instance = engine.job_instance("import", &params()).unwrap().unwrap();
    assert_eq!(instance.id, failed.instance_id);
    assert_eq!(instance.key, params().key());

    let ids: Vec<_> = engine
        .job_executions("import", &params())
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, [completed.id, failed.id]);
    assert_eq!(
        engine.last_execution("import", &params()).unwrap().unwrap().status,
        BatchStatus::Completed
    );
    assert_eq!(engine.step_executions(failed.id).unwrap()[0].status, BatchStatus::Failed);
    assert!(engine.job_execution(completed.id + 100).unwrap().is_none());
    assert!(engine.job_instance("export", &params()).unwrap().is_none());
}

#[test]
fn test_corrupt_ledger_file_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("executions.ledger");
    std::fs::write(&path, b"definitely not a ledger").unwrap();

    assert!(FileLedger::open(&path).is_err());
}

#[test]
fn test_file_ledger_keeps_history_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("executions.ledger");
    let completed_id = {
        let engine = JobEngine::new(Arc::new(FileLedger::open(&path).unwrap()), EngineConfig::default()).unwrap();
        engine.run(&job(Arc::new(RecordingSink::new())), params()).unwrap().id
    };

    let engine = JobEngine::new(Arc::new(FileLedger::open(&path).unwrap()), EngineConfig::default()).unwrap();
    let execution = engine.job_execution(completed_id).unwrap().unwrap();
    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(execution.step_executions[0].write_count, 30);
    assert!(matches!(
        engine.run(&job(Arc::new(RecordingSink::new())), params()),
        Err(LaunchError::AlreadyComplete { .. })
    ));
}
