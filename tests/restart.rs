//! Restart from the last acknowledged checkpoint.

use ironbatch::testing::{RecordingSink, VecSource};
use ironbatch::*;
use std::sync::Arc;
use tempfile::TempDir;

fn params() -> JobParameters {
    JobParameters::builder().add_long("startAt", 42).build()
}

fn position(execution: &JobExecution, step: &str) -> Option<Position> {
    execution.step_execution(step).and_then(|s| s.context.position())
}

#[test]
fn test_failed_run_resumes_at_last_committed_chunk() {
    let source = Arc::new(VecSource::new((0..25u32).collect()));
    let sink = Arc::new(RecordingSink::new().fail_when(|n: &u32| *n == 12, ItemError::io("disk full")));
    let step = StepBuilder::new("csv-step", Arc::clone(&source), PassThrough, Arc::clone(&sink))
        .chunk_size(10)
        .build()
        .unwrap();
    let job = Job::builder("import").step(step).build().unwrap();
    let engine = JobEngine::in_memory();

    let failed = engine.run(&job, params()).unwrap();
    assert_eq!(failed.status, BatchStatus::Failed);
    let step = failed.step_execution("csv-step").unwrap();
    assert_eq!(step.status, BatchStatus::Failed);
    assert_eq!(step.context.position(), Some(Position(10)));
    assert_eq!(step.write_count, 10);
    assert_eq!(step.commit_count, 1);
    assert_eq!(step.rollback_count, 1);
    assert!(step.failure.as_deref().unwrap().contains("disk full"));

    sink.clear_failures();
    let resumed = engine.run(&job, params()).unwrap();

    assert_eq!(resumed.status, BatchStatus::Completed);
    assert_eq!(resumed.instance_id, failed.instance_id);
    assert_eq!(source.opens(), vec![None, Some(Position(10))]);
    let step = resumed.step_execution("csv-step").unwrap();
    assert_eq!(step.read_count, 15);
    assert_eq!(step.write_count, 15);
    assert_eq!(position(&resumed, "csv-step"), Some(Position(25)));
    // The third chunk may have landed in the failed run too; an upserting
    // store ends up with every record exactly once.
    assert_eq!(sink.distinct_items(), (0..25).collect::<Vec<_>>());
}

#[test]
fn test_sequential_commits_write_each_record_once_across_restart() {
    let source = Arc::new(VecSource::new((0..25u32).collect()));
    let sink = Arc::new(RecordingSink::new().fail_when(|n: &u32| *n == 12, ItemError::io("disk full")));
    let step = StepBuilder::new("csv-step", Arc::clone(&source), PassThrough, Arc::clone(&sink))
        .chunk_size(10)
        .concurrency_limit(1)
        .build()
        .unwrap();
    let job = Job::builder("import").step(step).build().unwrap();
    let engine = JobEngine::in_memory();

    engine.run(&job, params()).unwrap();
    assert_eq!(sink.items(), (0..10).collect::<Vec<_>>());

    sink.clear_failures();
    engine.run(&job, params()).unwrap();
    assert_eq!(sink.items(), (0..25).collect::<Vec<_>>());
    assert_eq!(source.opens(), vec![None, Some(Position(10))]);
}

#[test]
fn test_completed_steps_are_skipped_on_restart() {
    let extract_source = Arc::new(VecSource::new((0..5u32).collect()));
    let extract = StepBuilder::new("extract", Arc::clone(&extract_source), PassThrough, RecordingSink::new())
        .build()
        .unwrap();
    let load_sink = Arc::new(RecordingSink::new().fail_when(|n: &u32| *n == 3, ItemError::transient("deadlock")));
    let load = StepBuilder::new("load", VecSource::new((0..5u32).collect()), PassThrough, Arc::clone(&load_sink))
        .chunk_size(2)
        .concurrency_limit(1)
        .build()
        .unwrap();
    let job = Job::builder("etl").step(extract).step(load).build().unwrap();
    let engine = JobEngine::in_memory();

    let failed = engine.run(&job, params()).unwrap();
    assert_eq!(failed.status, BatchStatus::Failed);
    assert_eq!(position(&failed, "load"), Some(Position(2)));

    load_sink.clear_failures();
    let resumed = engine.run(&job, params()).unwrap();

    assert_eq!(resumed.status, BatchStatus::Completed);
    assert_eq!(extract_source.opens(), vec![None]);
    let names: Vec<_> = resumed.step_executions.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, ["load"]);
    assert_eq!(load_sink.items(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_step_allowed_to_start_if_complete_runs_again() {
    let setup_source = Arc::new(VecSource::new(vec!["truncate staging".to_string()]));
    let setup = StepBuilder::new("setup", Arc::clone(&setup_source), PassThrough, RecordingSink::new())
        .allow_start_if_complete(true)
        .build()
        .unwrap();
    let load_sink = Arc::new(RecordingSink::new().fail_times(|_: &u32| true, 1, ItemError::io("timeout")));
    let load = StepBuilder::new("load", VecSource::new((0..3u32).collect()), PassThrough, Arc::clone(&load_sink))
        .build()
        .unwrap();
    let job = Job::builder("etl").step(setup).step(load).build().unwrap();
    let engine = JobEngine::in_memory();

    assert_eq!(engine.run(&job, params()).unwrap().status, BatchStatus::Failed);
    let resumed = engine.run(&job, params()).unwrap();

    assert_eq!(resumed.status, BatchStatus::Completed);
    // A completed step re-runs from the beginning, not from its final checkpoint.
    assert_eq!(setup_source.opens(), vec![None, None]);
    assert_eq!(load_sink.items(), vec![0, 1, 2]);
}

#[test]
fn test_start_limit_fails_the_job_without_running_the_step() {
    let source = Arc::new(VecSource::new((0..4u32).collect()));
    let step = StepBuilder::new(
        "load",
        Arc::clone(&source),
        PassThrough,
        RecordingSink::new().fail_when(|_: &u32| true, ItemError::io("disk full")),
    )
    .start_limit(2)
    .build()
    .unwrap();
    let job = Job::builder("import").step(step).build().unwrap();
    let engine = JobEngine::in_memory();

    assert_eq!(engine.run(&job, params()).unwrap().status, BatchStatus::Failed);
    assert_eq!(engine.run(&job, params()).unwrap().status, BatchStatus::Failed);
    let third = engine.run(&job, params()).unwrap();

    assert_eq!(third.status, BatchStatus::Failed);
    assert!(third.failures[0].contains("start limit of 2"));
    assert!(engine.step_executions(third.id).unwrap().is_empty());
    assert_eq!(source.opens().len(), 2);
}

#[test]
fn test_resumed_run_counts_only_its_own_chunks() {
    let sink = Arc::new(RecordingSink::new().fail_when(|n: &u32| *n == 5, ItemError::io("disk full")));
    let step = StepBuilder::new("load", VecSource::new((0..6u32).collect()), PassThrough, Arc::clone(&sink))
        .chunk_size(3)
        .concurrency_limit(1)
        .build()
        .unwrap();
    let job = Job::builder("import").step(step).build().unwrap();
    let engine = JobEngine::in_memory();

    let failed = engine.run(&job, params()).unwrap();
    assert_eq!(position(&failed, "load"), Some(Position(3)));

    sink.clear_failures();
    let resumed = engine.run(&job, params()).unwrap();
    let step = resumed.step_execution("load").unwrap();
    assert_eq!(step.commit_count, 1);
    assert_eq!(step.context.position(), Some(Position(6)));
}

#[test]
fn test_file_ledger_restart_across_engines() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("ledger").join("executions.bin");
    let source = Arc::new(VecSource::new((0..25u32).collect()));
    let sink = Arc::new(RecordingSink::new().fail_when(|n: &u32| *n == 12, ItemError::io("disk full")));
    let build_job = || {
        let step = StepBuilder::new("csv-step", Arc::clone(&source), PassThrough, Arc::clone(&sink))
            .chunk_size(10)
            .concurrency_limit(1)
            .build()
            .unwrap();
        Job::builder("import").step(step).build().unwrap()
    };

    let failed_id = {
        let engine = JobEngine::new(
            Arc::new(FileLedger::open(&ledger_path).unwrap()),
            EngineConfig::default(),
        )
        .unwrap();
        let failed = engine.run(&build_job(), params()).unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);
        failed.id
    };

    sink.clear_failures();
    let engine = JobEngine::new(
        Arc::new(FileLedger::open(&ledger_path).unwrap()),
        EngineConfig::default(),
    )
    .unwrap();
    let prior = engine.job_execution(failed_id).unwrap().unwrap();
    assert_eq!(position(&prior, "csv-step"), Some(Position(10)));

    let resumed = engine.run(&build_job(), params()).unwrap();
    assert_eq!(resumed.status, BatchStatus::Completed);
    assert_ne!(resumed.id, failed_id);
    assert_eq!(sink.items(), (0..25).collect::<Vec<_>>());
    assert_eq!(source.opens(), vec![None, Some(Position(10))]);
    assert_eq!(engine.job_executions("import", &params()).unwrap().len(), 2);
}
