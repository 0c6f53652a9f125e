//! Skip and retry policies applied by chunk steps.

use ironbatch::testing::{RecordingSink, VecSource};
use ironbatch::*;
use std::sync::Arc;
use std::time::Duration;

fn run_single(step: impl Step + 'static) -> JobExecution {
    let job = Job::builder("policies").step(step).build().unwrap();
    JobEngine::in_memory().run(&job, JobParameters::empty()).unwrap()
}

// ============================================================================
// Skipping
// ============================================================================

#[test]
fn test_malformed_records_within_limit_are_skipped() {
    let source = VecSource::new((0..25u32).collect())
        .fail_at(3, ItemError::malformed("unterminated quote"))
        .fail_at(17, ItemError::malformed("wrong field count"));
    let sink = Arc::new(RecordingSink::new());
    let step = StepBuilder::new("load", source, PassThrough, Arc::clone(&sink))
        .skip_policy(SkipPolicy::skip_limit(2))
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(step.skip_count, 2);
    assert_eq!(step.read_count, 23);
    assert_eq!(step.write_count, 23);
    assert_eq!(step.context.position(), Some(Position(25)));
    let written = sink.distinct_items();
    assert!(!written.contains(&3) && !written.contains(&17));
}

#[test]
fn test_exceeding_skip_limit_fails_the_step() {
    let source = VecSource::new((0..25u32).collect())
        .fail_at(3, ItemError::malformed("bad"))
        .fail_at(5, ItemError::malformed("bad"))
        .fail_at(21, ItemError::malformed("bad"));
    let step = StepBuilder::new("load", source, PassThrough, RecordingSink::new())
        .skip_policy(SkipPolicy::skip_limit(2))
        .concurrency_limit(1)
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Failed);
    assert!(step.failure.as_deref().unwrap().contains("skip limit of 2 exceeded"));
    // The third error sits in the last chunk; the first two chunks committed.
    assert_eq!(step.context.position(), Some(Position(20)));
    assert_eq!(step.skip_count, 2);
}

#[test]
fn test_unskippable_transform_error_fails_immediately() {
    let transform = FnTransform(|n: u32| {
        if n == 4 {
            Err(ItemError::invalid("negative balance"))
        } else {
            Ok(Some(n))
        }
    });
    let step = StepBuilder::new("load", VecSource::new((0..10u32).collect()), transform, RecordingSink::new())
        .skip_policy(SkipPolicy::skip_when(2, |kind| matches!(kind, ErrorKind::Malformed)))
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(step.skip_count, 0);
    assert_eq!(step.commit_count, 0);
    assert_eq!(step.context.position(), Some(Position(0)));
    let failure = step.failure.as_deref().unwrap();
    assert!(failure.contains("transform failed") && failure.contains("negative balance"));
}

#[test]
fn test_fail_fast_is_the_default() {
    let source = VecSource::new((0..5u32).collect()).fail_at(2, ItemError::malformed("bad"));
    let step = StepBuilder::new("load", source, PassThrough, RecordingSink::new())
        .build()
        .unwrap();

    let execution = run_single(step);
    assert_eq!(execution.status, BatchStatus::Failed);
    assert!(execution.failures[0].contains("source failed"));
}

#[test]
fn test_filtered_records_are_counted() {
    let sink = Arc::new(RecordingSink::new());
    let active_only = FnTransform(|n: u32| Ok::<_, ItemError>((n % 3 != 0).then_some(n)));
    let step = StepBuilder::new("load", VecSource::new((0..12u32).collect()), active_only, Arc::clone(&sink))
        .chunk_size(4)
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(step.read_count, 12);
    assert_eq!(step.filter_count, 4);
    assert_eq!(step.skip_count, 4);
    assert_eq!(step.write_count, 8);
    assert_eq!(sink.distinct_items(), vec![1, 2, 4, 5, 7, 8, 10, 11]);
}

#[test]
fn test_unskippable_error_in_later_chunk_keeps_committed_chunks() {
    let transform = FnTransform(|n: u32| {
        if n == 22 {
            Err(ItemError::invalid("negative balance"))
        } else {
            Ok(Some(n))
        }
    });
    // Chunks 0 and 1 are still committing when chunk 2 fails to generate.
    let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_millis(200)));
    let step = StepBuilder::new("load", VecSource::new((0..25u32).collect()), transform, Arc::clone(&sink))
        .skip_policy(SkipPolicy::skip_when(2, |kind| matches!(kind, ErrorKind::Malformed)))
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(step.commit_count, 2);
    assert_eq!(step.write_count, 20);
    assert_eq!(step.read_count, 20);
    assert_eq!(step.context.position(), Some(Position(20)));
    assert_eq!(sink.distinct_items(), (0..20).collect::<Vec<_>>());
    assert!(step.failure.as_deref().unwrap().contains("at #22"));
}

#[test]
fn test_read_failure_behind_in_flight_commits_keeps_checkpoint() {
    let source = VecSource::new((0..30u32).collect()).fail_at(25, ItemError::malformed("truncated row"));
    let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_millis(200)));
    let step = StepBuilder::new("load", source, PassThrough, Arc::clone(&sink))
        .concurrency_limit(4)
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(step.commit_count, 2);
    assert_eq!(step.write_count, 20);
    assert_eq!(step.context.position(), Some(Position(20)));
    assert_eq!(sink.commit_calls(), 2);
}

// ============================================================================
// Retrying
// ============================================================================

#[test]
fn test_transient_commit_failure_is_retried() {
    let sink = Arc::new(RecordingSink::new().fail_times(|n: &u32| *n == 12, 2, ItemError::transient("lock timeout")));
    let step = StepBuilder::new("load", VecSource::new((0..25u32).collect()), PassThrough, Arc::clone(&sink))
        .retry_policy(RetryPolicy::attempts(2))
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(step.rollback_count, 2);
    assert_eq!(step.commit_count, 3);
    assert_eq!(step.write_count, 25);
    assert_eq!(sink.commit_calls(), 5);
    // Retries replay the whole chunk.
    assert!(sink.batches().contains(&(10..20).collect::<Vec<_>>()));
}

#[test]
fn test_retries_exhausted_fail_the_step() {
    let sink = Arc::new(RecordingSink::new().fail_when(|n: &u32| *n == 12, ItemError::io("connection reset")));
    let step = StepBuilder::new("load", VecSource::new((0..25u32).collect()), PassThrough, Arc::clone(&sink))
        .concurrency_limit(1)
        .retry_policy(RetryPolicy::attempts(2))
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(step.rollback_count, 3);
    assert_eq!(step.commit_count, 1);
    assert_eq!(step.context.position(), Some(Position(10)));
    assert!(step.failure.as_deref().unwrap().contains("after 3 attempt(s)"));
}

#[test]
fn test_non_retryable_failure_is_not_retried() {
    let sink = Arc::new(RecordingSink::new().fail_when(|n: &u32| *n == 0, ItemError::invalid("constraint violation")));
    let step = StepBuilder::new("load", VecSource::new((0..5u32).collect()), PassThrough, Arc::clone(&sink))
        .retry_policy(RetryPolicy::attempts(3))
        .build()
        .unwrap();

    let execution = run_single(step);

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(execution.step_executions[0].rollback_count, 1);
    assert_eq!(sink.commit_calls(), 1);
}

#[test]
fn test_panicking_sink_fails_the_step() {
    let sink = FnSink(|batch: &[u32]| {
        assert!(!batch.contains(&7), "poisoned record");
        Ok::<_, ItemError>(())
    });
    let step = StepBuilder::new("load", VecSource::new((0..20u32).collect()), PassThrough, sink)
        .chunk_size(5)
        .concurrency_limit(2)
        .build()
        .unwrap();

    let execution = run_single(step);
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(step.context.position(), Some(Position(5)));
    assert!(step.failure.as_deref().unwrap().contains("panicked"));
}

#[test]
fn test_panicking_transform_fails_the_job_and_allows_relaunch() {
    let transform = FnTransform(|n: u32| {
        assert_ne!(n, 13, "unexpected record");
        Ok::<_, ItemError>(Some(n))
    });
    let sink = Arc::new(RecordingSink::new());
    let step = StepBuilder::new("load", VecSource::new((0..20u32).collect()), transform, Arc::clone(&sink))
        .concurrency_limit(1)
        .build()
        .unwrap();
    let job = Job::builder("policies").step(step).build().unwrap();
    let engine = JobEngine::in_memory();

    let execution = engine.run(&job, JobParameters::empty()).unwrap();
    let step = &execution.step_executions[0];

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(step.status, BatchStatus::Failed);
    assert_eq!(step.context.position(), Some(Position(10)));
    let failure = step.failure.as_deref().unwrap();
    assert!(failure.contains("chunk generation panicked") && failure.contains("unexpected record"));
    assert!(engine.running_executions(None).unwrap().is_empty());

    // The failed execution is restartable rather than stuck as running.
    let relaunched = engine.run(&job, JobParameters::empty()).unwrap();
    assert_eq!(relaunched.status, BatchStatus::Failed);
    assert_ne!(relaunched.id, execution.id);
}
