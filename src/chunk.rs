//! Chunk generation and bounded-concurrency commit.
//!
//! One step runs as a single generation loop feeding a fixed-size commit pool:
//!
//! 1. The loop pulls up to `chunk_size` raw records from the cursor and runs each
//!    through the transform. Generation is strictly sequential, so chunk
//!    boundaries are deterministic source positions.
//! 2. The finished [`Chunk`] is spawned onto a rayon pool of `concurrency_limit`
//!    threads, where the sink commit (with bounded retries) runs.
//! 3. Commit results come back over a channel and are acknowledged in chunk
//!    sequence order. Acknowledging a chunk applies its counters and moves the
//!    persisted checkpoint to its end position. A chunk that finishes early
//!    waits for every chunk before it.
//!
//! When `concurrency_limit` commits are in flight the loop blocks on the result
//! channel before generating another chunk. After the first failure no new chunk
//! is generated, in-flight commits are drained, and the checkpoint stays at the
//! start of the earliest chunk that did not commit. Panics in the transform,
//! cursor or sink fail the step instead of unwinding past it.

use crate::error::{ErrorKind, ItemError, StepError};
use crate::execution::{Position, StepContribution, StepExecution};
use crate::item::{ItemCursor, ItemSink, ItemTransform};
use crate::policy::{RetryPolicy, SkipDecision, SkipPolicy};
use crate::step::{StepOutcome, StepScope};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Resolved chunk settings for one step execution.
#[derive(Debug, Clone)]
pub struct ChunkSettings {
    pub chunk_size: usize,
    pub concurrency_limit: usize,
    pub skip_policy: SkipPolicy,
    pub retry_policy: RetryPolicy,
}

/// A batch of transformed records plus the source range it covers.
#[derive(Debug)]
pub struct Chunk<O> {
    /// Zero-based order in which the chunk was generated.
    pub sequence: u64,
    pub items: Vec<O>,
    /// Checkpoint before the chunk's first record.
    pub start: Position,
    /// Checkpoint after the chunk's last record.
    pub end: Position,
    /// Read, write, skip and filter counts of the records in the chunk.
    pub tally: StepContribution,
}

/// Pulls raw records and turns them into chunks, classifying record-level
/// errors through the skip policy.
pub struct ChunkProvider<'a, C, T> {
    cursor: C,
    transform: &'a T,
    skip_policy: &'a SkipPolicy,
    chunk_size: usize,
    next_sequence: u64,
    skipped_errors: usize,
}

impl<'a, C, T> ChunkProvider<'a, C, T>
where
    C: ItemCursor,
    T: ItemTransform<C::Item>,
{
    pub fn new(cursor: C, transform: &'a T, skip_policy: &'a SkipPolicy, chunk_size: usize) -> Self {
        Self {
            cursor,
            transform,
            skip_policy,
            chunk_size,
            next_sequence: 0,
            skipped_errors: 0,
        }
    }

    /// Position of the next record to be read.
    pub fn position(&self) -> Position {
        self.cursor.position()
    }

    /// Builds the next chunk, `None` once the source is exhausted.
    ///
    /// A chunk may hold fewer than `chunk_size` items when records were skipped
    /// or the source ended; it is still one chunk.
    ///
    /// # Errors
    ///
    /// Returns the step failure for a record error the skip policy does not absorb.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk<T::Output>>, StepError> {
        let start = self.cursor.position();
        let mut items = Vec::with_capacity(self.chunk_size);
        let mut tally = StepContribution::default();
        let mut pulled = 0usize;

        while pulled < self.chunk_size {
            let at = self.cursor.position();
            let Some(next) = self.cursor.next() else {
                break;
            };
            pulled += 1;

            match next {
                Ok(raw) => {
                    tally.read_count += 1;
                    match self.transform.apply(raw) {
                        Ok(Some(out)) => items.push(out),
                        Ok(None) => {
                            tally.filter_count += 1;
                            tally.skip_count += 1;
                        }
                        Err(e) => {
                            let e = with_position(e, at);
                            self.absorb(e, &mut tally, StepError::Transform)?;
                        }
                    }
                }
                Err(e) => {
                    let e = with_position(e, at);
                    self.absorb(e, &mut tally, StepError::Source)?;
                }
            }
        }

        if pulled == 0 {
            return Ok(None);
        }

        tally.write_count = items.len() as u64;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(Some(Chunk {
            sequence,
            items,
            start,
            end: self.cursor.position(),
            tally,
        }))
    }

    fn absorb(
        &mut self,
        error: ItemError,
        tally: &mut StepContribution,
        fail: fn(ItemError) -> StepError,
    ) -> Result<(), StepError> {
        match self.skip_policy.classify(&error, self.skipped_errors) {
            SkipDecision::Skip => {
                self.skipped_errors += 1;
                tally.skip_count += 1;
                warn!(error = %error, skipped = self.skipped_errors, "skipping record");
                Ok(())
            }
            SkipDecision::Fail => Err(fail(error)),
            SkipDecision::LimitExceeded { limit } => {
                Err(StepError::SkipLimitExceeded { limit, error })
            }
        }
    }
}

fn with_position(error: ItemError, at: Position) -> ItemError {
    if error.position.is_some() {
        error
    } else {
        error.at(at)
    }
}

/// Result of committing one chunk on a pool thread.
#[derive(Debug)]
enum ChunkOutcome {
    Committed {
        end: Position,
        tally: StepContribution,
        attempts: u32,
        elapsed: Duration,
    },
    Failed {
        start: Position,
        error: ItemError,
        attempts: u32,
    },
}

/// Commits a whole chunk, retrying the full batch while the policy allows it.
fn commit_chunk<O, W>(sink: &W, retry: &RetryPolicy, chunk: &Chunk<O>) -> ChunkOutcome
where
    W: ItemSink<O> + ?Sized,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    if chunk.items.is_empty() {
        return ChunkOutcome::Committed {
            end: chunk.end,
            tally: chunk.tally,
            attempts,
            elapsed: started.elapsed(),
        };
    }

    loop {
        attempts += 1;
        match sink.commit(&chunk.items) {
            Ok(()) => {
                return ChunkOutcome::Committed {
                    end: chunk.end,
                    tally: chunk.tally,
                    attempts,
                    elapsed: started.elapsed(),
                };
            }
            Err(error) if retry.should_retry(&error, attempts) => {
                warn!(
                    chunk = chunk.sequence,
                    attempt = attempts,
                    error = %error,
                    "chunk commit failed, retrying"
                );
                if !retry.backoff.is_zero() {
                    thread::sleep(retry.backoff);
                }
            }
            Err(error) => {
                return ChunkOutcome::Failed {
                    start: chunk.start,
                    error,
                    attempts,
                };
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Acknowledges commit results in sequence order and persists checkpoints.
struct CheckpointAcker<'s> {
    next: u64,
    pending: BTreeMap<u64, ChunkOutcome>,
    failure: Option<(u64, StepError)>,
    scope: &'s StepScope<'s>,
}

impl<'s> CheckpointAcker<'s> {
    fn new(scope: &'s StepScope<'s>) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            failure: None,
            scope,
        }
    }

    fn failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Chunks before the first failure still commit and advance the checkpoint.
    fn discards(&self, sequence: u64) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|(first, _)| *first <= sequence)
    }

    /// Records a failure unless an earlier chunk already failed.
    fn fail(&mut self, sequence: u64, error: StepError) {
        match &self.failure {
            Some((first, _)) if *first <= sequence => {
                debug!(chunk = sequence, error = %error, "later chunk also failed");
            }
            _ => self.failure = Some((sequence, error)),
        }
    }

    fn receive(
        &mut self,
        sequence: u64,
        outcome: ChunkOutcome,
        execution: &mut StepExecution,
    ) -> Result<(), StepError> {
        self.pending.insert(sequence, outcome);

        while let Some(outcome) = self.pending.remove(&self.next) {
            let sequence = self.next;
            if self.discards(sequence) {
                if matches!(outcome, ChunkOutcome::Committed { .. }) {
                    warn!(
                        chunk = sequence,
                        "chunk committed after an earlier chunk failed; checkpoint not advanced"
                    );
                }
                self.next += 1;
                continue;
            }

            match outcome {
                ChunkOutcome::Committed {
                    end,
                    tally,
                    attempts,
                    elapsed,
                } => {
                    let contribution = StepContribution {
                        commit_count: 1,
                        rollback_count: u64::from(attempts.saturating_sub(1)),
                        ..tally
                    };
                    execution.apply(&contribution);
                    execution.context.set_position(end);
                    self.scope.ledger.update_step_execution(execution)?;

                    if let Some(metrics) = self.scope.metrics {
                        metrics.record_histogram(
                            &format!("{}.commit_ms", execution.step_name),
                            elapsed.as_secs_f64() * 1000.0,
                        );
                    }
                    debug!(
                        chunk = sequence,
                        position = end.0,
                        written = tally.write_count,
                        write_count = execution.write_count,
                        "chunk committed"
                    );
                }
                ChunkOutcome::Failed {
                    start,
                    error,
                    attempts,
                } => {
                    execution.apply(&StepContribution {
                        rollback_count: u64::from(attempts),
                        ..StepContribution::default()
                    });
                    self.scope.ledger.update_step_execution(execution)?;
                    error!(
                        chunk = sequence,
                        checkpoint = start.0,
                        attempts,
                        error = %error,
                        "chunk commit failed"
                    );
                    self.fail(sequence, StepError::Sink { error, attempts });
                }
            }
            self.next += 1;
        }
        Ok(())
    }
}

/// Runs the generation loop and commit pool until the source is exhausted,
/// a chunk fails, or a stop is requested.
///
/// # Errors
///
/// Returns the step failure; counters and checkpoint on `execution` reflect
/// every chunk acknowledged before it.
pub fn process_chunks<C, T, W>(
    provider: &mut ChunkProvider<'_, C, T>,
    sink: &W,
    settings: &ChunkSettings,
    execution: &mut StepExecution,
    scope: &StepScope<'_>,
) -> Result<StepOutcome, StepError>
where
    C: ItemCursor,
    T: ItemTransform<C::Item>,
    W: ItemSink<T::Output> + ?Sized,
{
    let limit = settings.concurrency_limit;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(limit)
        .thread_name(|i| format!("chunk-commit-{i}"))
        .build()
        .map_err(|e| StepError::WorkerPool(e.to_string()))?;

    let (tx, rx): (Sender<(u64, ChunkOutcome)>, Receiver<(u64, ChunkOutcome)>) = channel();
    let mut acker = CheckpointAcker::new(scope);
    let mut in_flight = 0usize;
    let mut stopped = false;
    let retry = &settings.retry_policy;

    let ledger_result = pool.in_place_scope(|s| -> Result<(), StepError> {
        let mut result = Ok(());

        loop {
            while in_flight >= limit {
                let Ok((sequence, outcome)) = rx.recv() else {
                    break;
                };
                in_flight -= 1;
                if let Err(e) = acker.receive(sequence, outcome, execution) {
                    result = Err(e);
                    break;
                }
            }
            if result.is_err() || acker.failed() {
                break;
            }
            if scope.stop.is_requested() {
                stopped = true;
                break;
            }

            let generated = panic::catch_unwind(AssertUnwindSafe(|| provider.next_chunk()))
                .unwrap_or_else(|payload| {
                    Err(StepError::Panicked {
                        stage: "chunk generation",
                        message: panic_message(payload.as_ref()),
                    })
                });
            match generated {
                Ok(Some(chunk)) => {
                    debug!(
                        chunk = chunk.sequence,
                        start = chunk.start.0,
                        end = chunk.end.0,
                        items = chunk.items.len(),
                        "submitting chunk"
                    );
                    in_flight += 1;
                    let tx = tx.clone();
                    s.spawn(move |_| {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            commit_chunk(sink, retry, &chunk)
                        }))
                        .unwrap_or_else(|_| ChunkOutcome::Failed {
                            start: chunk.start,
                            error: ItemError::new(
                                ErrorKind::Other("panic".into()),
                                "sink panicked during commit",
                            ),
                            attempts: 1,
                        });
                        // The receiver only goes away once every in-flight chunk is drained.
                        let _ = tx.send((chunk.sequence, outcome));
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    let sequence = provider.next_sequence;
                    error!(checkpoint = provider.position().0, error = %e, "chunk generation failed");
                    acker.fail(sequence, e);
                    break;
                }
            }
        }

        while in_flight > 0 {
            let Ok((sequence, outcome)) = rx.recv() else {
                break;
            };
            in_flight -= 1;
            if result.is_ok()
                && let Err(e) = acker.receive(sequence, outcome, execution)
            {
                result = Err(e);
            }
        }
        result
    });

    ledger_result?;
    match acker.failure {
        Some((_, error)) => Err(error),
        None if stopped => Ok(StepOutcome::Stopped),
        None => Ok(StepOutcome::Completed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{FnTransform, ItemSource, PassThrough};
    use crate::testing::VecSource;

    #[test]
    fn chunks_cover_contiguous_source_ranges() {
        let source = VecSource::new((0..7u32).collect());
        let policy = SkipPolicy::FailFast;
        let mut provider = ChunkProvider::new(source.open(None).unwrap(), &PassThrough, &policy, 3);

        let mut ranges = Vec::new();
        while let Some(chunk) = provider.next_chunk().unwrap() {
            ranges.push((chunk.sequence, chunk.start.0, chunk.end.0, chunk.items.len()));
        }
        assert_eq!(ranges, [(0, 0, 3, 3), (1, 3, 6, 3), (2, 6, 7, 1)]);
    }

    #[test]
    fn skipped_and_filtered_records_still_fill_the_chunk() {
        let source = VecSource::new((0..6u32).collect()).fail_at(1, ItemError::malformed("bad"));
        let policy = SkipPolicy::skip_limit(5);
        let odd_only = FnTransform(|n: u32| Ok::<_, ItemError>((n % 2 == 1).then_some(n)));
        let mut provider = ChunkProvider::new(source.open(None).unwrap(), &odd_only, &policy, 4);

        let chunk = provider.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.items, vec![3]);
        assert_eq!(chunk.end, Position(4));
        assert_eq!(chunk.tally.read_count, 3);
        assert_eq!(chunk.tally.filter_count, 2);
        assert_eq!(chunk.tally.skip_count, 3);
        assert_eq!(chunk.tally.write_count, 1);
    }

    #[test]
    fn record_error_carries_its_position() {
        let source = VecSource::new((0..4u32).collect()).fail_at(2, ItemError::malformed("bad"));
        let policy = SkipPolicy::FailFast;
        let mut provider = ChunkProvider::new(source.open(None).unwrap(), &PassThrough, &policy, 4);

        match provider.next_chunk() {
            Err(StepError::Source(e)) => assert_eq!(e.position, Some(Position(2))),
            other => panic!("expected a source failure, got {other:?}"),
        }
    }

    #[test]
    fn retry_replays_the_whole_batch() {
        let sink = crate::testing::RecordingSink::new().fail_times(|_: &u32| true, 1, ItemError::io("reset"));
        let chunk = Chunk {
            sequence: 0,
            items: vec![1, 2, 3],
            start: Position(0),
            end: Position(3),
            tally: StepContribution::default(),
        };

        let outcome = commit_chunk(&sink, &RetryPolicy::attempts(1), &chunk);
        assert!(matches!(outcome, ChunkOutcome::Committed { attempts: 2, .. }));
        assert_eq!(sink.batches(), vec![vec![1, 2, 3]]);
    }
}
