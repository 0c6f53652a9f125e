//! Steps: the units a [`Job`](crate::Job) runs in order.
//!
//! [`ChunkStep`] is the chunk-oriented step: it opens its source at the resume
//! checkpoint (if any), and drives [`process_chunks`] until the source is
//! exhausted, a chunk fails, or a stop is requested. Steps are built with
//! [`StepBuilder`]; any setting left unset falls back to the engine's
//! [`StepDefaults`] at execution time.
//!
//! ```
//! use ironbatch::{EngineConfig, InMemoryLedger, Job, JobEngine, JobParameters, PassThrough, StepBuilder};
//! use ironbatch::testing::{RecordingSink, VecSource};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(RecordingSink::new());
//! let step = StepBuilder::new("copy", VecSource::new((0..25).collect::<Vec<u32>>()), PassThrough, Arc::clone(&sink))
//!     .chunk_size(10)
//!     .build()
//!     .unwrap();
//! let job = Job::builder("numbers").step(step).build().unwrap();
//!
//! let engine = JobEngine::new(Arc::new(InMemoryLedger::new()), EngineConfig::default()).unwrap();
//! let execution = engine.run(&job, JobParameters::empty()).unwrap();
//! assert_eq!(execution.step_executions[0].commit_count, 3);
//! assert_eq!(sink.items().len(), 25);
//! ```

use crate::chunk::{ChunkProvider, ChunkSettings, process_chunks};
use crate::config::{StepDefaults, validate_sizes};
use crate::error::{ConfigError, StepError};
use crate::execution::{Position, StepExecution};
use crate::item::{ItemSink, ItemSource, ItemTransform};
use crate::ledger::ExecutionLedger;
use crate::metrics::MetricsCollector;
use crate::policy::{RetryPolicy, SkipPolicy};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Cooperative stop flag shared between the engine and a running job.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a step needs from its surroundings while it runs.
pub struct StepScope<'a> {
    pub ledger: &'a dyn ExecutionLedger,
    pub defaults: &'a StepDefaults,
    pub stop: &'a StopSignal,
    pub metrics: Option<&'a MetricsCollector>,
    /// The previous FAILED or STOPPED execution of this step when restarting.
    pub resume: Option<&'a StepExecution>,
}

/// How a step ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Stopped,
}

/// A unit of work inside a job.
///
/// The job driver owns the execution's lifecycle: it registers the execution,
/// marks it STARTED before calling [`execute`](Step::execute), and records the
/// terminal status afterwards. Implementations update counters and the
/// execution context, persisting progress through `scope.ledger`.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Re-run this step on restart even if its last execution completed.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Maximum number of times the step may be started per job instance.
    fn start_limit(&self) -> Option<usize> {
        None
    }

    /// # Errors
    ///
    /// Returns the reason the step failed. Ledger errors are fatal to the job.
    fn execute(&self, execution: &mut StepExecution, scope: &StepScope<'_>) -> Result<StepOutcome, StepError>;
}

/// Per-step overrides of the engine's [`StepDefaults`].
#[derive(Debug, Clone, Default)]
struct StepOverrides {
    chunk_size: Option<usize>,
    concurrency_limit: Option<usize>,
    skip_policy: Option<SkipPolicy>,
    retry_policy: Option<RetryPolicy>,
}

impl StepOverrides {
    fn resolve(&self, defaults: &StepDefaults) -> ChunkSettings {
        ChunkSettings {
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            concurrency_limit: self.concurrency_limit.unwrap_or(defaults.concurrency_limit),
            skip_policy: self
                .skip_policy
                .clone()
                .unwrap_or_else(|| defaults.skip_policy.clone()),
            retry_policy: self
                .retry_policy
                .clone()
                .unwrap_or_else(|| defaults.retry_policy.clone()),
        }
    }
}

/// Read-transform-commit step over an item source, transform and sink.
pub struct ChunkStep<S, T, W> {
    name: String,
    source: S,
    transform: T,
    sink: W,
    overrides: StepOverrides,
    allow_start_if_complete: bool,
    start_limit: Option<usize>,
}

impl<S, T, W> Step for ChunkStep<S, T, W>
where
    S: ItemSource,
    T: ItemTransform<S::Item>,
    W: ItemSink<T::Output>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    fn start_limit(&self) -> Option<usize> {
        self.start_limit
    }

    fn execute(&self, execution: &mut StepExecution, scope: &StepScope<'_>) -> Result<StepOutcome, StepError> {
        let settings = self.overrides.resolve(scope.defaults);
        validate_sizes(settings.chunk_size, settings.concurrency_limit)?;

        let resume_from = scope.resume.and_then(|prior| prior.context.position());
        execution
            .context
            .set_position(resume_from.unwrap_or(Position::START));
        scope.ledger.update_step_execution(execution)?;
        info!(
            step = %self.name,
            chunk_size = settings.chunk_size,
            concurrency = settings.concurrency_limit,
            resume_from = resume_from.map(|p| p.0),
            "executing chunk step"
        );

        let cursor = self.source.open(resume_from).map_err(StepError::Source)?;
        let mut provider = ChunkProvider::new(
            cursor,
            &self.transform,
            &settings.skip_policy,
            settings.chunk_size,
        );
        process_chunks(&mut provider, &self.sink, &settings, execution, scope)
    }
}

/// Builder for [`ChunkStep`].
pub struct StepBuilder<S, T, W> {
    name: String,
    source: S,
    transform: T,
    sink: W,
    overrides: StepOverrides,
    allow_start_if_complete: bool,
    start_limit: Option<usize>,
}

impl<S, T, W> StepBuilder<S, T, W>
where
    S: ItemSource,
    T: ItemTransform<S::Item>,
    W: ItemSink<T::Output>,
{
    pub fn new(name: impl Into<String>, source: S, transform: T, sink: W) -> Self {
        Self {
            name: name.into(),
            source,
            transform,
            sink,
            overrides: StepOverrides::default(),
            allow_start_if_complete: false,
            start_limit: None,
        }
    }

    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.overrides.chunk_size = Some(size);
        self
    }

    /// Maximum number of chunk commits running at once.
    #[must_use]
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.overrides.concurrency_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.overrides.skip_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.overrides.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    #[must_use]
    pub fn start_limit(mut self, limit: usize) -> Self {
        self.start_limit = Some(limit);
        self
    }

    /// # Errors
    ///
    /// Rejects an explicit zero chunk size or concurrency limit.
    pub fn build(self) -> Result<ChunkStep<S, T, W>, ConfigError> {
        if self.overrides.chunk_size == Some(0) {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.overrides.concurrency_limit == Some(0) {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(ChunkStep {
            name: self.name,
            source: self.source,
            transform: self.transform,
            sink: self.sink,
            overrides: self.overrides,
            allow_start_if_complete: self.allow_start_if_complete,
            start_limit: self.start_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::PassThrough;
    use crate::testing::{RecordingSink, VecSource};

    #[test]
    fn overrides_fall_back_to_defaults() {
        let defaults = StepDefaults {
            chunk_size: 7,
            concurrency_limit: 3,
            ..StepDefaults::default()
        };
        let overrides = StepOverrides {
            chunk_size: Some(2),
            ..StepOverrides::default()
        };
        let settings = overrides.resolve(&defaults);
        assert_eq!(settings.chunk_size, 2);
        assert_eq!(settings.concurrency_limit, 3);
    }

    #[test]
    fn builder_rejects_zero_sizes() {
        let err = StepBuilder::new("s", VecSource::new(vec![1u8]), PassThrough, RecordingSink::new())
            .chunk_size(0)
            .build()
            .err();
        assert_eq!(err, Some(ConfigError::ZeroChunkSize));

        let err = StepBuilder::new("s", VecSource::new(vec![1u8]), PassThrough, RecordingSink::new())
            .concurrency_limit(0)
            .build()
            .err();
        assert_eq!(err, Some(ConfigError::ZeroConcurrency));
    }

    #[test]
    fn stop_signal_is_shared_between_clones() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_requested());
        signal.request();
        assert!(clone.is_requested());
    }
}
