//! Skip and retry policies for chunk-oriented steps.
//!
//! Skipping is record-scoped: a skippable read or transform error drops the
//! offending record from its chunk. Retrying is chunk-scoped: a failed sink
//! commit re-runs the commit of the whole chunk, never a subset of it.

use crate::error::{ErrorKind, ItemError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate over an error's kind.
pub type KindPredicate = Arc<dyn Fn(&ErrorKind) -> bool + Send + Sync>;

/// How record-level errors are handled.
#[derive(Clone, Default)]
pub enum SkipPolicy {
    /// Any read or transform error fails the chunk and the step.
    #[default]
    FailFast,
    /// Skippable errors are counted and the record dropped, up to `limit` of them.
    SkipAndContinue {
        limit: usize,
        skippable: KindPredicate,
    },
}

/// Outcome of classifying one record-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Skip,
    Fail,
    LimitExceeded { limit: usize },
}

impl SkipPolicy {
    /// Skips malformed and invalid records, up to `limit`.
    #[must_use]
    pub fn skip_limit(limit: usize) -> Self {
        Self::skip_when(limit, |kind| {
            matches!(kind, ErrorKind::Malformed | ErrorKind::Invalid)
        })
    }

    /// Skips records whose error kind satisfies `skippable`, up to `limit`.
    pub fn skip_when<F>(limit: usize, skippable: F) -> Self
    where
        F: Fn(&ErrorKind) -> bool + Send + Sync + 'static,
    {
        SkipPolicy::SkipAndContinue {
            limit,
            skippable: Arc::new(skippable),
        }
    }

    /// Classifies `error`, given `skipped` errors were already skipped in this step.
    #[must_use]
    pub fn classify(&self, error: &ItemError, skipped: usize) -> SkipDecision {
        match self {
            SkipPolicy::FailFast => SkipDecision::Fail,
            SkipPolicy::SkipAndContinue { limit, skippable } => {
                if !skippable(&error.kind) {
                    SkipDecision::Fail
                } else if skipped >= *limit {
                    SkipDecision::LimitExceeded { limit: *limit }
                } else {
                    SkipDecision::Skip
                }
            }
        }
    }
}

impl fmt::Debug for SkipPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipPolicy::FailFast => write!(f, "FailFast"),
            SkipPolicy::SkipAndContinue { limit, .. } => f
                .debug_struct("SkipAndContinue")
                .field("limit", limit)
                .finish_non_exhaustive(),
        }
    }
}

/// Bounded retry of chunk commits.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failed commit.
    pub max_retries: u32,
    /// Pause before each retry.
    pub backoff: Duration,
    pub retryable: KindPredicate,
}

impl RetryPolicy {
    /// A single attempt per chunk.
    #[must_use]
    pub fn none() -> Self {
        Self::attempts(0)
    }

    /// Retries I/O and transient failures up to `max_retries` times.
    #[must_use]
    pub fn attempts(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::ZERO,
            retryable: Arc::new(|kind| matches!(kind, ErrorKind::Io | ErrorKind::Transient)),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn retry_when<F>(mut self, retryable: F) -> Self
    where
        F: Fn(&ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(retryable);
        self
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    #[must_use]
    pub fn should_retry(&self, error: &ItemError, attempts: u32) -> bool {
        attempts <= self.max_retries && (self.retryable)(&error.kind)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
