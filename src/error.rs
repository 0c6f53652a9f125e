//! Error types for batch execution.
//!
//! Errors are split by where they surface:
//!
//! - [`ItemError`] is raised by sources, transforms and sinks. Its [`ErrorKind`] is
//!   what the skip and retry policies classify.
//! - [`LedgerError`] is a durability failure of the execution ledger. It is always fatal.
//! - [`StepError`] is the terminal reason a step failed.
//! - [`LaunchError`] is what [`JobEngine::run`](crate::JobEngine::run) returns when a job
//!   cannot be launched, or when the ledger fails mid-run.

use crate::execution::{BatchStatus, Position};
use std::fmt;
use thiserror::Error;

/// Classification of a record-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The raw record could not be parsed (wrong field count, bad number, ...).
    Malformed,
    /// The record parsed but failed a business rule.
    Invalid,
    /// Underlying I/O failed.
    Io,
    /// A failure expected to go away on retry (lock timeout, dropped connection).
    Transient,
    /// Anything else, tagged by the caller.
    Other(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Malformed => write!(f, "malformed"),
            ErrorKind::Invalid => write!(f, "invalid"),
            ErrorKind::Io => write!(f, "io"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Other(tag) => write!(f, "{tag}"),
        }
    }
}

/// A failure raised by an item source, transform or sink.
#[derive(Debug, Clone, Error)]
#[error("{kind} error{}: {message}", position.map(|p| format!(" at {p}")).unwrap_or_default())]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
    /// Source position of the offending record, when known.
    pub position: Option<Position>,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Attach the source position of the offending record.
    #[must_use]
    pub fn at(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

impl From<std::io::Error> for ItemError {
    fn from(err: std::io::Error) -> Self {
        ItemError::io(err.to_string())
    }
}

/// Durability failure of the execution ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger encoding error: {0}")]
    Encode(String),

    #[error("ledger integrity check failed: {0}")]
    Integrity(String),

    #[error("{entity} {id} not found in ledger")]
    NotFound { entity: &'static str, id: u64 },

    #[error("ledger lock poisoned")]
    Poisoned,
}

/// Invalid engine or step configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("concurrency limit must be greater than zero")]
    ZeroConcurrency,

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("job {0:?} has no steps")]
    EmptyJob(String),

    #[error("duplicate step name {0:?}")]
    DuplicateStep(String),
}

/// Why a step terminated in FAILED.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("source failed: {0}")]
    Source(ItemError),

    #[error("transform failed: {0}")]
    Transform(ItemError),

    #[error("sink commit failed after {attempts} attempt(s): {error}")]
    Sink { error: ItemError, attempts: u32 },

    #[error("skip limit of {limit} exceeded: {error}")]
    SkipLimitExceeded { limit: usize, error: ItemError },

    #[error("step {step:?} reached its start limit of {limit}")]
    StartLimitExceeded { step: String, limit: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{stage} panicked: {message}")]
    Panicked { stage: &'static str, message: String },

    #[error("commit worker pool unavailable: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl StepError {
    /// Ledger failures abort the whole job instead of only failing the step.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::Ledger(_))
    }
}

/// Why [`JobEngine::run`](crate::JobEngine::run) did not hand back an execution.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("job {job:?} already has a running execution ({execution_id}) for these parameters")]
    AlreadyRunning { job: String, execution_id: u64 },

    #[error("job {job:?} already completed for these parameters (instance {instance_id})")]
    AlreadyComplete { job: String, instance_id: u64 },

    #[error("job {job:?} is not restartable (last execution {execution_id} ended {status})")]
    NotRestartable {
        job: String,
        execution_id: u64,
        status: BatchStatus,
    },

    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error("could not start job thread: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
