//! # Ironbatch
//!
//! A **chunk-oriented batch engine** for Rust. Ironbatch reads records from a
//! finite source, transforms them, and commits them to a sink in fixed-size
//! transactional chunks, with a bounded pool of concurrent commits, skip and
//! retry policies, and restart from the last committed checkpoint.
//!
//! ## Key Features
//!
//! - **Chunked commits** - each chunk is committed all-or-nothing and advances the checkpoint only once durable
//! - **Bounded concurrency** - at most `concurrency_limit` chunk commits run at once, with backpressure on the reader
//! - **Ordered checkpoints** - commits may finish out of order, checkpoints never jump past a pending chunk
//! - **Restartable jobs** - a FAILED or STOPPED run resumes where it left off; completed steps are not re-run
//! - **Duplicate-launch protection** - one running execution per job instance, decided atomically by the ledger
//! - **Skip and retry policies** - skip malformed records up to a limit, retry transient commit failures
//! - **Pluggable I/O** - implement [`ItemSource`], [`ItemTransform`] and [`ItemSink`], or use the CSV and JSON Lines adapters
//!
//! ## Quick Start
//!
//! ```
//! use ironbatch::*;
//! use ironbatch::testing::{RecordingSink, VecSource};
//! use std::sync::Arc;
//! # fn main() -> anyhow::Result<()> {
//!
//! let sink = Arc::new(RecordingSink::new());
//! let step = StepBuilder::new(
//!     "double",
//!     VecSource::new((1..=25).collect::<Vec<u64>>()),
//!     FnTransform(|n: u64| Ok::<_, ItemError>(Some(n * 2))),
//!     Arc::clone(&sink),
//! )
//! .chunk_size(10)
//! .concurrency_limit(2)
//! .build()?;
//! let job = Job::builder("doubler").step(step).build()?;
//!
//! let engine = JobEngine::in_memory();
//! let params = JobParameters::builder().add_long("startAt", 1).build();
//! let execution = engine.run(&job, params.clone())?;
//! assert_eq!(execution.status, BatchStatus::Completed);
//! assert_eq!(execution.step_executions[0].write_count, 25);
//!
//! // The same parameters name the same instance, which already completed.
//! assert!(matches!(
//!     engine.run(&job, params),
//!     Err(LaunchError::AlreadyComplete { .. })
//! ));
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs, instances and executions
//!
//! A [`Job`] is an ordered list of [`Step`]s. Running it with a set of
//! [`JobParameters`] addresses a [`JobInstance`], identified by the job name
//! and the identifying parameters. Every attempt is a [`JobExecution`] holding
//! one [`StepExecution`] per step started.
//!
//! ### Chunk steps
//!
//! [`ChunkStep`] (built with [`StepBuilder`]) is the workhorse. The generation
//! loop reads and transforms records sequentially; finished chunks are handed to
//! a commit pool. See [`chunk`] for the full algorithm.
//!
//! ### Ledger
//!
//! The [`ExecutionLedger`] stores instances, executions and checkpoints. Use
//! [`InMemoryLedger`] in tests, [`FileLedger`] (feature `file-ledger`) to
//! restart across processes.
//!
//! ## Feature Flags
//!
//! - `io-csv` - [`io::csv::CsvSource`]
//! - `io-jsonl` - [`io::jsonl::JsonlSink`]
//! - `file-ledger` - [`FileLedger`], persisted with `postcard`
//!
//! ## Module Overview
//!
//! - [`engine`] - launching, stopping and inspecting jobs
//! - [`job`] / [`step`] / [`chunk`] - execution layers, outermost first
//! - [`item`] - source, transform and sink capabilities
//! - [`policy`] - skip and retry policies
//! - [`ledger`] - execution metadata storage
//! - [`execution`] / [`parameters`] - the data model
//! - [`config`] / [`logging`] / [`metrics`] - ambient setup
//! - [`testing`] - in-memory sources and sinks with failure injection

pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod io;
pub mod item;
pub mod job;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod parameters;
pub mod policy;
pub mod step;
pub mod testing;

pub use config::{EngineConfig, StepDefaults};
pub use engine::{JobEngine, JobHandle};
pub use error::{ConfigError, ErrorKind, ItemError, LaunchError, LedgerError, StepError};
pub use execution::{
    BatchStatus, ExecutionContext, JobExecution, JobInstance, Position, StepContribution, StepExecution,
};
pub use item::{FnSink, FnTransform, ItemCursor, ItemSink, ItemSource, ItemTransform, PassThrough};
pub use job::{Job, JobBuilder};
pub use ledger::{ExecutionLedger, InMemoryLedger};
pub use metrics::MetricsCollector;
pub use parameters::{JobKey, JobParameter, JobParameters, JobParametersBuilder, ParameterValue, ParametersValidator};
pub use policy::{RetryPolicy, SkipPolicy};
pub use step::{ChunkStep, Step, StepBuilder, StepOutcome, StopSignal};

#[cfg(feature = "file-ledger")]
pub use ledger::FileLedger;

#[cfg(feature = "io-csv")]
pub use io::csv::CsvSource;

#[cfg(feature = "io-jsonl")]
pub use io::jsonl::{JsonlSink, read_jsonl_vec};
