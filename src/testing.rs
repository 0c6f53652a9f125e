//! Testing utilities for batch jobs.
//!
//! Deterministic in-memory collaborators for exercising steps and jobs without
//! real files or databases:
//!
//! - **Sources**: [`VecSource`] replays a vector, can inject read errors at fixed
//!   positions, and records every position it was opened at
//! - **Sinks**: [`RecordingSink`] keeps every committed batch, can fail commits on
//!   demand, tracks how many commits ran at once, and can hold commits behind a [`Gate`]
//! - **Fixtures**: the [`Customer`] record and generators for it
//! - **Mock I/O**: temporary CSV and text files
//!
//! # Quick Start
//!
//! ```
//! use ironbatch::*;
//! use ironbatch::testing::*;
//! use std::sync::Arc;
//!
//! let sink = Arc::new(
//!     RecordingSink::new().fail_when(|n: &u32| *n == 15, ItemError::io("disk full")),
//! );
//! let step = StepBuilder::new("load", VecSource::new((0..25).collect::<Vec<u32>>()), PassThrough, Arc::clone(&sink))
//!     .chunk_size(10)
//!     .concurrency_limit(1)
//!     .build()
//!     .unwrap();
//! let job = Job::builder("numbers").step(step).build().unwrap();
//!
//! let execution = JobEngine::in_memory().run(&job, JobParameters::empty()).unwrap();
//! assert_eq!(execution.status, BatchStatus::Failed);
//! assert_eq!(sink.items(), (0..10).collect::<Vec<u32>>());
//! ```

pub mod fixtures;
pub mod mock_io;
pub mod sinks;
pub mod sources;

pub use fixtures::*;
pub use mock_io::*;
pub use sinks::*;
pub use sources::*;
