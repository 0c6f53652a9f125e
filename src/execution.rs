//! Execution metadata: instances, executions, statuses and checkpoints.
//!
//! These are the records the [`ExecutionLedger`](crate::ledger::ExecutionLedger) stores.
//! A [`JobInstance`] is the logical run identified by job name and identifying
//! parameters; every attempt to run it is a [`JobExecution`] holding one
//! [`StepExecution`] per step that was started.

use crate::parameters::{JobKey, JobParameters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Offset into an item source: the number of raw records consumed so far.
///
/// A position is always a chunk boundary when it is persisted as a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(pub u64);

impl Position {
    pub const START: Position = Position(0);

    #[must_use]
    pub fn next(self) -> Position {
        Position(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status shared by job and step executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Starting,
    Started,
    Completed,
    Failed,
    Stopped,
}

impl BatchStatus {
    /// Starting or started.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, BatchStatus::Starting | BatchStatus::Started)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !self.is_running()
    }

    /// Failed or stopped: the instance may be resumed.
    #[must_use]
    pub fn is_restartable(self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Stopped)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Opaque checkpoint state persisted with a step execution.
///
/// Values are JSON so that any source can stash what it needs to re-seek. The
/// chunk processor itself only uses [`ExecutionContext::position`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: BTreeMap<String, String>,
}

const POSITION_KEY: &str = "source.position";

impl ExecutionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous entry.
    pub fn put(&mut self, key: impl Into<String>, value: &Value) {
        self.entries.insert(key.into(), value.to_string());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .get(key)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last committed source position, if a chunk ever committed.
    #[must_use]
    pub fn position(&self) -> Option<Position> {
        self.get(POSITION_KEY)
            .and_then(|v| v.as_u64())
            .map(Position)
    }

    pub fn set_position(&mut self, position: Position) {
        self.put(POSITION_KEY, &Value::from(position.0));
    }
}

/// Logical run identity: job name plus identifying parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: u64,
    pub job_name: String,
    pub key: JobKey,
}

/// One attempt to run a [`JobInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: u64,
    pub instance_id: u64,
    pub job_name: String,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Failure descriptions, first cause first.
    pub failures: Vec<String>,
    /// Populated by ledger reads; the ledger stores step executions separately.
    pub step_executions: Vec<StepExecution>,
}

impl JobExecution {
    #[must_use]
    pub fn new(id: u64, instance: &JobInstance, parameters: JobParameters) -> Self {
        Self {
            id,
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            parameters,
            status: BatchStatus::Starting,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            failures: Vec::new(),
            step_executions: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    #[must_use]
    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .find(|s| s.step_name == step_name)
    }
}

/// Counters accumulated by one committed chunk, applied to a [`StepExecution`]
/// only once the chunk's checkpoint is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepContribution {
    pub read_count: u64,
    pub write_count: u64,
    pub skip_count: u64,
    pub filter_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
}

/// One attempt to run a step within a [`JobExecution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: u64,
    pub job_execution_id: u64,
    pub step_name: String,
    pub status: BatchStatus,
    pub read_count: u64,
    pub write_count: u64,
    /// Records dropped from their chunk: read skips, transform skips and filtered records.
    pub skip_count: u64,
    /// Records the transform asked to skip. Included in `skip_count`.
    pub filter_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub context: ExecutionContext,
    pub failure: Option<String>,
}

impl StepExecution {
    #[must_use]
    pub fn new(job_execution_id: u64, step_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            read_count: 0,
            write_count: 0,
            skip_count: 0,
            filter_count: 0,
            commit_count: 0,
            rollback_count: 0,
            start_time: None,
            end_time: None,
            context: ExecutionContext::new(),
            failure: None,
        }
    }

    /// Adds a chunk's counters. Returns `false`, leaving the execution untouched,
    /// once the execution has reached a terminal status.
    pub fn apply(&mut self, contribution: &StepContribution) -> bool {
        if !self.status.is_running() {
            return false;
        }
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.skip_count += contribution.skip_count;
        self.filter_count += contribution.filter_count;
        self.commit_count += contribution.commit_count;
        self.rollback_count += contribution.rollback_count;
        true
    }

    /// Moves to a terminal status, stamping the end time.
    pub fn finish(&mut self, status: BatchStatus, failure: Option<String>) {
        self.status = status;
        self.failure = failure;
        self.end_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_round_trips_position() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.position(), None);
        ctx.set_position(Position(40));
        assert_eq!(ctx.position(), Some(Position(40)));
        ctx.put("reader.name", &Value::from("csv-reader"));
        assert_eq!(ctx.get("reader.name"), Some(Value::from("csv-reader")));
    }

    #[test]
    fn counters_freeze_after_terminal_status() {
        let mut step = StepExecution::new(1, "load");
        step.status = BatchStatus::Started;
        let chunk = StepContribution {
            read_count: 10,
            write_count: 9,
            skip_count: 1,
            commit_count: 1,
            ..Default::default()
        };
        assert!(step.apply(&chunk));
        step.finish(BatchStatus::Completed, None);
        assert!(!step.apply(&chunk));
        assert_eq!(step.read_count, 10);
        assert_eq!(step.write_count, 9);
        assert_eq!(step.commit_count, 1);
    }

    #[test]
    fn status_classification() {
        assert!(BatchStatus::Starting.is_running());
        assert!(BatchStatus::Stopped.is_restartable());
        assert!(!BatchStatus::Completed.is_restartable());
        assert_eq!(BatchStatus::Failed.to_string(), "FAILED");
    }
}
