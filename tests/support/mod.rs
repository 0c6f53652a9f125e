//! Ledger wrappers shared by the integration suites.
#![allow(dead_code)]

use ironbatch::ledger::Admission;
use ironbatch::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Delegates to an in-memory ledger, recording every persisted step
/// checkpoint and optionally failing step updates after a budget.
#[derive(Default)]
pub struct ProbeLedger {
    inner: InMemoryLedger,
    checkpoints: Mutex<Vec<(String, Option<Position>)>>,
    step_updates: AtomicUsize,
    fail_after: Option<usize>,
}

impl ProbeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step updates past the first `updates` fail with an I/O error.
    pub fn failing_after(updates: usize) -> Self {
        Self {
            fail_after: Some(updates),
            ..Self::default()
        }
    }

    /// Checkpoints written for `step`, in write order.
    pub fn checkpoints(&self, step: &str) -> Vec<u64> {
        self.checkpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == step)
            .filter_map(|(_, position)| position.map(|p| p.0))
            .collect()
    }
}

pub fn engine_with(ledger: Arc<ProbeLedger>) -> JobEngine {
    JobEngine::new(ledger, EngineConfig::default()).unwrap()
}

impl ExecutionLedger for ProbeLedger {
    fn job_instance(&self, job_name: &str, key: &JobKey) -> Result<Option<JobInstance>, LedgerError> {
        self.inner.job_instance(job_name, key)
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        admit: Admission<'_>,
    ) -> Result<JobExecution, LaunchError> {
        self.inner.create_job_execution(job_name, parameters, admit)
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), LedgerError> {
        self.inner.update_job_execution(execution)
    }

    fn add_step_execution(&self, step: &mut StepExecution) -> Result<(), LedgerError> {
        self.inner.add_step_execution(step)
    }

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), LedgerError> {
        let n = self.step_updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| n >= limit) {
            return Err(LedgerError::Io(std::io::Error::other("ledger volume offline")));
        }
        self.checkpoints
            .lock()
            .unwrap()
            .push((step.step_name.clone(), step.context.position()));
        self.inner.update_step_execution(step)
    }

    fn job_execution(&self, execution_id: u64) -> Result<Option<JobExecution>, LedgerError> {
        self.inner.job_execution(execution_id)
    }

    fn job_executions(&self, instance_id: u64) -> Result<Vec<JobExecution>, LedgerError> {
        self.inner.job_executions(instance_id)
    }

    fn last_step_execution(&self, instance_id: u64, step_name: &str) -> Result<Option<StepExecution>, LedgerError> {
        self.inner.last_step_execution(instance_id, step_name)
    }

    fn step_start_count(&self, instance_id: u64, step_name: &str) -> Result<usize, LedgerError> {
        self.inner.step_start_count(instance_id, step_name)
    }

    fn running_executions(&self, job_name: Option<&str>) -> Result<Vec<JobExecution>, LedgerError> {
        self.inner.running_executions(job_name)
    }
}
