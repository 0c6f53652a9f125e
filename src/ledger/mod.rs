//! Durable store of job and step execution metadata.
//!
//! The ledger is the single source of truth for restart decisions and duplicate
//! launch detection. Two implementations ship with the crate:
//!
//! - [`InMemoryLedger`] for tests and one-shot processes;
//! - [`FileLedger`] (feature `file-ledger`), which persists a checksummed
//!   snapshot after every mutation.
//!
//! Executions that reached a terminal status are frozen: updating them again
//! is rejected with [`LedgerError::Integrity`].

mod memory;
#[cfg(feature = "file-ledger")]
mod file;

pub use memory::InMemoryLedger;
#[cfg(feature = "file-ledger")]
pub use file::FileLedger;

use crate::error::{LaunchError, LedgerError};
use crate::execution::{JobExecution, JobInstance, StepExecution};
use crate::parameters::{JobKey, JobParameters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Launch gate evaluated atomically with execution creation.
///
/// Receives the latest execution of the instance (if any) and decides whether a
/// new execution may be created. An error leaves the ledger untouched.
pub type Admission<'a> = &'a mut dyn FnMut(Option<&JobExecution>) -> Result<(), LaunchError>;

/// CRUD over job instances, job executions and step executions.
pub trait ExecutionLedger: Send + Sync {
    /// Looks up the instance for `job_name` and parameter `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    fn job_instance(&self, job_name: &str, key: &JobKey) -> Result<Option<JobInstance>, LedgerError>;

    /// Creates a STARTING execution, and the instance if it does not exist yet,
    /// provided `admit` accepts the instance's latest execution.
    ///
    /// Lookup, admission and creation happen under one lock, so two concurrent
    /// launches of the same instance cannot both be admitted while the first is running.
    ///
    /// # Errors
    ///
    /// Returns whatever `admit` returns, or a ledger failure.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        admit: Admission<'_>,
    ) -> Result<JobExecution, LaunchError>;

    /// Persists status, timestamps and failures of a job execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is unknown, already terminal, or cannot be persisted.
    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), LedgerError>;

    /// Registers a new step execution and assigns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the owning job execution is unknown or the write fails.
    fn add_step_execution(&self, step: &mut StepExecution) -> Result<(), LedgerError>;

    /// Persists counters, status and execution context of a step execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is unknown, already terminal, or cannot be persisted.
    fn update_step_execution(&self, step: &StepExecution) -> Result<(), LedgerError>;

    /// A job execution with its step executions, in start order.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    fn job_execution(&self, execution_id: u64) -> Result<Option<JobExecution>, LedgerError>;

    /// All executions of an instance, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    fn job_executions(&self, instance_id: u64) -> Result<Vec<JobExecution>, LedgerError>;

    /// Latest step execution named `step_name` across every execution of the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    fn last_step_execution(
        &self,
        instance_id: u64,
        step_name: &str,
    ) -> Result<Option<StepExecution>, LedgerError>;

    /// How many times `step_name` was started for the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    fn step_start_count(&self, instance_id: u64, step_name: &str) -> Result<usize, LedgerError>;

    /// Executions still STARTING or STARTED, optionally restricted to one job.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    fn running_executions(&self, job_name: Option<&str>) -> Result<Vec<JobExecution>, LedgerError>;

    /// Latest execution of an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    fn last_job_execution(&self, instance_id: u64) -> Result<Option<JobExecution>, LedgerError> {
        Ok(self.job_executions(instance_id)?.into_iter().next())
    }
}

/// Everything a ledger stores. Job executions are kept without their step
/// executions, which live in their own table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LedgerState {
    next_instance_id: u64,
    next_job_execution_id: u64,
    next_step_execution_id: u64,
    instances: Vec<JobInstance>,
    job_executions: BTreeMap<u64, JobExecution>,
    step_executions: BTreeMap<u64, StepExecution>,
}

impl LedgerState {
    pub(crate) fn job_instance(&self, job_name: &str, key: &JobKey) -> Option<JobInstance> {
        self.instances
            .iter()
            .find(|i| i.job_name == job_name && &i.key == key)
            .cloned()
    }

    pub(crate) fn create_job_execution(
        &mut self,
        job_name: &str,
        parameters: &JobParameters,
        admit: Admission<'_>,
    ) -> Result<JobExecution, LaunchError> {
        let key = parameters.key();
        let existing = self.job_instance(job_name, &key);
        let latest = existing
            .as_ref()
            .and_then(|instance| self.last_job_execution(instance.id));
        admit(latest.as_ref())?;

        let instance = match existing {
            Some(instance) => instance,
            None => {
                self.next_instance_id += 1;
                let instance = JobInstance {
                    id: self.next_instance_id,
                    job_name: job_name.to_string(),
                    key,
                };
                self.instances.push(instance.clone());
                instance
            }
        };

        self.next_job_execution_id += 1;
        let execution = JobExecution::new(self.next_job_execution_id, &instance, parameters.clone());
        self.job_executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    pub(crate) fn update_job_execution(&mut self, execution: &JobExecution) -> Result<(), LedgerError> {
        let stored = self
            .job_executions
            .get_mut(&execution.id)
            .ok_or(LedgerError::NotFound {
                entity: "job execution",
                id: execution.id,
            })?;
        if stored.status.is_terminal() {
            return Err(LedgerError::Integrity(format!(
                "job execution {} is already {}",
                execution.id, stored.status
            )));
        }
        let mut record = execution.clone();
        record.step_executions.clear();
        *stored = record;
        Ok(())
    }

    pub(crate) fn add_step_execution(&mut self, step: &mut StepExecution) -> Result<(), LedgerError> {
        if !self.job_executions.contains_key(&step.job_execution_id) {
            return Err(LedgerError::NotFound {
                entity: "job execution",
                id: step.job_execution_id,
            });
        }
        self.next_step_execution_id += 1;
        step.id = self.next_step_execution_id;
        self.step_executions.insert(step.id, step.clone());
        Ok(())
    }

    pub(crate) fn update_step_execution(&mut self, step: &StepExecution) -> Result<(), LedgerError> {
        let stored = self
            .step_executions
            .get_mut(&step.id)
            .ok_or(LedgerError::NotFound {
                entity: "step execution",
                id: step.id,
            })?;
        if stored.status.is_terminal() {
            return Err(LedgerError::Integrity(format!(
                "step execution {} is already {}",
                step.id, stored.status
            )));
        }
        *stored = step.clone();
        Ok(())
    }

    fn with_steps(&self, execution: &JobExecution) -> JobExecution {
        let mut full = execution.clone();
        full.step_executions = self
            .step_executions
            .values()
            .filter(|s| s.job_execution_id == execution.id)
            .cloned()
            .collect();
        full
    }

    pub(crate) fn job_execution(&self, execution_id: u64) -> Option<JobExecution> {
        self.job_executions
            .get(&execution_id)
            .map(|e| self.with_steps(e))
    }

    pub(crate) fn job_executions(&self, instance_id: u64) -> Vec<JobExecution> {
        self.job_executions
            .values()
            .rev()
            .filter(|e| e.instance_id == instance_id)
            .map(|e| self.with_steps(e))
            .collect()
    }

    pub(crate) fn last_job_execution(&self, instance_id: u64) -> Option<JobExecution> {
        self.job_executions
            .values()
            .rev()
            .find(|e| e.instance_id == instance_id)
            .map(|e| self.with_steps(e))
    }

    fn instance_steps<'a>(
        &'a self,
        instance_id: u64,
        step_name: &'a str,
    ) -> impl Iterator<Item = &'a StepExecution> + 'a {
        self.step_executions.values().filter(move |s| {
            s.step_name == step_name
                && self
                    .job_executions
                    .get(&s.job_execution_id)
                    .is_some_and(|e| e.instance_id == instance_id)
        })
    }

    pub(crate) fn last_step_execution(&self, instance_id: u64, step_name: &str) -> Option<StepExecution> {
        self.instance_steps(instance_id, step_name).last().cloned()
    }

    pub(crate) fn step_start_count(&self, instance_id: u64, step_name: &str) -> usize {
        self.instance_steps(instance_id, step_name).count()
    }

    pub(crate) fn running_executions(&self, job_name: Option<&str>) -> Vec<JobExecution> {
        self.job_executions
            .values()
            .filter(|e| e.status.is_running())
            .filter(|e| job_name.is_none_or(|name| e.job_name == name))
            .map(|e| self.with_steps(e))
            .collect()
    }
}

/// Implements [`ExecutionLedger`] for a type exposing `read` and `write`
/// closures over its [`LedgerState`].
macro_rules! impl_execution_ledger {
    ($ty:ty) => {
        impl $crate::ledger::ExecutionLedger for $ty {
            fn job_instance(
                &self,
                job_name: &str,
                key: &$crate::parameters::JobKey,
            ) -> Result<Option<$crate::execution::JobInstance>, $crate::error::LedgerError> {
                self.read(|s| s.job_instance(job_name, key))
            }

            fn create_job_execution(
                &self,
                job_name: &str,
                parameters: &$crate::parameters::JobParameters,
                admit: $crate::ledger::Admission<'_>,
            ) -> Result<$crate::execution::JobExecution, $crate::error::LaunchError> {
                self.write(|s| s.create_job_execution(job_name, parameters, admit))
            }

            fn update_job_execution(
                &self,
                execution: &$crate::execution::JobExecution,
            ) -> Result<(), $crate::error::LedgerError> {
                self.write(|s| s.update_job_execution(execution))
            }

            fn add_step_execution(
                &self,
                step: &mut $crate::execution::StepExecution,
            ) -> Result<(), $crate::error::LedgerError> {
                self.write(|s| s.add_step_execution(step))
            }

            fn update_step_execution(
                &self,
                step: &$crate::execution::StepExecution,
            ) -> Result<(), $crate::error::LedgerError> {
                self.write(|s| s.update_step_execution(step))
            }

            fn job_execution(
                &self,
                execution_id: u64,
            ) -> Result<Option<$crate::execution::JobExecution>, $crate::error::LedgerError> {
                self.read(|s| s.job_execution(execution_id))
            }

            fn job_executions(
                &self,
                instance_id: u64,
            ) -> Result<Vec<$crate::execution::JobExecution>, $crate::error::LedgerError> {
                self.read(|s| s.job_executions(instance_id))
            }

            fn last_job_execution(
                &self,
                instance_id: u64,
            ) -> Result<Option<$crate::execution::JobExecution>, $crate::error::LedgerError> {
                self.read(|s| s.last_job_execution(instance_id))
            }

            fn last_step_execution(
                &self,
                instance_id: u64,
                step_name: &str,
            ) -> Result<Option<$crate::execution::StepExecution>, $crate::error::LedgerError> {
                self.read(|s| s.last_step_execution(instance_id, step_name))
            }

            fn step_start_count(
                &self,
                instance_id: u64,
                step_name: &str,
            ) -> Result<usize, $crate::error::LedgerError> {
                self.read(|s| s.step_start_count(instance_id, step_name))
            }

            fn running_executions(
                &self,
                job_name: Option<&str>,
            ) -> Result<Vec<$crate::execution::JobExecution>, $crate::error::LedgerError> {
                self.read(|s| s.running_executions(job_name))
            }
        }
    };
}

pub(crate) use impl_execution_ledger;
