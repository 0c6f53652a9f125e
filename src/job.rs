//! Jobs: ordered compositions of steps, and the driver that runs them.
//!
//! A job runs its steps strictly in declaration order. The first step that does
//! not complete ends the job: a failed step fails the job, a stopped step stops
//! it. On restart, steps whose last execution completed are not run again
//! unless they opt in with `allow_start_if_complete`, and the first unfinished
//! step resumes from the checkpoint its previous execution recorded.

use crate::chunk::panic_message;
use crate::config::StepDefaults;
use crate::error::{ConfigError, LedgerError, StepError};
use crate::execution::{BatchStatus, JobExecution, StepExecution};
use crate::ledger::ExecutionLedger;
use crate::metrics::MetricsCollector;
use crate::parameters::ParametersValidator;
use crate::step::{Step, StepOutcome, StepScope, StopSignal};
use chrono::Utc;
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, info_span, warn};

/// A named, ordered list of steps plus its launch rules.
pub struct Job {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    restartable: bool,
    allow_start_if_complete: Option<bool>,
    validator: Option<ParametersValidator>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("steps", &self.step_names().collect::<Vec<_>>())
            .field("restartable", &self.restartable)
            .field("allow_start_if_complete", &self.allow_start_if_complete)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            steps: Vec::new(),
            restartable: true,
            allow_start_if_complete: None,
            validator: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name())
    }

    /// Whether a FAILED or STOPPED instance of this job may be relaunched.
    #[must_use]
    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    /// Job-level override of the engine's restart-of-completed default.
    #[must_use]
    pub fn allow_start_if_complete(&self) -> Option<bool> {
        self.allow_start_if_complete
    }

    #[must_use]
    pub fn validator(&self) -> Option<&ParametersValidator> {
        self.validator.as_ref()
    }

    /// Runs every step against an execution the engine has just admitted.
    ///
    /// The execution is moved to STARTED, then to its terminal status once the
    /// steps are done; both transitions are persisted before returning.
    ///
    /// # Errors
    ///
    /// Returns the ledger failure that aborted the run. The execution has been
    /// marked FAILED in memory and, if the ledger still accepts writes, on disk.
    pub(crate) fn execute(&self, execution: &mut JobExecution, run: &JobRun<'_>) -> Result<(), LedgerError> {
        let span = info_span!("job", job = %self.name, execution_id = execution.id);
        let _enter = span.enter();

        execution.status = BatchStatus::Started;
        execution.start_time = Some(Utc::now());
        run.ledger.update_job_execution(execution)?;
        if let Some(metrics) = run.metrics {
            metrics.record_start();
        }
        info!(mode = ?run.mode, "job started");

        let outcome = self.run_steps(execution, run);
        let status = match &outcome {
            Ok(status) => *status,
            Err(e) => {
                execution.failures.push(e.to_string());
                BatchStatus::Failed
            }
        };
        execution.status = status;
        execution.end_time = Some(Utc::now());
        let persisted = run.ledger.update_job_execution(execution);

        if let Some(metrics) = run.metrics {
            metrics.record_end();
        }

        match outcome {
            Err(e) => {
                if let Err(also) = persisted {
                    warn!(error = %also, "could not record job failure");
                }
                error!(error = %e, "job aborted by ledger failure");
                Err(e)
            }
            Ok(_) => {
                persisted?;
                info!(status = %status, "job finished");
                Ok(())
            }
        }
    }

    fn run_steps(&self, execution: &mut JobExecution, run: &JobRun<'_>) -> Result<BatchStatus, LedgerError> {
        for step in &self.steps {
            let name = step.name();
            if run.stop.is_requested() {
                info!(next_step = name, "stop requested before step");
                return Ok(BatchStatus::Stopped);
            }

            let prior = match run.mode {
                LaunchMode::Restart => run.ledger.last_step_execution(execution.instance_id, name)?,
                LaunchMode::Fresh => None,
            };
            if let Some(prior) = &prior
                && prior.status == BatchStatus::Completed
                && !step.allow_start_if_complete()
            {
                info!(step = name, "step already completed for this instance, not re-running");
                continue;
            }
            let resume = prior.filter(|p| p.status.is_restartable());

            if let Some(limit) = step.start_limit()
                && run.ledger.step_start_count(execution.instance_id, name)? >= limit
            {
                let err = StepError::StartLimitExceeded {
                    step: name.to_string(),
                    limit,
                };
                error!(step = name, error = %err, "step not started");
                execution.failures.push(err.to_string());
                return Ok(BatchStatus::Failed);
            }

            let step_execution = self.run_step(step.as_ref(), execution, resume.as_ref(), run)?;
            let status = step_execution.status;
            if let Some(failure) = &step_execution.failure {
                execution.failures.push(format!("step {name:?}: {failure}"));
            }
            execution.step_executions.push(step_execution);

            match status {
                BatchStatus::Completed => {}
                other => return Ok(other),
            }
        }
        Ok(BatchStatus::Completed)
    }

    fn run_step(
        &self,
        step: &dyn Step,
        execution: &JobExecution,
        resume: Option<&StepExecution>,
        run: &JobRun<'_>,
    ) -> Result<StepExecution, LedgerError> {
        let mut step_execution = StepExecution::new(execution.id, step.name());
        run.ledger.add_step_execution(&mut step_execution)?;
        step_execution.status = BatchStatus::Started;
        step_execution.start_time = Some(Utc::now());
        run.ledger.update_step_execution(&step_execution)?;

        let span = info_span!("step", step = step.name(), step_execution_id = step_execution.id);
        let _enter = span.enter();

        let scope = StepScope {
            ledger: run.ledger,
            defaults: run.defaults,
            stop: run.stop,
            metrics: run.metrics,
            resume,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            step.execute(&mut step_execution, &scope)
        }))
        .unwrap_or_else(|payload| {
            Err(StepError::Panicked {
                stage: "step",
                message: panic_message(payload.as_ref()),
            })
        });

        let (status, failure) = match &result {
            Ok(StepOutcome::Completed) => (BatchStatus::Completed, None),
            Ok(StepOutcome::Stopped) => (BatchStatus::Stopped, None),
            Err(e) => (BatchStatus::Failed, Some(e.to_string())),
        };
        step_execution.finish(status, failure);
        let persisted = run.ledger.update_step_execution(&step_execution);
        if let Some(metrics) = run.metrics {
            metrics.publish_step(&step_execution);
        }

        if let Err(StepError::Ledger(e)) = result {
            if let Err(also) = persisted {
                warn!(error = %also, "could not record step failure");
            }
            return Err(e);
        }
        persisted?;

        info!(
            status = %step_execution.status,
            read = step_execution.read_count,
            write = step_execution.write_count,
            skip = step_execution.skip_count,
            commits = step_execution.commit_count,
            rollbacks = step_execution.rollback_count,
            checkpoint = step_execution.context.position().map(|p| p.0),
            "step finished"
        );
        Ok(step_execution)
    }
}

/// Builder for [`Job`].
pub struct JobBuilder {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    restartable: bool,
    allow_start_if_complete: Option<bool>,
    validator: Option<ParametersValidator>,
}

impl JobBuilder {
    /// Appends a step; steps run in the order they are added.
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    #[must_use]
    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Rejects relaunching a FAILED or STOPPED instance.
    #[must_use]
    pub fn prevent_restart(mut self) -> Self {
        self.restartable = false;
        self
    }

    /// Allows launching a fresh execution of an instance that already completed.
    #[must_use]
    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = Some(allow);
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: ParametersValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// # Errors
    ///
    /// Rejects a job without steps or with two steps of the same name.
    pub fn build(self) -> Result<Job, ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::EmptyJob(self.name));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(ConfigError::DuplicateStep(step.name().to_string()));
            }
        }
        Ok(Job {
            name: self.name,
            steps: self.steps,
            restartable: self.restartable,
            allow_start_if_complete: self.allow_start_if_complete,
            validator: self.validator,
        })
    }
}

/// Whether an admitted execution starts from scratch or resumes a previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaunchMode {
    Fresh,
    Restart,
}

/// What the engine hands the job driver for one execution.
pub(crate) struct JobRun<'a> {
    pub ledger: &'a dyn ExecutionLedger,
    pub defaults: &'a StepDefaults,
    pub stop: &'a StopSignal,
    pub metrics: Option<&'a MetricsCollector>,
    pub mode: LaunchMode,
}
