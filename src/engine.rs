//! The public entry point: launching, stopping and inspecting jobs.
//!
//! [`JobEngine::run`] decides, atomically against the [`ExecutionLedger`],
//! whether a `(job, parameters)` pair starts fresh, resumes a FAILED or STOPPED
//! instance, or is rejected:
//!
//! | Latest execution of the instance | Outcome |
//! |---|---|
//! | none | fresh execution |
//! | STARTING or STARTED | [`LaunchError::AlreadyRunning`] |
//! | COMPLETED | [`LaunchError::AlreadyComplete`], or a fresh execution if the job allows restarting completed runs |
//! | FAILED or STOPPED | restart, or [`LaunchError::NotRestartable`] for jobs built with `prevent_restart` |
//!
//! Rejected launches leave the ledger untouched.

use crate::config::EngineConfig;
use crate::error::{ConfigError, LaunchError, LedgerError};
use crate::execution::{BatchStatus, JobExecution, JobInstance, StepExecution};
use crate::job::{Job, JobRun, LaunchMode};
use crate::ledger::{ExecutionLedger, InMemoryLedger};
use crate::metrics::MetricsCollector;
use crate::parameters::JobParameters;
use crate::step::StopSignal;
use chrono::Utc;
use std::collections::HashMap;
use std::panic;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Launches jobs against one execution ledger.
pub struct JobEngine {
    ledger: Arc<dyn ExecutionLedger>,
    config: EngineConfig,
    metrics: Option<MetricsCollector>,
    running: Mutex<HashMap<u64, StopSignal>>,
}

/// An admitted execution that has not been driven yet.
struct Launch {
    execution: JobExecution,
    mode: LaunchMode,
    stop: StopSignal,
}

impl JobEngine {
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(ledger: Arc<dyn ExecutionLedger>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            ledger,
            config,
            metrics: None,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Engine over a fresh [`InMemoryLedger`] with default configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            ledger: Arc::new(InMemoryLedger::new()),
            config: EngineConfig::default(),
            metrics: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Publishes step counters and commit latencies to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn ExecutionLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn metrics(&self) -> Option<&MetricsCollector> {
        self.metrics.as_ref()
    }

    fn running(&self) -> MutexGuard<'_, HashMap<u64, StopSignal>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `job` to a terminal status on the calling thread.
    ///
    /// The returned execution carries its step executions as recorded in the
    /// ledger. A step failure is reported through the execution's status, not
    /// as an error.
    ///
    /// # Errors
    ///
    /// Returns a launch rejection (nothing is recorded), or the ledger failure
    /// that aborted the run.
    pub fn run(&self, job: &Job, parameters: JobParameters) -> Result<JobExecution, LaunchError> {
        let launch = self.launch(job, parameters)?;
        self.drive(job, launch)
    }

    /// Admits the launch synchronously, then runs the job on a background thread.
    ///
    /// # Errors
    ///
    /// Returns the same launch rejections as [`run`](Self::run), or
    /// [`LaunchError::Spawn`] if no thread could be started.
    pub fn submit(self: &Arc<Self>, job: Arc<Job>, parameters: JobParameters) -> Result<JobHandle, LaunchError> {
        let launch = self.launch(&job, parameters)?;
        let execution = launch.execution.clone();
        let id = execution.id;
        let engine = Arc::clone(self);

        let spawned = thread::Builder::new()
            .name(format!("job-{}-{id}", job.name()))
            .spawn(move || engine.drive(&job, launch));

        match spawned {
            Ok(thread) => Ok(JobHandle {
                engine: Arc::clone(self),
                execution,
                thread,
            }),
            Err(e) => {
                self.running().remove(&id);
                let mut failed = execution;
                failed.status = BatchStatus::Failed;
                failed.end_time = Some(Utc::now());
                failed.failures.push(format!("could not start job thread: {e}"));
                if let Err(also) = self.ledger.update_job_execution(&failed) {
                    warn!(execution_id = id, error = %also, "could not record launch failure");
                }
                Err(LaunchError::Spawn(e))
            }
        }
    }

    fn launch(&self, job: &Job, parameters: JobParameters) -> Result<Launch, LaunchError> {
        if let Some(validator) = job.validator() {
            validator
                .validate(&parameters)
                .map_err(LaunchError::InvalidParameters)?;
        }

        let allow_complete = job
            .allow_start_if_complete()
            .unwrap_or(self.config.restart_completed_by_default);
        let mut mode = LaunchMode::Fresh;
        let mut admit = |latest: Option<&JobExecution>| -> Result<(), LaunchError> {
            let Some(latest) = latest else {
                return Ok(());
            };
            match latest.status {
                status if status.is_running() => Err(LaunchError::AlreadyRunning {
                    job: job.name().to_string(),
                    execution_id: latest.id,
                }),
                BatchStatus::Completed if allow_complete => Ok(()),
                BatchStatus::Completed => Err(LaunchError::AlreadyComplete {
                    job: job.name().to_string(),
                    instance_id: latest.instance_id,
                }),
                status if !job.is_restartable() => Err(LaunchError::NotRestartable {
                    job: job.name().to_string(),
                    execution_id: latest.id,
                    status,
                }),
                _ => {
                    mode = LaunchMode::Restart;
                    Ok(())
                }
            }
        };
        let execution = self
            .ledger
            .create_job_execution(job.name(), &parameters, &mut admit)?;

        let stop = StopSignal::new();
        self.running().insert(execution.id, stop.clone());
        info!(
            job = job.name(),
            execution_id = execution.id,
            instance_id = execution.instance_id,
            mode = ?mode,
            "job launched"
        );
        Ok(Launch {
            execution,
            mode,
            stop,
        })
    }

    fn drive(&self, job: &Job, launch: Launch) -> Result<JobExecution, LaunchError> {
        let Launch {
            mut execution,
            mode,
            stop,
        } = launch;
        let run = JobRun {
            ledger: self.ledger.as_ref(),
            defaults: &self.config.step_defaults,
            stop: &stop,
            metrics: self.metrics.as_ref(),
            mode,
        };
        let result = job.execute(&mut execution, &run);
        self.running().remove(&execution.id);
        result?;

        self.ledger
            .job_execution(execution.id)?
            .ok_or(LaunchError::Ledger(LedgerError::NotFound {
                entity: "job execution",
                id: execution.id,
            }))
    }

    /// Asks a running execution to stop after its in-flight chunks.
    ///
    /// Returns `false` if this engine is not running the execution.
    pub fn stop(&self, execution_id: u64) -> bool {
        match self.running().get(&execution_id) {
            Some(signal) => {
                info!(execution_id, "stop requested");
                signal.request();
                true
            }
            None => false,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn job_execution(&self, execution_id: u64) -> Result<Option<JobExecution>, LedgerError> {
        self.ledger.job_execution(execution_id)
    }

    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn job_instance(&self, job_name: &str, parameters: &JobParameters) -> Result<Option<JobInstance>, LedgerError> {
        self.ledger.job_instance(job_name, &parameters.key())
    }

    /// Every execution of the `(job_name, parameters)` instance, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn job_executions(&self, job_name: &str, parameters: &JobParameters) -> Result<Vec<JobExecution>, LedgerError> {
        match self.job_instance(job_name, parameters)? {
            Some(instance) => self.ledger.job_executions(instance.id),
            None => Ok(Vec::new()),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn last_execution(&self, job_name: &str, parameters: &JobParameters) -> Result<Option<JobExecution>, LedgerError> {
        match self.job_instance(job_name, parameters)? {
            Some(instance) => self.ledger.last_job_execution(instance.id),
            None => Ok(None),
        }
    }

    /// Step executions of one job execution, in start order.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn step_executions(&self, execution_id: u64) -> Result<Vec<StepExecution>, LedgerError> {
        Ok(self
            .ledger
            .job_execution(execution_id)?
            .map(|e| e.step_executions)
            .unwrap_or_default())
    }

    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn running_executions(&self, job_name: Option<&str>) -> Result<Vec<JobExecution>, LedgerError> {
        self.ledger.running_executions(job_name)
    }
}

/// A job running on a background thread.
pub struct JobHandle {
    engine: Arc<JobEngine>,
    execution: JobExecution,
    thread: JoinHandle<Result<JobExecution, LaunchError>>,
}

impl JobHandle {
    #[must_use]
    pub fn execution_id(&self) -> u64 {
        self.execution.id
    }

    /// The execution as admitted, in STARTING.
    #[must_use]
    pub fn launched(&self) -> &JobExecution {
        &self.execution
    }

    /// The execution as currently recorded in the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn current(&self) -> Result<Option<JobExecution>, LedgerError> {
        self.engine.job_execution(self.execution.id)
    }

    /// See [`JobEngine::stop`].
    pub fn stop(&self) -> bool {
        self.engine.stop(self.execution.id)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the job to reach a terminal status.
    ///
    /// # Errors
    ///
    /// Returns the ledger failure that aborted the run.
    pub fn join(self) -> Result<JobExecution, LaunchError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
