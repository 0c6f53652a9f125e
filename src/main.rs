//! `ironbatch` command-line trigger.
//!
//! `ironbatch import` loads a customer CSV export into a JSON Lines file through
//! a restartable chunk step. With `--ledger` the execution history is kept on
//! disk, so re-running a failed import with the same `--run-id` resumes from
//! the last committed chunk.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ironbatch::logging::{LogConfig, LogLevel, init_logging};
use ironbatch::{
    BatchStatus, CsvSource, EngineConfig, ExecutionLedger, FileLedger, InMemoryLedger, Job, JobEngine,
    JobExecution, JobParameters, JsonlSink, LaunchError, MetricsCollector, PassThrough, RetryPolicy,
    SkipPolicy, StepBuilder,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

const JOB_NAME: &str = "importCustomers";
const STEP_NAME: &str = "csv-step";
const CUSTOMER_FIELDS: [&str; 8] = [
    "id",
    "firstName",
    "lastName",
    "email",
    "gender",
    "contactNo",
    "country",
    "dob",
];

#[derive(Parser, Debug)]
#[command(name = "ironbatch")]
#[command(author, version, about = "Chunk-oriented, restartable batch imports")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import customers from a CSV file into a JSON Lines file
    Import {
        /// Customer CSV export with a header line
        #[arg(short, long)]
        input: PathBuf,

        /// JSON Lines output file
        #[arg(short, long)]
        output: PathBuf,

        /// Execution ledger file; enables restart across runs
        #[arg(long, env = "IRONBATCH_LEDGER")]
        ledger: Option<PathBuf>,

        /// Records per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Maximum concurrent chunk commits
        #[arg(long)]
        concurrency: Option<usize>,

        /// Malformed records to skip before failing
        #[arg(long)]
        skip_limit: Option<usize>,

        /// Retries of a failed chunk commit
        #[arg(long)]
        retry_limit: Option<u32>,

        /// Value of the `startAt` parameter; defaults to the current time in milliseconds
        #[arg(long)]
        run_id: Option<i64>,

        /// Write collected metrics as JSON to this file
        #[arg(long)]
        metrics: Option<PathBuf>,
    },

    /// Show the executions of one import run recorded in a ledger
    Status {
        #[arg(long, env = "IRONBATCH_LEDGER")]
        ledger: PathBuf,

        #[arg(long)]
        run_id: i64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Customer {
    id: u64,
    first_name: String,
    last_name: String,
    email: String,
    gender: String,
    contact_no: String,
    country: String,
    dob: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    match execute(cli.command) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command) -> Result<ExitCode> {
    match command {
        Command::Import {
            input,
            output,
            ledger,
            chunk_size,
            concurrency,
            skip_limit,
            retry_limit,
            run_id,
            metrics,
        } => {
            let mut config = EngineConfig::from_env().context("read IRONBATCH_* configuration")?;
            let defaults = &mut config.step_defaults;
            if let Some(size) = chunk_size {
                defaults.chunk_size = size;
            }
            if let Some(limit) = concurrency {
                defaults.concurrency_limit = limit;
            }
            if let Some(limit) = skip_limit {
                defaults.skip_policy = SkipPolicy::skip_limit(limit);
            }
            if let Some(limit) = retry_limit {
                defaults.retry_policy = RetryPolicy::attempts(limit);
            }

            let sink = match &ledger {
                Some(_) => JsonlSink::<Customer>::append(&output)?,
                None => JsonlSink::<Customer>::create(&output)?,
            };
            let collector = MetricsCollector::new();
            let engine = JobEngine::new(open_ledger(ledger)?, config)?.with_metrics(collector.clone());

            let source = CsvSource::<Customer>::builder(&input)
                .names(CUSTOMER_FIELDS)
                .build();
            let step = StepBuilder::new(STEP_NAME, source, PassThrough, sink)
                .allow_start_if_complete(true)
                .build()?;
            let job = Job::builder(JOB_NAME).step(step).build()?;

            let start_at = run_id.unwrap_or_else(|| Utc::now().timestamp_millis());
            let params = JobParameters::builder().add_long("startAt", start_at).build();

            let execution = match engine.run(&job, params) {
                Ok(execution) => execution,
                Err(
                    e @ (LaunchError::AlreadyRunning { .. }
                    | LaunchError::AlreadyComplete { .. }
                    | LaunchError::NotRestartable { .. }),
                ) => {
                    eprintln!("{e}");
                    return Ok(ExitCode::from(2));
                }
                Err(e) => return Err(e).context("import failed"),
            };

            print_execution(&execution);
            collector.report();
            if let Some(path) = metrics {
                collector.save_to_file(&path)?;
            }
            Ok(if execution.status == BatchStatus::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Status { ledger, run_id } => {
            let engine = JobEngine::new(open_ledger(Some(ledger))?, EngineConfig::default())?;
            let params = JobParameters::builder().add_long("startAt", run_id).build();
            let executions = engine.job_executions(JOB_NAME, &params)?;
            if executions.is_empty() {
                println!("no executions recorded for startAt={run_id}");
            }
            for execution in &executions {
                print_execution(execution);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_ledger(path: Option<PathBuf>) -> Result<Arc<dyn ExecutionLedger>> {
    Ok(match path {
        Some(path) => Arc::new(
            FileLedger::open(&path).with_context(|| format!("open ledger {}", path.display()))?,
        ),
        None => Arc::new(InMemoryLedger::new()),
    })
}

fn print_execution(execution: &JobExecution) {
    println!(
        "execution {} of {}: {}",
        execution.id, execution.job_name, execution.status
    );
    for step in &execution.step_executions {
        println!(
            "  {} {}: read={} write={} skip={} commits={} rollbacks={} checkpoint={}",
            step.step_name,
            step.status,
            step.read_count,
            step.write_count,
            step.skip_count,
            step.commit_count,
            step.rollback_count,
            step.context.position().map_or(0, |p| p.0),
        );
    }
    for failure in &execution.failures {
        println!("  failure: {failure}");
    }
}
