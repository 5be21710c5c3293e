//! Command-line interface and monitor execution module.
//!
//! This module provides the CLI structure and the top-level run logic:
//! load and validate the configuration, enqueue jobs, then hand control to
//! the scheduler until completion or a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alarm::{AlarmDispatcher, AlarmInfo, AlertSink, JobSummary};
use crate::config::{self, job::JobConfigError};
use crate::db::{PoolRegistry, DEFAULT_POOL_SIZE};
use crate::errors::{MonitorError, Result};
use crate::probe::ProbeExecutor;
use crate::scheduler::{spawn_signal_listener, Scheduler, SchedulerOpts};
use crate::time::{Clock, SystemClock};

/// Command-line interface structure for the datamon scheduler.
#[derive(Parser, Debug)]
#[command(
    name = "datamon",
    version,
    about = "Monitor database data with scheduled SQL probes, alert on failures.",
    long_about = "Monitor database data with scheduled SQL probes, alert on failures.\n\n\
Resources:\n  • Job config: sectioned key/value files declaring probes, validators and alert policy\n  • Datasource config: named database connection parameters\n  • Execution: due-time dispatch → SQL probe → validator expression → IM/email alerts"
)]
pub struct Cli {
    /// Path of a job config file; repeatable, glob patterns expand.
    #[arg(
        long = "config-file",
        short = 'c',
        value_name = "PATH",
        help = "job config file, repeatable; defaults to job.cfg in CWD"
    )]
    pub config_files: Vec<String>,

    /// Path of the datasource config file.
    #[arg(
        long = "db-config-file",
        value_name = "PATH",
        default_value = "database.cfg"
    )]
    pub db_config_file: String,

    /// Restrict the run to the given job(s); repeatable.
    #[arg(long = "job", short = 'j', value_name = "NAME")]
    pub job_names: Vec<String>,

    /// Run immediately, ignoring due_time. Requires at least one explicit
    /// -j (prevents accidental mass-alerting).
    #[arg(long = "force")]
    pub force: bool,

    /// Emit logs in JSON format.
    #[arg(long = "log-json")]
    pub log_json: bool,

    /// Set log level (overrides env vars like RUST_LOG).
    ///
    /// Example: info,warn,debug
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

/// Default job config file when no `-c` is given.
const DEFAULT_JOB_CONFIG: &str = "job.cfg";

/// Expand the repeatable `-c` arguments through glob patterns. A pattern
/// matching nothing is fatal, as is a missing literal path.
fn expand_config_paths(args: &[String]) -> Result<Vec<PathBuf>> {
    let patterns: Vec<String> = if args.is_empty() {
        vec![DEFAULT_JOB_CONFIG.to_string()]
    } else {
        args.to_vec()
    };
    let mut paths = Vec::new();
    for pattern in &patterns {
        let mut matched = false;
        for entry in glob::glob(pattern)? {
            let path = entry.map_err(|err| {
                MonitorError::Config(format!("can not read {pattern:?}: {err}"))
            })?;
            matched = true;
            paths.push(path);
        }
        if !matched {
            return Err(MonitorError::Config(format!(
                "job config file {pattern:?} not exists"
            )));
        }
    }
    Ok(paths)
}

/// Dispatch a config-error alert to the recipients that could be parsed
/// before validation failed, then carry on with the remaining jobs.
async fn report_config_error(alerts: &dyn AlertSink, err: &JobConfigError) {
    error!("job [{}] config error: {}", err.job_name, err.reason);
    let summary = JobSummary::named(&err.job_name);
    let info = AlarmInfo::config_error(err.reason.clone());
    alerts
        .dispatch(&summary, &err.alarm_im, &err.alarm_email, &info)
        .await;
}

/// Main monitor execution function.
///
/// 1. Expands and loads the config files, aborting on job-name conflicts
/// 2. Validates every requested job, alerting and skipping broken ones
/// 3. Runs the scheduler until all jobs finish or a signal arrives
///
/// # Errors
///
/// Returns an error only for pre-scheduling fatal conditions: missing
/// config files, datasource config errors, conflicting or unknown job
/// names. Per-job config errors alert and skip instead.
pub async fn run_monitor(cli: &Cli) -> Result<()> {
    dotenvy::dotenv().ok();
    crate::context::install_defaults();

    if cli.force && cli.job_names.is_empty() {
        return Err(MonitorError::Config(
            "--force requires at least one explicit --job".into(),
        ));
    }

    let job_config_files = expand_config_paths(&cli.config_files)?;
    let db_config_path = PathBuf::from(&cli.db_config_file);
    if !db_config_path.is_file() {
        return Err(MonitorError::Config(format!(
            "database config file {:?} not exists",
            cli.db_config_file
        )));
    }

    // job files may not share section names
    if let Some((name, first, second)) = config::detect_conflict(&job_config_files)? {
        return Err(MonitorError::Conflict {
            name,
            first: first.display().to_string(),
            second: second.display().to_string(),
        });
    }

    let datasources = config::load_datasources(&db_config_path)?;
    let sections = config::load_config(&job_config_files)?;

    let job_names: Vec<String> = if cli.job_names.is_empty() {
        sections
            .keys()
            .filter(|name| !config::is_reserved(name))
            .cloned()
            .collect()
    } else {
        cli.job_names.clone()
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pools = Arc::new(PoolRegistry::new(DEFAULT_POOL_SIZE));
    let runner = Arc::new(ProbeExecutor::new(Arc::clone(&pools)));
    let alerts: Arc<dyn AlertSink> = Arc::new(AlarmDispatcher::from_env()?);
    let cancel = CancellationToken::new();
    let mut scheduler = Scheduler::new(
        runner,
        Arc::clone(&alerts),
        Arc::clone(&clock),
        cancel.clone(),
        SchedulerOpts {
            force: cli.force,
            ..Default::default()
        },
    );

    info!("checking job configs ...");
    for name in &job_names {
        let raw = config::cascade(&sections, name).ok_or_else(|| {
            MonitorError::Config(format!("Job name {name:?} not exists"))
        })?;
        match config::job::validate_job(name, &raw, &datasources, clock.now()) {
            Ok(job) => {
                info!("job [{name}] config OK.");
                if let Err(err) = scheduler.admit(job) {
                    report_config_error(alerts.as_ref(), &err).await;
                }
            }
            Err(err) => report_config_error(alerts.as_ref(), &err).await,
        }
    }
    info!("all job configs checked.");

    info!("monitor start ...");
    spawn_signal_listener(cancel.clone());
    scheduler.run().await;
    pools.shutdown().await;
    Ok(())
}
