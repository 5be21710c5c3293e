//! Scheduler core: a due-time priority queue, a bounded worker pool, and
//! the controller loop that dispatches due jobs, collects completions,
//! alerts on failure and re-enqueues retries.
//!
//! The controller task owns the queue and the in-flight accounting.
//! Workers are spawned tasks gated by a semaphore; their results come back
//! over a channel, so the controller never blocks on a running probe.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::NaiveDateTime;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::alarm::{format_text, AlarmInfo, AlertSink, JobSummary};
use crate::config::job::{scheduled_instances, Job, JobConfigError};
use crate::probe::JobRunner;
use crate::time::Clock;

pub const DEFAULT_POOL_SIZE: usize = 16;
pub const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerOpts {
    /// Maximum number of concurrently running probes.
    pub pool_size: usize,
    /// Controller wake-up interval while work is in flight.
    pub poll_interval: StdDuration,
    /// Bypass the due-time gate and dispatch everything immediately.
    pub force: bool,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            force: false,
        }
    }
}

/// Queue entry ordered by due time, ties broken by insertion order.
struct ScheduledEntry {
    due_time: NaiveDateTime,
    seq: u64,
    job: Job,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_time == other.due_time && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due_time, self.seq).cmp(&(other.due_time, other.seq))
    }
}

struct Completion {
    job: Job,
    ok: bool,
    info: AlarmInfo,
}

enum Wake {
    Cancelled,
    Completed(Option<Completion>),
    Tick,
}

pub struct Scheduler {
    queue: BinaryHeap<Reverse<ScheduledEntry>>,
    seq: u64,
    in_flight: usize,
    completed: u64,
    clock: Arc<dyn Clock>,
    runner: Arc<dyn JobRunner>,
    alerts: Arc<dyn AlertSink>,
    cancel: CancellationToken,
    opts: SchedulerOpts,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        opts: SchedulerOpts,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(opts.pool_size.max(1)));
        Self {
            queue: BinaryHeap::new(),
            seq: 0,
            in_flight: 0,
            completed: 0,
            clock,
            runner,
            alerts,
            cancel,
            opts,
            semaphore,
            tx,
            rx,
        }
    }

    /// Admit one validated job: skip inactive jobs, apply the due-date
    /// gate, expand hourly jobs into their 24 clones, and enqueue what
    /// remains. Pass-2 rendering failures surface as config errors.
    pub fn admit(&mut self, job: Job) -> Result<usize, JobConfigError> {
        if !job.is_active {
            info!("skipped inactive job \"{}\"", job.name);
            return Ok(0);
        }
        let today = self.clock.now().date();
        let instances = scheduled_instances(&job, today)?;
        if instances.is_empty() {
            info!(
                "skipped unscheduled job: [{}] at {}",
                job.name, job.due_time
            );
            return Ok(0);
        }
        let count = instances.len();
        for instance in instances {
            let due_time = instance.due_time;
            self.enqueue(instance, due_time);
        }
        Ok(count)
    }

    pub fn enqueue(&mut self, job: Job, due_time: NaiveDateTime) {
        self.queue.push(Reverse(ScheduledEntry {
            due_time,
            seq: self.seq,
            job,
        }));
        self.seq += 1;
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drive the main loop until the queue is empty and nothing is in
    /// flight, or until cancellation. Returns the number of completed
    /// executions.
    pub async fn run(mut self) -> u64 {
        let total = self.queue.len();
        info!("****** total jobs: {} ...", total);

        loop {
            if self.cancel.is_cancelled() {
                info!("cancellation requested, dispatching no further jobs");
                break;
            }
            if self.queue.is_empty() && self.in_flight == 0 {
                break;
            }
            info!(
                "****** pending: {}, running: {}, completed: {} ******",
                self.queue.len(),
                self.in_flight,
                self.completed
            );

            // dispatch everything that is due
            let now = self.clock.now();
            loop {
                let due = matches!(
                    self.queue.peek(),
                    Some(Reverse(entry)) if self.opts.force || now >= entry.due_time
                );
                if !due {
                    break;
                }
                let Reverse(entry) = self.queue.pop().expect("peeked above");
                self.spawn(entry.job);
            }

            // wait for the next event: a completion, the next due time
            // when idle, or the poll tick
            let wait = match self.queue.peek() {
                Some(Reverse(next)) if self.in_flight == 0 => (next.due_time - now)
                    .to_std()
                    .unwrap_or(StdDuration::ZERO),
                _ => self.opts.poll_interval,
            };

            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                maybe = self.rx.recv(), if self.in_flight > 0 => Wake::Completed(maybe),
                _ = self.clock.sleep(wait) => Wake::Tick,
            };
            match wake {
                Wake::Cancelled => {
                    info!("cancellation requested, dispatching no further jobs");
                    break;
                }
                Wake::Completed(Some(completion)) => {
                    self.handle_completion(completion).await;
                    while let Ok(more) = self.rx.try_recv() {
                        self.handle_completion(more).await;
                    }
                }
                Wake::Completed(None) | Wake::Tick => {}
            }
        }

        // shutdown: abandon pending entries, let running probes finish
        if self.in_flight > 0 {
            info!("waiting for {} running job(s) to finish", self.in_flight);
        }
        while self.in_flight > 0 {
            match self.rx.recv().await {
                Some(completion) => self.handle_completion(completion).await,
                None => break,
            }
        }

        info!(
            "****** pending: {}, running: {}, completed: {} ******",
            self.queue.len(),
            self.in_flight,
            self.completed
        );
        info!("all jobs ({total}) finished.");
        info!("monitor exit.");
        self.completed
    }

    fn spawn(&mut self, job: Job) {
        info!("job [{}] is due. launched.", job.name);
        self.in_flight += 1;
        let runner = Arc::clone(&self.runner);
        let semaphore = Arc::clone(&self.semaphore);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let outcome = std::panic::AssertUnwindSafe(runner.run(&job))
                .catch_unwind()
                .await;
            let completion = match outcome {
                Ok(Ok((ok, info))) => Completion { job, ok, info },
                Ok(Err(err)) => Completion {
                    info: AlarmInfo::exception(err.to_string()),
                    job,
                    ok: false,
                },
                Err(panic) => Completion {
                    info: AlarmInfo::exception(panic_text(panic.as_ref())),
                    job,
                    ok: false,
                },
            };
            let _ = tx.send(completion);
        });
    }

    async fn handle_completion(&mut self, completion: Completion) {
        self.in_flight -= 1;
        self.completed += 1;
        let mut job = completion.job;

        if completion.ok {
            info!("job [{}] returned. status: OK.", job.name);
            return;
        }

        let summary = JobSummary::from(&job);
        let text = format_text(&summary, &completion.info);
        let indented = format!("\t{}", text.replace('\n', "\n\t"));
        warn!(
            "job [{}] returned. status: =====> ALARM <=====\n{indented}",
            job.name
        );
        self.alerts
            .dispatch(&summary, &job.alarm_im, &job.alarm_email, &completion.info)
            .await;

        // retries are abandoned once shutdown is underway
        if self.cancel.is_cancelled() {
            return;
        }
        if job.retry_times > 0 {
            job.retry_times -= 1;
            info!(
                "job [{}] retrying. times left: {}.",
                job.name, job.retry_times
            );
            let due_time = self.clock.now() + job.retry_interval;
            self.enqueue(job, due_time);
        }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

/// Wire SIGINT/SIGTERM/SIGHUP to the cancellation token. The first signal
/// wakes the controller; in-flight probes still run to completion.
pub fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received. stopping scheduler...");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!("unable to install SIGTERM handler: {err}");
            return;
        }
    };
    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            error!("unable to install SIGHUP handler: {err}");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = hup.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("unable to listen for shutdown signal: {err}");
    }
}
