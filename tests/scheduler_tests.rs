//! Scheduler behavior tests driven through the trait seams: a scripted
//! runner, a collecting alert sink, and a manually advanced clock. No
//! database or network involved.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use tokio_util::sync::CancellationToken;

use datamon::alarm::{AlarmDispatcher, AlarmInfo, AlarmKind, AlertSink, JobSummary, MailTemplates};
use datamon::config::job::{Job, Period};
use datamon::config::DatasourceConfig;
use datamon::errors::Result;
use datamon::expr::Value;
use datamon::probe::JobRunner;
use datamon::scheduler::{Scheduler, SchedulerOpts};
use datamon::time::Clock;

fn t0() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 1)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
}

fn job(name: &str, due: NaiveDateTime, retry_times: u32) -> Job {
    Job {
        name: name.to_string(),
        desc: "test probe".into(),
        period: Period::Day,
        is_active: true,
        alarm_im: vec!["alice".into()],
        alarm_email: vec!["alice".into()],
        due_time: due,
        datasources: vec![DatasourceConfig {
            name: "main".into(),
            host: "127.0.0.1".into(),
            port: 3306,
            user: "u".into(),
            password: "p".into(),
            database: "d".into(),
            charset: "utf8".into(),
        }],
        sql_statements: vec!["SELECT 1".into()],
        validator: "result == 1".into(),
        retry_times,
        retry_interval: Duration::seconds(30),
    }
}

/// Clock whose sleeps advance a shared timestamp instead of waiting.
struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    fn starting_at(start: NaiveDateTime) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: StdDuration) {
        {
            let mut now = self.now.lock().unwrap();
            *now += Duration::from_std(duration).unwrap_or_else(|_| Duration::seconds(1));
        }
        tokio::task::yield_now().await;
    }
}

/// Runner returning a scripted outcome, recording when it was invoked.
struct ScriptedRunner {
    ok: bool,
    clock: Arc<ManualClock>,
    calls: Mutex<Vec<(String, NaiveDateTime)>>,
}

impl ScriptedRunner {
    fn new(ok: bool, clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            ok,
            clock,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, NaiveDateTime)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn run(&self, job: &Job) -> Result<(bool, AlarmInfo)> {
        self.calls
            .lock()
            .unwrap()
            .push((job.name.clone(), self.clock.now()));
        Ok((
            self.ok,
            AlarmInfo::new(AlarmKind::Default, Value::Int(0)),
        ))
    }
}

struct PanickingRunner;

#[async_trait]
impl JobRunner for PanickingRunner {
    async fn run(&self, _job: &Job) -> Result<(bool, AlarmInfo)> {
        panic!("probe blew up");
    }
}

#[derive(Default)]
struct CollectingSink {
    dispatched: Mutex<Vec<(String, AlarmKind, usize, usize)>>,
}

impl CollectingSink {
    fn dispatches(&self) -> Vec<(String, AlarmKind, usize, usize)> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn dispatch(
        &self,
        job: &JobSummary,
        alarm_im: &[String],
        alarm_email: &[String],
        info: &AlarmInfo,
    ) {
        self.dispatched.lock().unwrap().push((
            job.name.clone(),
            info.kind,
            alarm_im.len(),
            alarm_email.len(),
        ));
    }
}

fn scheduler_with(
    runner: Arc<dyn JobRunner>,
    sink: Arc<CollectingSink>,
    clock: Arc<ManualClock>,
    cancel: CancellationToken,
) -> Scheduler {
    Scheduler::new(
        runner,
        sink,
        clock,
        cancel,
        SchedulerOpts {
            poll_interval: StdDuration::from_secs(5),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn passing_job_completes_without_alerts() {
    let clock = ManualClock::starting_at(t0());
    let runner = ScriptedRunner::new(true, Arc::clone(&clock));
    let sink = Arc::new(CollectingSink::default());
    let mut scheduler = scheduler_with(
        runner.clone(),
        Arc::clone(&sink),
        Arc::clone(&clock),
        CancellationToken::new(),
    );

    scheduler.enqueue(job("daily", t0(), 0), t0());
    let completed = scheduler.run().await;

    assert_eq!(completed, 1);
    assert_eq!(runner.calls().len(), 1);
    assert!(sink.dispatches().is_empty());
}

#[tokio::test]
async fn job_is_not_dispatched_before_due_time() {
    let clock = ManualClock::starting_at(t0());
    let runner = ScriptedRunner::new(true, Arc::clone(&clock));
    let sink = Arc::new(CollectingSink::default());
    let mut scheduler = scheduler_with(
        runner.clone(),
        sink,
        Arc::clone(&clock),
        CancellationToken::new(),
    );

    let due = t0() + Duration::minutes(10);
    scheduler.enqueue(job("later", due, 0), due);
    scheduler.run().await;

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].1 >= due, "ran at {} before due {}", calls[0].1, due);
}

#[tokio::test]
async fn dispatch_follows_due_order_with_stable_ties() {
    let clock = ManualClock::starting_at(t0());
    let runner = ScriptedRunner::new(true, Arc::clone(&clock));
    let sink = Arc::new(CollectingSink::default());
    let mut scheduler = scheduler_with(
        runner.clone(),
        sink,
        Arc::clone(&clock),
        CancellationToken::new(),
    );

    let late = t0() + Duration::minutes(5);
    scheduler.enqueue(job("third", late, 0), late);
    scheduler.enqueue(job("first", t0(), 0), t0());
    scheduler.enqueue(job("second", t0(), 0), t0());
    scheduler.run().await;

    let order: Vec<String> = runner.calls().into_iter().map(|(name, _)| name).collect();
    assert_eq!(order, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn failing_job_retries_with_backoff_then_stops() {
    let clock = ManualClock::starting_at(t0());
    let runner = ScriptedRunner::new(false, Arc::clone(&clock));
    let sink = Arc::new(CollectingSink::default());
    let mut scheduler = scheduler_with(
        runner.clone(),
        Arc::clone(&sink),
        Arc::clone(&clock),
        CancellationToken::new(),
    );

    scheduler.enqueue(job("flaky", t0(), 2), t0());
    let completed = scheduler.run().await;

    // retry_times = 2 means at most three attempts, one alert each
    assert_eq!(completed, 3);
    let calls = runner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(sink.dispatches().len(), 3);

    // each retry lands at least retry_interval after the previous attempt
    for pair in calls.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::seconds(30));
    }
}

#[tokio::test]
async fn zero_retry_times_means_single_attempt() {
    let clock = ManualClock::starting_at(t0());
    let runner = ScriptedRunner::new(false, Arc::clone(&clock));
    let sink = Arc::new(CollectingSink::default());
    let mut scheduler = scheduler_with(
        runner.clone(),
        Arc::clone(&sink),
        Arc::clone(&clock),
        CancellationToken::new(),
    );

    scheduler.enqueue(job("once", t0(), 0), t0());
    let completed = scheduler.run().await;

    assert_eq!(completed, 1);
    assert_eq!(runner.calls().len(), 1);
    assert_eq!(sink.dispatches().len(), 1);
}

#[tokio::test]
async fn worker_panic_becomes_exception_alarm() {
    let clock = ManualClock::starting_at(t0());
    let sink = Arc::new(CollectingSink::default());
    let mut scheduler = scheduler_with(
        Arc::new(PanickingRunner),
        Arc::clone(&sink),
        Arc::clone(&clock),
        CancellationToken::new(),
    );

    scheduler.enqueue(job("crashy", t0(), 0), t0());
    scheduler.run().await;

    let dispatches = sink.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].1, AlarmKind::Exception);
}

#[tokio::test]
async fn cancellation_abandons_pending_jobs() {
    let clock = ManualClock::starting_at(t0());
    let runner = ScriptedRunner::new(true, Arc::clone(&clock));
    let sink = Arc::new(CollectingSink::default());
    let cancel = CancellationToken::new();
    let mut scheduler = scheduler_with(
        runner.clone(),
        sink,
        Arc::clone(&clock),
        cancel.clone(),
    );

    scheduler.enqueue(job("never", t0(), 0), t0());
    cancel.cancel();
    let completed = scheduler.run().await;

    assert_eq!(completed, 0);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn force_mode_ignores_due_time() {
    let clock = ManualClock::starting_at(t0());
    let runner = ScriptedRunner::new(true, Arc::clone(&clock));
    let sink = Arc::new(CollectingSink::default());
    let mut scheduler = Scheduler::new(
        runner.clone(),
        sink,
        Arc::clone(&clock) as Arc<dyn Clock>,
        CancellationToken::new(),
        SchedulerOpts {
            force: true,
            ..Default::default()
        },
    );

    // due far in the future, but force dispatches immediately
    let due = t0() + Duration::days(300);
    scheduler.enqueue(job("forced", due, 0), due);
    scheduler.run().await;

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].1 < due);
}

#[tokio::test]
async fn admit_skips_inactive_jobs_and_expands_hourly() {
    let clock = ManualClock::starting_at(t0());
    let runner = ScriptedRunner::new(true, Arc::clone(&clock));
    let sink = Arc::new(CollectingSink::default());
    let mut scheduler = scheduler_with(
        runner,
        sink,
        Arc::clone(&clock),
        CancellationToken::new(),
    );

    let mut inactive = job("inactive", t0(), 0);
    inactive.is_active = false;
    assert_eq!(scheduler.admit(inactive).unwrap(), 0);

    let mut hourly = job("hb", t0().date().and_hms_opt(0, 0, 0).unwrap(), 0);
    hourly.period = Period::Hour;
    assert_eq!(scheduler.admit(hourly).unwrap(), 24);
    assert_eq!(scheduler.pending(), 24);
}

#[tokio::test]
async fn dispatcher_with_no_transports_and_no_recipients_is_a_noop() {
    let dispatcher = AlarmDispatcher::new(None, None, MailTemplates::default());
    let summary = JobSummary::named("quiet");
    let info = AlarmInfo::new(AlarmKind::Default, Value::Null);
    // must not panic or error
    dispatcher.dispatch(&summary, &[], &[], &info).await;
}
