//! Job validation: turn one raw config section into a ready-to-run [`Job`]
//! or a typed config error carrying the already-parsed alert recipients.

use std::fmt;
use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use indexmap::IndexMap;
use regex::Regex;

use super::{DatasourceConfig, Section};
use crate::context::filter_env;
use crate::expr::{eval_str, EvalError, Value};
use crate::template::{render, render_deferring, DEFERRED_TOKENS};
use crate::time::parse_datetime;

/// Scheduling period of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Year,
    Month,
    Week,
    Day,
    Hour,
}

impl Period {
    pub const ALL: &'static [&'static str] = &["year", "month", "week", "day", "hour"];

    pub fn parse(s: &str) -> Option<Period> {
        match s {
            "year" => Some(Period::Year),
            "month" => Some(Period::Month),
            "week" => Some(Period::Week),
            "day" => Some(Period::Day),
            "hour" => Some(Period::Hour),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Year => "year",
            Period::Month => "month",
            Period::Week => "week",
            Period::Day => "day",
            Period::Hour => "hour",
        }
    }
}

/// One monitoring probe with its validation and alert policy. Immutable
/// after validation except for the scheduler's `retry_times` decrement.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub name: String,
    pub desc: String,
    pub period: Period,
    pub is_active: bool,
    pub alarm_im: Vec<String>,
    pub alarm_email: Vec<String>,
    pub due_time: NaiveDateTime,
    pub datasources: Vec<DatasourceConfig>,
    pub sql_statements: Vec<String>,
    pub validator: String,
    pub retry_times: u32,
    pub retry_interval: Duration,
}

/// A job configuration violation, carrying whatever recipients could be
/// parsed before the failure so the config-error alert can still go out.
#[derive(Debug, Clone)]
pub struct JobConfigError {
    pub job_name: String,
    pub reason: String,
    pub alarm_im: Vec<String>,
    pub alarm_email: Vec<String>,
}

impl fmt::Display for JobConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for JobConfigError {}

const REQUIRED_OPTIONS: &[&str] = &[
    "desc",
    "period",
    "is_active",
    "alarm_im",
    "alarm_email",
    "due_time",
    "datasources",
    "sql",
    "validator",
    "retry_times",
    "retry_interval",
];

fn split_recipients(raw: Option<&String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

fn split_list(raw: &str, separator: &str) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Validate one raw job section against the known datasources.
///
/// `now` anchors `BASETIME` (midnight of its date) for pass-1 rendering
/// and resolves bare-time `due_time` values.
pub fn validate_job(
    name: &str,
    raw: &Section,
    datasources: &IndexMap<String, DatasourceConfig>,
    now: NaiveDateTime,
) -> Result<Job, JobConfigError> {
    // recipients first, so every later failure can still be alerted
    let alarm_im = split_recipients(raw.get("alarm_im"));
    let alarm_email = split_recipients(raw.get("alarm_email"));
    let fail = |reason: String| JobConfigError {
        job_name: name.to_string(),
        reason,
        alarm_im: alarm_im.clone(),
        alarm_email: alarm_email.clone(),
    };

    for option in REQUIRED_OPTIONS {
        if !raw.contains_key(*option) {
            return Err(fail(format!("option \"{option}\" is required")));
        }
    }

    if Period::parse(&raw["period"]).is_none() {
        return Err(fail(format!(
            "option \"period\" should be in {:?}",
            Period::ALL
        )));
    }
    let is_active_raw = raw["is_active"].to_lowercase();
    if is_active_raw != "true" && is_active_raw != "false" {
        return Err(fail(
            "option \"is_active\" should be in [\"true\", \"false\"]".to_string(),
        ));
    }

    // pass-1 rendering of every option, DUETIME spans deferred
    let basetime = now.date().and_time(NaiveTime::MIN);
    let env = filter_env(&[("BASETIME", Value::DateTime(basetime))]);
    let mut rendered = Section::new();
    for (key, value) in raw {
        let out = render_deferring(value, &env, DEFERRED_TOKENS)
            .map_err(|err| fail(format!("failed rendering config: \n{err}")))?;
        rendered.insert(key.clone(), out);
    }

    let period = Period::parse(&rendered["period"]).expect("checked above");
    let is_active = rendered["is_active"].eq_ignore_ascii_case("true");

    let due_raw = &rendered["due_time"];
    let due_time = parse_datetime(due_raw, now.date())
        .ok_or_else(|| fail(format!("due_time {due_raw:?} can not be parsed")))?;

    let retry_raw = &rendered["retry_times"];
    let retry_times: u32 = retry_raw.parse().map_err(|_| {
        fail(format!(
            "option \"retry_times\" should be a non-negative integer, but {retry_raw:?} got"
        ))
    })?;

    let retry_interval = parse_retry_interval(&rendered["retry_interval"])
        .ok_or_else(|| fail("option \"retry_interval\" should be in format of \"HH:MM[:SS]\"".to_string()))?;

    // datasources / database / sql become parallel lists
    let ds_names = split_list(&rendered["datasources"], ",");
    let overrides: Vec<Option<String>> = match rendered.get("database").filter(|s| !s.is_empty()) {
        Some(raw_db) => split_list(raw_db, ",").into_iter().map(Some).collect(),
        None => vec![None; ds_names.len()],
    };
    let mut sql_statements = split_list(&rendered["sql"], "::");

    if ds_names.is_empty() {
        return Err(fail("option \"datasources\" must not be empty".to_string()));
    }
    if !overrides.is_empty() && overrides.len() != ds_names.len() {
        return Err(fail(format!(
            "\"datasources\" contains {} elements but \"database\" contains {}",
            ds_names.len(),
            overrides.len()
        )));
    }
    if ds_names.len() != sql_statements.len() {
        return Err(fail(format!(
            "\"datasources\" contains {} elements but \"sql\" contains {}",
            ds_names.len(),
            sql_statements.len()
        )));
    }

    for ds_name in &ds_names {
        if !datasources.contains_key(ds_name) {
            return Err(fail(format!(
                "invalid datasource {ds_name:?}, should be in {:?}",
                datasources.keys().collect::<Vec<_>>()
            )));
        }
    }

    // file-backed SQL entries are loaded and %(key)s-interpolated
    for sql in &mut sql_statements {
        if looks_like_path(sql) {
            let path = expand_home(sql);
            if !Path::new(&path).is_file() {
                return Err(fail(format!("sql file not exists: {sql:?}")));
            }
            let body = std::fs::read_to_string(&path)
                .map_err(|err| fail(format!("can not read sql file {sql:?}: {err}")))?;
            *sql = interpolate(&body, &rendered)
                .map_err(|err| fail(format!("sql file {sql:?}: {err}")))?;
        }
    }

    // quick syntax probe of the validator: run it once against a null
    // result; only syntax and unresolved-name faults are config errors,
    // the expression may legitimately reject a null input
    let validator = rendered["validator"].clone();
    let mut probe_env = crate::context::validator_env();
    probe_env.bind("result", Value::Null);
    match eval_str(&validator, &probe_env) {
        Err(err @ EvalError::Syntax(_)) | Err(err @ EvalError::UnknownName(_)) => {
            return Err(fail(format!("error in option \"validator\": {err}")));
        }
        _ => {}
    }

    let resolved: Vec<DatasourceConfig> = ds_names
        .iter()
        .zip(&overrides)
        .map(|(ds_name, database)| {
            let mut ds = datasources[ds_name].clone();
            if let Some(database) = database {
                ds.database = database.clone();
            }
            ds
        })
        .collect();

    Ok(Job {
        name: name.to_string(),
        desc: rendered["desc"].clone(),
        period,
        is_active,
        alarm_im,
        alarm_email,
        due_time,
        datasources: resolved,
        sql_statements,
        validator,
        retry_times,
        retry_interval,
    })
}

fn parse_retry_interval(raw: &str) -> Option<Duration> {
    let re = Regex::new(r"^(\d{1,2}):(\d{1,2})(?::(\d{1,2}))?$").expect("valid literal pattern");
    let caps = re.captures(raw.trim())?;
    let hours: i64 = caps[1].parse().ok()?;
    let minutes: i64 = caps[2].parse().ok()?;
    let seconds: i64 = caps.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;
    Some(Duration::hours(hours) + Duration::minutes(minutes) + Duration::seconds(seconds))
}

/// Path-looking SQL entries are loaded from disk instead of executed
/// verbatim.
fn looks_like_path(s: &str) -> bool {
    let lowered = s.to_lowercase();
    s.starts_with('/')
        || s.starts_with("~/")
        || s.starts_with('.')
        || lowered.ends_with(".sql")
        || lowered.ends_with(".hql")
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}/{rest}"),
        _ => path.to_string(),
    }
}

/// Classical `%(key)s` interpolation against the job's own options.
/// `%%` escapes a literal percent sign.
fn interpolate(body: &str, options: &Section) -> Result<String, String> {
    let re = Regex::new(r"%(%|\(([^)]+)\)s)").expect("valid literal pattern");
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for caps in re.captures_iter(body) {
        let whole = caps.get(0).expect("match");
        out.push_str(&body[last..whole.start()]);
        match caps.get(2) {
            None => out.push('%'),
            Some(key) => {
                let value = options
                    .get(key.as_str())
                    .ok_or_else(|| format!("unknown interpolation key {:?}", key.as_str()))?;
                out.push_str(value);
            }
        }
        last = whole.end();
    }
    out.push_str(&body[last..]);
    Ok(out)
}

/// Pass-2 rendering: re-render the dependent options (`sql`, `validator`)
/// with the job's own due time bound as `DUETIME`.
pub fn render_due_options(job: &mut Job) -> Result<(), JobConfigError> {
    let env = filter_env(&[("DUETIME", Value::DateTime(job.due_time))]);
    let fail = |reason: String| JobConfigError {
        job_name: job.name.clone(),
        reason,
        alarm_im: job.alarm_im.clone(),
        alarm_email: job.alarm_email.clone(),
    };
    for sql in &mut job.sql_statements {
        *sql = render(sql, &env).map_err(|err| fail(format!("failed rendering sql: \n{err}")))?;
    }
    job.validator = render(&job.validator, &env)
        .map_err(|err| fail(format!("failed rendering validator: \n{err}")))?;
    Ok(())
}

/// Expand one validated job into its scheduled instances for `today`.
///
/// Non-hourly jobs run once, and only when their due date is today.
/// Hourly jobs expand into 24 clones at one-hour spacing with `_hourHH`
/// name suffixes; the expansion happens regardless of the configured due
/// date, so backfill-style configs keep working.
pub fn scheduled_instances(job: &Job, today: NaiveDate) -> Result<Vec<Job>, JobConfigError> {
    if job.period != Period::Hour {
        if job.due_time.date() != today {
            return Ok(Vec::new());
        }
        let mut instance = job.clone();
        render_due_options(&mut instance)?;
        return Ok(vec![instance]);
    }

    let mut instances = Vec::with_capacity(24);
    for hour in 0..24 {
        let due_time = job.due_time + Duration::hours(hour);
        let mut clone = job.clone();
        clone.due_time = due_time;
        clone.name = format!("{}_hour{:02}", job.name, due_time.time().hour());
        render_due_options(&mut clone)?;
        instances.push(clone);
    }
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datasources() -> IndexMap<String, DatasourceConfig> {
        let mut map = IndexMap::new();
        for name in ["main", "backup"] {
            map.insert(
                name.to_string(),
                DatasourceConfig {
                    name: name.to_string(),
                    host: "127.0.0.1".into(),
                    port: 3306,
                    user: "monitor".into(),
                    password: "secret".into(),
                    database: "stats".into(),
                    charset: "utf8".into(),
                },
            );
        }
        map
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn base_section() -> Section {
        let mut s = Section::new();
        s.insert("desc".into(), "row count stays positive".into());
        s.insert("period".into(), "day".into());
        s.insert("is_active".into(), "true".into());
        s.insert("alarm_im".into(), "alice,bob".into());
        s.insert("alarm_email".into(), "alice".into());
        s.insert("due_time".into(), "2024-06-01 09:00:00".into());
        s.insert("datasources".into(), "main".into());
        s.insert("sql".into(), "SELECT 1".into());
        s.insert("validator".into(), "result == 1".into());
        s.insert("retry_times".into(), "2".into());
        s.insert("retry_interval".into(), "00:00:30".into());
        s
    }

    #[test]
    fn valid_section_produces_job() {
        let job = validate_job("daily", &base_section(), &datasources(), now()).unwrap();
        assert_eq!(job.name, "daily");
        assert_eq!(job.period, Period::Day);
        assert_eq!(job.alarm_im, vec!["alice", "bob"]);
        assert_eq!(job.retry_times, 2);
        assert_eq!(job.retry_interval, Duration::seconds(30));
        assert_eq!(job.datasources[0].name, "main");
    }

    #[test]
    fn validation_is_deterministic() {
        let a = validate_job("daily", &base_section(), &datasources(), now()).unwrap();
        let b = validate_job("daily", &base_section(), &datasources(), now()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_option_reports_name_and_keeps_recipients() {
        let mut section = base_section();
        section.shift_remove("validator");
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert_eq!(err.reason, "option \"validator\" is required");
        assert_eq!(err.alarm_im, vec!["alice", "bob"]);
        assert_eq!(err.alarm_email, vec!["alice"]);
    }

    #[test]
    fn bad_period_is_rejected() {
        let mut section = base_section();
        section.insert("period".into(), "fortnight".into());
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert!(err.reason.contains("period"));
    }

    #[test]
    fn is_active_is_case_insensitive() {
        let mut section = base_section();
        section.insert("is_active".into(), "False".into());
        let job = validate_job("daily", &section, &datasources(), now()).unwrap();
        assert!(!job.is_active);
    }

    #[test]
    fn unparseable_due_time_is_rejected() {
        let mut section = base_section();
        section.insert("due_time".into(), "someday".into());
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert!(err.reason.contains("due_time"));
    }

    #[test]
    fn bare_time_due_time_lands_on_today() {
        let mut section = base_section();
        section.insert("due_time".into(), "09:30".into());
        let job = validate_job("daily", &section, &datasources(), now()).unwrap();
        assert_eq!(job.due_time.to_string(), "2024-06-01 09:30:00");
    }

    #[test]
    fn retry_interval_format_is_enforced() {
        let mut section = base_section();
        section.insert("retry_interval".into(), "30 seconds".into());
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert!(err.reason.contains("HH:MM"));

        let mut section = base_section();
        section.insert("retry_interval".into(), "01:30".into());
        let job = validate_job("daily", &section, &datasources(), now()).unwrap();
        assert_eq!(job.retry_interval, Duration::minutes(90));
    }

    #[test]
    fn list_length_mismatch_is_rejected() {
        let mut section = base_section();
        section.insert("datasources".into(), "main,backup".into());
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert!(err.reason.contains("\"sql\" contains 1"));
    }

    #[test]
    fn multi_statement_jobs_split_on_double_colon() {
        let mut section = base_section();
        section.insert("datasources".into(), "main, backup".into());
        section.insert("sql".into(), "SELECT 1 :: SELECT 2".into());
        let job = validate_job("daily", &section, &datasources(), now()).unwrap();
        assert_eq!(job.sql_statements, vec!["SELECT 1", "SELECT 2"]);
        assert_eq!(job.datasources[1].name, "backup");
    }

    #[test]
    fn unknown_datasource_is_rejected() {
        let mut section = base_section();
        section.insert("datasources".into(), "nowhere".into());
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert!(err.reason.contains("nowhere"));
    }

    #[test]
    fn database_override_applies_per_job() {
        let mut section = base_section();
        section.insert("database".into(), "archive".into());
        let job = validate_job("daily", &section, &datasources(), now()).unwrap();
        assert_eq!(job.datasources[0].database, "archive");
        // the shared datasource map is untouched
        assert_eq!(datasources()["main"].database, "stats");
    }

    #[test]
    fn validator_syntax_error_is_fatal() {
        let mut section = base_section();
        section.insert("validator".into(), "result ==".into());
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert!(err.reason.contains("validator"));
    }

    #[test]
    fn validator_unknown_name_is_fatal() {
        let mut section = base_section();
        section.insert("validator".into(), "not_a_function(result)".into());
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert!(err.reason.contains("not_a_function"));
    }

    #[test]
    fn validator_runtime_error_on_null_probe_is_tolerated() {
        let mut section = base_section();
        // len(None) raises, but only at run time with real input shapes
        section.insert("validator".into(), "len(result) > 0".into());
        assert!(validate_job("daily", &section, &datasources(), now()).is_ok());
    }

    #[test]
    fn pass1_renders_basetime_and_defers_duetime() {
        let mut section = base_section();
        section.insert(
            "sql".into(),
            "SELECT count(*) FROM t WHERE dt = '{BASETIME | dt_format(fmt='%Y-%m-%d')}' AND h = '{DUETIME | dt_format}'".into(),
        );
        let job = validate_job("daily", &section, &datasources(), now()).unwrap();
        assert!(job.sql_statements[0].contains("2024-06-01"));
        assert!(job.sql_statements[0].contains("{DUETIME | dt_format}"));
    }

    #[test]
    fn sql_file_loading_interpolates_job_options() {
        let dir = tempfile::tempdir().unwrap();
        let sql_path = dir.path().join("probe.sql");
        std::fs::write(&sql_path, "SELECT 1 -- %(desc)s, 100%%\n").unwrap();
        let mut section = base_section();
        section.insert("sql".into(), sql_path.to_str().unwrap().to_string());
        let job = validate_job("daily", &section, &datasources(), now()).unwrap();
        assert_eq!(
            job.sql_statements[0],
            "SELECT 1 -- row count stays positive, 100%"
        );
    }

    #[test]
    fn missing_sql_file_is_rejected() {
        let mut section = base_section();
        section.insert("sql".into(), "/no/such/file.sql".into());
        let err = validate_job("daily", &section, &datasources(), now()).unwrap_err();
        assert!(err.reason.contains("sql file not exists"));
    }

    #[test]
    fn daily_instance_runs_only_on_its_date() {
        let job = validate_job("daily", &base_section(), &datasources(), now()).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(scheduled_instances(&job, today).unwrap().len(), 1);
        let tomorrow = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
        assert!(scheduled_instances(&job, tomorrow).unwrap().is_empty());
    }

    #[test]
    fn hourly_job_expands_to_24_clones() {
        let mut section = base_section();
        section.insert("period".into(), "hour".into());
        section.insert("due_time".into(), "2024-06-01 00:00:00".into());
        let job = validate_job("daily_heartbeat", &section, &datasources(), now()).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let instances = scheduled_instances(&job, today).unwrap();
        assert_eq!(instances.len(), 24);
        assert_eq!(instances[0].name, "daily_heartbeat_hour00");
        assert_eq!(instances[23].name, "daily_heartbeat_hour23");
        // strictly increasing at one-hour spacing, pairwise distinct names
        for window in instances.windows(2) {
            assert_eq!(
                window[1].due_time - window[0].due_time,
                Duration::hours(1)
            );
            assert_ne!(window[0].name, window[1].name);
        }
    }

    #[test]
    fn hourly_expansion_ignores_date_gate() {
        let mut section = base_section();
        section.insert("period".into(), "hour".into());
        let job = validate_job("hb", &section, &datasources(), now()).unwrap();
        let other_day = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        assert_eq!(scheduled_instances(&job, other_day).unwrap().len(), 24);
    }

    #[test]
    fn pass2_binds_duetime_per_clone() {
        let mut section = base_section();
        section.insert("period".into(), "hour".into());
        section.insert("due_time".into(), "2024-06-01 00:00:00".into());
        section.insert(
            "sql".into(),
            "SELECT count(*) FROM t WHERE h = '{DUETIME | dt_format(fmt='%H')}'".into(),
        );
        let job = validate_job("hb", &section, &datasources(), now()).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let instances = scheduled_instances(&job, today).unwrap();
        assert!(instances[0].sql_statements[0].contains("= '00'"));
        assert!(instances[13].sql_statements[0].contains("= '13'"));
    }
}
