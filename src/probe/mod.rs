//! Probe execution: run a job's SQL statements against their datasource
//! pools, shape the results, and evaluate the validator expression in its
//! restricted environment.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::{Column, Row};
use tracing::debug;

use crate::alarm::{AlarmInfo, AlarmKind};
use crate::config::job::Job;
use crate::db::PoolRegistry;
use crate::errors::{MonitorError, Result};
use crate::expr::{eval_str, Value};
use crate::table::Table;

/// Seam between the scheduler and probe execution; tests substitute a
/// scripted runner.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the probe and validator once. `Ok((ok, info))` reports the
    /// validation outcome; `Err` is an execution fault the scheduler turns
    /// into an exception alarm.
    async fn run(&self, job: &Job) -> Result<(bool, AlarmInfo)>;
}

/// Production runner backed by the datasource pool registry.
pub struct ProbeExecutor {
    pools: Arc<PoolRegistry>,
}

impl ProbeExecutor {
    pub fn new(pools: Arc<PoolRegistry>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl JobRunner for ProbeExecutor {
    async fn run(&self, job: &Job) -> Result<(bool, AlarmInfo)> {
        let mut results = Vec::with_capacity(job.sql_statements.len());
        for (datasource, sql) in job.datasources.iter().zip(&job.sql_statements) {
            let pool = self.pools.pool_for(datasource)?;
            debug!("job [{}] querying {}", job.name, datasource.name);
            results.push(execute_probe(&pool, sql).await.map_err(|err| {
                MonitorError::Probe(format!(
                    "datasource {:?}: {err}",
                    datasource.name
                ))
            })?);
        }

        // a single statement feeds the validator directly, several feed it
        // as an ordered list
        let input = if results.len() == 1 {
            results.pop().expect("one result")
        } else {
            Value::List(results)
        };

        evaluate_validator(&job.validator, input)
    }
}

fn is_fetching(sql: &str) -> bool {
    sql.split_whitespace()
        .next()
        .map(|word| word.eq_ignore_ascii_case("select") || word.eq_ignore_ascii_case("show"))
        .unwrap_or(false)
}

/// Execute one statement and shape its result. Statements other than
/// `SELECT`/`SHOW` run for effect (each statement autocommits) and yield an
/// empty table.
async fn execute_probe(pool: &MySqlPool, sql: &str) -> Result<Value> {
    if !is_fetching(sql) {
        sqlx::query(sql).execute(pool).await?;
        return Ok(Value::Table(Table::empty()));
    }
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(shape_rows(&rows))
}

/// Shape fetched rows: a single row of a single column unwraps to a
/// scalar, anything else becomes a table whose column names come from the
/// result metadata (invalid names are replaced by `col{index}`).
fn shape_rows(rows: &[MySqlRow]) -> Value {
    if rows.len() == 1 && rows[0].columns().len() == 1 {
        return decode_value(&rows[0], 0);
    }
    let Some(first) = rows.first() else {
        return Value::Table(Table::empty());
    };

    let name_re = Regex::new(r"^[A-Za-z0-9_]+$").expect("valid literal pattern");
    let columns: Vec<String> = first
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let name = col.name();
            if name_re.is_match(name) {
                name.to_string()
            } else {
                format!("col{i}")
            }
        })
        .collect();

    let shaped = rows
        .iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|i| decode_value(row, i))
                .collect()
        })
        .collect();
    Value::Table(Table::new(columns, shaped))
}

/// Decode one cell into a [`Value`], trying progressively laxer types.
/// Anything the driver cannot hand over as a primitive arrives as text.
fn decode_value(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(Value::DateTime).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::DateTime(d.and_time(chrono::NaiveTime::MIN)))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Str).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| Value::Str(String::from_utf8_lossy(&b).into_owned()))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

/// Evaluate the validator expression with `result` bound, in the
/// restricted environment of builtins plus registered validators.
///
/// The expression returns either a bare truthiness value or a 2-tuple
/// `(ok, info)`; a raising expression becomes a [`MonitorError::Validator`].
pub fn evaluate_validator(expression: &str, input: Value) -> Result<(bool, AlarmInfo)> {
    let mut env = crate::context::validator_env();
    env.bind("result", input.clone());

    let ret = eval_str(expression, &env).map_err(|err| {
        MonitorError::Validator(format!("validator `{expression}` raised: {err}"))
    })?;

    Ok(match ret {
        Value::Tuple(items) | Value::List(items) if items.len() == 2 => {
            let mut items = items;
            let info = items.pop().expect("len checked");
            let ok = items.pop().expect("len checked");
            (ok.truthy(), AlarmInfo::coerce(info))
        }
        other => (
            other.truthy(),
            AlarmInfo::new(AlarmKind::Default, input),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ok_wraps_result_as_default_info() {
        let (ok, info) = evaluate_validator("result == 1", Value::Int(1)).unwrap();
        assert!(ok);
        assert_eq!(info.kind, AlarmKind::Default);
        assert_eq!(info.content, Value::Int(1));

        let (ok, info) = evaluate_validator("result == 1", Value::Int(2)).unwrap();
        assert!(!ok);
        assert_eq!(info.content, Value::Int(2));
    }

    #[test]
    fn tuple_return_carries_info() {
        let (ok, info) =
            evaluate_validator("(False, ('exception', 'boom'))", Value::Null).unwrap();
        assert!(!ok);
        assert_eq!(info.kind, AlarmKind::Exception);
        assert_eq!(info.content, Value::Str("boom".into()));
    }

    #[test]
    fn raising_validator_is_an_error() {
        let err = evaluate_validator("result[5]", Value::List(vec![])).unwrap_err();
        assert!(matches!(err, MonitorError::Validator(_)));
    }

    #[test]
    fn registered_validators_are_callable() {
        let (ok, _) = evaluate_validator("naive_check(result)", Value::Int(3)).unwrap();
        assert!(ok);
    }

    #[test]
    fn fetching_statements_are_detected() {
        assert!(is_fetching("SELECT 1"));
        assert!(is_fetching("  select *\nfrom t"));
        assert!(is_fetching("SHOW TABLES"));
        assert!(!is_fetching("INSERT INTO t VALUES (1)"));
        assert!(!is_fetching("UPDATE t SET x = 1"));
        assert!(!is_fetching(""));
    }
}
