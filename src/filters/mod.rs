//! Shipped template filters: date/time arithmetic, field setting, and
//! strftime formatting. Registered into the filter registry at startup;
//! user packs can extend or replace the set through
//! [`crate::context::install`].

use std::fmt::Write as _;

use chrono::{Datelike, Local, NaiveDateTime, Timelike};

use crate::context::Registry;
use crate::expr::{CallArgs, EvalError, Value};
use crate::time::{parse_datetime, RelativeDelta};

pub fn default_filters() -> Registry {
    let mut registry = Registry::new();
    registry.register("dt_add", std::sync::Arc::new(dt_add));
    registry.register("dt_set", std::sync::Arc::new(dt_set));
    registry.register("dt_format", std::sync::Arc::new(dt_format));
    registry
}

/// Accept a datetime or a string parseable as one.
fn coerce_datetime(value: &Value, func: &str) -> Result<NaiveDateTime, EvalError> {
    match value {
        Value::DateTime(dt) => Ok(*dt),
        Value::Str(s) => parse_datetime(s, Local::now().date_naive()).ok_or_else(|| {
            EvalError::Value(format!("{func}: can not parse {s:?} as datetime"))
        }),
        other => Err(EvalError::Type(format!(
            "{func}: expected datetime or string, got {}",
            other.type_name()
        ))),
    }
}

fn int_kwarg(value: &Value, key: &str) -> Result<i64, EvalError> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(EvalError::Type(format!(
            "argument {key:?} should be an integer, got {}",
            other.type_name()
        ))),
    }
}

/// `dt_add(dt, days=-1, hours=2, ...)` — add a relative offset. Both
/// singular and plural unit names are accepted.
fn dt_add(args: CallArgs) -> Result<Value, EvalError> {
    let dt = coerce_datetime(args.require(0, "dt_add")?, "dt_add")?;
    let mut delta = RelativeDelta::default();
    for (key, value) in &args.keyword {
        let n = int_kwarg(value, key)?;
        match key.trim_end_matches('s') {
            "year" => delta.years = n,
            "month" => delta.months = n,
            "week" => delta.weeks = n,
            "day" => delta.days = n,
            "hour" => delta.hours = n,
            "minute" => delta.minutes = n,
            "second" => delta.seconds = n,
            "microsecond" => delta.microseconds = n,
            _ => {
                return Err(EvalError::Value(format!(
                    "dt_add: unknown offset {key:?}"
                )))
            }
        }
    }
    Ok(Value::DateTime(delta.apply(dt)))
}

/// `dt_set(dt, day=1, hour=9)` — reset date/time fields. Also supports a
/// `weekday` field (1 = Monday … 7 = Sunday), incompatible with setting
/// `year`/`month`/`day` at the same time.
fn dt_set(args: CallArgs) -> Result<Value, EvalError> {
    let mut dt = coerce_datetime(args.require(0, "dt_set")?, "dt_set")?;

    if let Some(weekday_value) = args.kw("weekday") {
        for conflict in ["year", "month", "day"] {
            if args.kw(conflict).is_some() {
                return Err(EvalError::Value(format!(
                    "dt_set conflict, can not set {conflict:?} and \"weekday\" at one time"
                )));
            }
        }
        let weekday = int_kwarg(weekday_value, "weekday")?;
        if !(1..=7).contains(&weekday) {
            return Err(EvalError::Value(
                "argument \"weekday\" should be an integer between 1~7".into(),
            ));
        }
        let current = dt.weekday().num_days_from_monday() as i64;
        dt += chrono::Duration::days(weekday - 1 - current);
    }

    for (key, value) in &args.keyword {
        if key == "weekday" {
            continue;
        }
        let n = int_kwarg(value, key)?;
        let updated = match key.as_str() {
            "year" => dt.with_year(n as i32),
            "month" => dt.with_month(n as u32),
            "day" => dt.with_day(n as u32),
            "hour" => dt.with_hour(n as u32),
            "minute" => dt.with_minute(n as u32),
            "second" => dt.with_second(n as u32),
            "microsecond" => dt.with_nanosecond(n as u32 * 1000),
            _ => {
                return Err(EvalError::Value(format!(
                    "dt_set: unknown field {key:?}"
                )))
            }
        };
        dt = updated.ok_or_else(|| {
            EvalError::Value(format!("dt_set: invalid value {n} for field {key:?}"))
        })?;
    }

    Ok(Value::DateTime(dt))
}

/// `dt_format(dt, fmt='%Y-%m-%d')` — strftime-style formatting, ISO 8601
/// by default.
fn dt_format(args: CallArgs) -> Result<Value, EvalError> {
    let dt = coerce_datetime(args.require(0, "dt_format")?, "dt_format")?;
    let fmt = match args.get(1, "fmt") {
        None => "%Y-%m-%d %H:%M:%S".to_string(),
        Some(Value::Str(f)) => f.clone(),
        Some(other) => {
            return Err(EvalError::Type(format!(
                "dt_format: fmt should be a string, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = String::new();
    write!(out, "{}", dt.format(&fmt))
        .map_err(|_| EvalError::Value(format!("dt_format: invalid format {fmt:?}")))?;
    Ok(Value::Str(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{eval_str, Env};
    use chrono::NaiveDate;

    fn env() -> Env {
        let base = NaiveDate::from_ymd_opt(2024, 6, 5) // a Wednesday
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        crate::context::filter_env(&[("BASETIME", Value::DateTime(base))])
    }

    fn eval_dt(src: &str) -> String {
        eval_str(src, &env()).unwrap().to_string()
    }

    #[test]
    fn dt_add_accepts_singular_and_plural() {
        assert_eq!(
            eval_dt("BASETIME | dt_add(day=-1)"),
            "2024-06-04 10:30:00"
        );
        assert_eq!(
            eval_dt("BASETIME | dt_add(days=-1)"),
            "2024-06-04 10:30:00"
        );
        assert_eq!(
            eval_dt("BASETIME | dt_add(months=1, hours=2)"),
            "2024-07-05 12:30:00"
        );
    }

    #[test]
    fn dt_add_month_end_clamps() {
        let mut e = Env::new();
        e.bind(
            "d",
            Value::Str("2024-01-31 00:00:00".into()),
        );
        let e = e.merged(&env());
        assert_eq!(
            eval_str("d | dt_add(month=1)", &e).unwrap().to_string(),
            "2024-02-29 00:00:00"
        );
    }

    #[test]
    fn dt_set_fields() {
        assert_eq!(
            eval_dt("BASETIME | dt_set(day=1, hour=9, minute=0, second=0)"),
            "2024-06-01 09:00:00"
        );
    }

    #[test]
    fn dt_set_weekday_moves_within_week() {
        // 2024-06-05 is a Wednesday; weekday=1 is that week's Monday
        assert_eq!(
            eval_dt("BASETIME | dt_set(weekday=1)"),
            "2024-06-03 10:30:00"
        );
        assert_eq!(
            eval_dt("BASETIME | dt_set(weekday=7)"),
            "2024-06-09 10:30:00"
        );
    }

    #[test]
    fn dt_set_weekday_conflicts_with_day() {
        let err = eval_str("BASETIME | dt_set(weekday=1, day=2)", &env()).unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn dt_set_rejects_out_of_range_weekday() {
        assert!(eval_str("BASETIME | dt_set(weekday=0)", &env()).is_err());
        assert!(eval_str("BASETIME | dt_set(weekday=8)", &env()).is_err());
    }

    #[test]
    fn dt_format_default_and_custom() {
        assert_eq!(
            eval_str("BASETIME | dt_format", &env()).unwrap(),
            Value::Str("2024-06-05 10:30:00".into())
        );
        assert_eq!(
            eval_str("BASETIME | dt_format(fmt='%Y%m%d')", &env()).unwrap(),
            Value::Str("20240605".into())
        );
    }

    #[test]
    fn string_input_is_parsed_first() {
        let out = eval_str("'2024-06-01' | dt_format(fmt='%m/%d')", &env()).unwrap();
        assert_eq!(out, Value::Str("06/01".into()));
    }
}
