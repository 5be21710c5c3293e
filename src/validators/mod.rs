//! Shipped validator functions, registered into the validator registry at
//! startup.
//!
//! `claim` asserts rows of a result against a predicate and can detect gaps
//! in a periodic serial column; `diff` compares two result sets with a
//! threshold. `gt`/`ge`/`lt`/`le`/`eq`/`ne` build predicate closures, and
//! `ands`/`ors` combine them.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{Duration, Local, NaiveDateTime};
use indexmap::IndexMap;

use crate::alarm::{AlarmInfo, AlarmKind};
use crate::context::Registry;
use crate::expr::{call_value, CallArgs, EvalError, Value};
use crate::table::Table;
use crate::time::{add_months, parse_datetime};

pub fn default_validators() -> Registry {
    let mut registry = Registry::new();
    registry.register("naive_check", Arc::new(naive_check));
    registry.register("claim", Arc::new(claim));
    registry.register("diff", Arc::new(diff));
    registry.register("gt", Arc::new(|args| predicate(args, "gt", |o| o == Ordering::Greater)));
    registry.register("ge", Arc::new(|args| predicate(args, "ge", |o| o != Ordering::Less)));
    registry.register("lt", Arc::new(|args| predicate(args, "lt", |o| o == Ordering::Less)));
    registry.register("le", Arc::new(|args| predicate(args, "le", |o| o != Ordering::Greater)));
    registry.register("eq", Arc::new(eq));
    registry.register("ne", Arc::new(ne));
    registry.register("ands", Arc::new(ands));
    registry.register("ors", Arc::new(ors));
    registry
}

fn naive_check(args: CallArgs) -> Result<Value, EvalError> {
    let result = args.require(0, "naive_check")?;
    let ordering = result.compare(&Value::Int(0)).ok_or_else(|| {
        EvalError::Type(format!(
            "naive_check: can not compare {} with 0",
            result.type_name()
        ))
    })?;
    Ok(Value::Bool(ordering == Ordering::Greater))
}

/// Build a one-argument predicate closed over the right-hand side, e.g.
/// `gt(30)` yields a function testing `x > 30`.
fn predicate(
    args: CallArgs,
    name: &'static str,
    accept: fn(Ordering) -> bool,
) -> Result<Value, EvalError> {
    let rhs = args.require(0, name)?.clone();
    Ok(Value::func(move |inner: CallArgs| {
        let lhs = inner.require(0, "predicate")?;
        let ordering = lhs.compare(&rhs).ok_or_else(|| {
            EvalError::Type(format!(
                "{name}: can not compare {} with {}",
                lhs.type_name(),
                rhs.type_name()
            ))
        })?;
        Ok(Value::Bool(accept(ordering)))
    }))
}

fn eq(args: CallArgs) -> Result<Value, EvalError> {
    let rhs = args.require(0, "eq")?.clone();
    Ok(Value::func(move |inner: CallArgs| {
        Ok(Value::Bool(*inner.require(0, "predicate")? == rhs))
    }))
}

fn ne(args: CallArgs) -> Result<Value, EvalError> {
    let rhs = args.require(0, "ne")?.clone();
    Ok(Value::func(move |inner: CallArgs| {
        Ok(Value::Bool(*inner.require(0, "predicate")? != rhs))
    }))
}

/// Conjunction of predicates.
fn ands(args: CallArgs) -> Result<Value, EvalError> {
    let preds = args.positional.clone();
    Ok(Value::func(move |inner: CallArgs| {
        let x = inner.require(0, "ands")?;
        for pred in &preds {
            if !call_value(pred, CallArgs::positional(vec![x.clone()]))?.truthy() {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    }))
}

/// Disjunction of predicates.
fn ors(args: CallArgs) -> Result<Value, EvalError> {
    let preds = args.positional.clone();
    Ok(Value::func(move |inner: CallArgs| {
        let x = inner.require(0, "ors")?;
        for pred in &preds {
            if call_value(pred, CallArgs::positional(vec![x.clone()]))?.truthy() {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    }))
}

fn fail(message: impl Into<String>) -> Value {
    Value::Tuple(vec![Value::Bool(false), Value::Str(message.into())])
}

fn alarm(kind: AlarmKind, table: Table) -> Value {
    Value::Tuple(vec![
        Value::Bool(false),
        Value::Alarm(Box::new(AlarmInfo::new(kind, Value::Table(table)))),
    ])
}

/// View any tabular-ish value as a [`Table`]. Lists of records keep their
/// field names; lists of tuples and bare scalars get `col{i}` names.
fn as_table(value: &Value) -> Option<Table> {
    match value {
        Value::Table(t) => Some(t.clone()),
        Value::List(items) | Value::Tuple(items) => {
            let columns = match items.first() {
                Some(Value::Record(r)) => r.fields.as_ref().clone(),
                Some(Value::Tuple(first)) | Some(Value::List(first)) => {
                    (0..first.len()).map(|i| format!("col{i}")).collect()
                }
                Some(_) => vec!["col0".to_string()],
                None => Vec::new(),
            };
            let rows = items
                .iter()
                .map(|item| match item {
                    Value::Record(r) => r.values.clone(),
                    Value::Tuple(vs) | Value::List(vs) => vs.clone(),
                    scalar => vec![scalar.clone()],
                })
                .collect();
            Some(Table::new(columns, rows))
        }
        _ => None,
    }
}

fn apply_pred(pred: &Value, value: &Value) -> bool {
    // a predicate failing to evaluate counts as unqualified data
    call_value(pred, CallArgs::positional(vec![value.clone()]))
        .map(|v| v.truthy())
        .unwrap_or(false)
}

/// `claim(data, pred, serial=True, period="day", start=..., end=...)`
///
/// Asserts every row of `data`: the last column is the value under test,
/// the first column is the serial (date) column. With `serial` on, a
/// complete period sequence is generated between `start`/`end` (defaulting
/// to the observed range) and missing entries are reported alongside rows
/// failing the predicate.
fn claim(args: CallArgs) -> Result<Value, EvalError> {
    let data = args.require(0, "claim")?.clone();
    let pred = args
        .get(1, "pred")
        .cloned()
        .filter(|v| !matches!(v, Value::Null));
    let serial = args.get(2, "serial").map(Value::truthy).unwrap_or(true);
    let period = match args.get(3, "period") {
        None => "day".to_string(),
        Some(Value::Str(s)) => s.clone(),
        Some(other) => {
            return Err(EvalError::Type(format!(
                "claim: argument \"period\" should be a string, got {}",
                other.type_name()
            )))
        }
    };
    let start = args.get(4, "start").cloned().filter(|v| !matches!(v, Value::Null));
    let end = args.get(5, "end").cloned().filter(|v| !matches!(v, Value::Null));

    let table = match as_table(&data) {
        Some(t) => t,
        None => {
            // single scalar result: apply the predicate directly
            let pred = pred.ok_or_else(|| {
                EvalError::Type("claim: a predicate is required for scalar results".into())
            })?;
            let ok = call_value(&pred, CallArgs::positional(vec![data]))?;
            return Ok(Value::Bool(ok.truthy()));
        }
    };

    if table.is_empty() {
        return Ok(fail("result is empty"));
    }

    let value_idx = table.columns.len() - 1;
    let mut columns = table.columns.clone();
    columns.push("has_data".to_string());

    let mut work: Vec<Vec<Value>> = table
        .rows
        .iter()
        .map(|row| {
            let mut row = row.clone();
            row.push(Value::Str("Yes".into()));
            row
        })
        .collect();

    if serial {
        work = sequenced(work, columns.len(), &period, start, end)?;
    }

    let has_data_idx = columns.len() - 1;
    let mut offending: Vec<Vec<Value>> = Vec::new();
    for mut row in work {
        let missing = row[has_data_idx] == Value::Null;
        let unqualified = match &pred {
            Some(p) if !missing => !apply_pred(p, &row[value_idx]),
            Some(_) => true,
            None => false,
        };
        if missing || unqualified {
            if missing {
                row[has_data_idx] = Value::Str("missing".into());
            }
            offending.push(row);
        }
    }

    if offending.is_empty() {
        Ok(Value::Bool(true))
    } else {
        Ok(alarm(AlarmKind::Claim, Table::new(columns, offending)))
    }
}

fn coerce_serial(value: &Value) -> Result<NaiveDateTime, EvalError> {
    match value {
        Value::DateTime(dt) => Ok(*dt),
        other => parse_datetime(&other.to_string(), Local::now().date_naive()).ok_or_else(|| {
            EvalError::Value(format!(
                "claim: the serial column can not be parsed as datetime: {other}"
            ))
        }),
    }
}

/// Outer-join `rows` against a complete period sequence on the first
/// column; rows outside the sequence are kept, gaps appear with null
/// fields. The serial column ends up formatted at period granularity.
fn sequenced(
    rows: Vec<Vec<Value>>,
    ncols: usize,
    period: &str,
    start: Option<Value>,
    end: Option<Value>,
) -> Result<Vec<Vec<Value>>, EvalError> {
    let (fmt, step): (&str, fn(NaiveDateTime) -> NaiveDateTime) = match period {
        "year" => ("%Y", |dt| add_months(dt, 12)),
        "month" => ("%Y-%m", |dt| add_months(dt, 1)),
        "week" => ("%Y-%m-%d", |dt| dt + Duration::weeks(1)),
        "day" => ("%Y-%m-%d", |dt| dt + Duration::days(1)),
        "hour" => ("%Y-%m-%d %H", |dt| dt + Duration::hours(1)),
        other => {
            return Err(EvalError::Value(format!(
                "argument \"period\" should be one of (year, month, week, day, hour), but {other:?} got"
            )))
        }
    };

    let mut parsed: Vec<NaiveDateTime> = Vec::with_capacity(rows.len());
    for row in &rows {
        parsed.push(coerce_serial(&row[0])?);
    }

    let start = match start {
        Some(v) => coerce_serial(&v)
            .map_err(|_| EvalError::Value(format!("argument \"start\" ({v}) can not be parsed as datetime")))?,
        None => *parsed.iter().min().expect("rows are non-empty"),
    };
    let end = match end {
        Some(v) => coerce_serial(&v)
            .map_err(|_| EvalError::Value(format!("argument \"end\" ({v}) can not be parsed as datetime")))?,
        None => *parsed.iter().max().expect("rows are non-empty"),
    };

    // bucket observed rows by formatted key
    let mut by_key: IndexMap<String, Vec<Vec<Value>>> = IndexMap::new();
    for (row, dt) in rows.into_iter().zip(parsed) {
        let key = dt.format(fmt).to_string();
        let mut row = row;
        row[0] = Value::Str(key.clone());
        by_key.entry(key).or_default().push(row);
    }

    let mut out: Vec<Vec<Value>> = Vec::new();
    let mut current = start;
    while current <= end {
        let key = current.format(fmt).to_string();
        match by_key.shift_remove(&key) {
            Some(matched) => out.extend(matched),
            None => {
                let mut gap = vec![Value::Null; ncols];
                gap[0] = Value::Str(key);
                out.push(gap);
            }
        }
        current = step(current);
    }
    // rows outside [start, end] survive the outer join
    for (_, leftover) in by_key {
        out.extend(leftover);
    }
    Ok(out)
}

/// `diff(data1, data2, threshold=1e-6, direction=0)`
///
/// Outer-joins the two result sets on every column but the last and
/// compares the value columns. `direction`: -1 left minus right, 1 right
/// minus left, 0 absolute difference. A null on either side always
/// triggers.
fn diff(args: CallArgs) -> Result<Value, EvalError> {
    let data1 = args.require(0, "diff")?;
    let data2 = args.require(1, "diff")?;
    let threshold = match args.get(2, "threshold") {
        None => 1e-6,
        Some(v) => v.as_number().ok_or_else(|| {
            EvalError::Type("diff: argument \"threshold\" should be a number".into())
        })?,
    };
    let direction = match args.get(3, "direction") {
        None => 0,
        Some(Value::Int(n)) if [-1, 0, 1].contains(n) => *n,
        Some(other) => {
            return Err(EvalError::Value(format!(
                "invalid argument \"direction={other}\", should be one value in [-1, 0, 1]"
            )))
        }
    };

    let table1 = as_table(data1)
        .ok_or_else(|| EvalError::Type("diff: data1 is not tabular".into()))?;
    let table2 = as_table(data2)
        .ok_or_else(|| EvalError::Type("diff: data2 is not tabular".into()))?;
    if table1.is_empty() {
        return Ok(fail("data1 (the first table) is empty"));
    }
    if table2.is_empty() {
        return Ok(fail("data2 (the second table) is empty"));
    }
    if table1.columns.len() != table2.columns.len() {
        return Err(EvalError::Value(format!(
            "diff: column count mismatch ({} vs {})",
            table1.columns.len(),
            table2.columns.len()
        )));
    }

    let nkeys = table1.columns.len() - 1;
    let key_of = |row: &[Value]| -> String {
        row[..nkeys]
            .iter()
            .map(Value::repr)
            .collect::<Vec<_>>()
            .join("\u{1}")
    };

    let mut right: IndexMap<String, Vec<Value>> = IndexMap::new();
    for row in &table2.rows {
        right.insert(key_of(row), row.clone());
    }

    // merged shape: key columns, both value columns, then the diff column
    let name1 = &table1.columns[nkeys];
    let name2 = &table2.columns[nkeys];
    let (val1_name, val2_name) = if name1 == name2 {
        (format!("{name1}_1"), format!("{name2}_2"))
    } else {
        (name1.clone(), name2.clone())
    };
    let mut columns: Vec<String> = table1.columns[..nkeys].to_vec();
    columns.push(val1_name);
    columns.push(val2_name);

    let mut merged: Vec<(Vec<Value>, Value, Value)> = Vec::new();
    for row in &table1.rows {
        let key = key_of(row);
        let v1 = row[nkeys].clone();
        let v2 = match right.shift_remove(&key) {
            Some(other_row) => other_row[nkeys].clone(),
            None => Value::Null,
        };
        merged.push((row[..nkeys].to_vec(), v1, v2));
    }
    for (_, row) in right {
        merged.push((row[..nkeys].to_vec(), Value::Null, row[nkeys].clone()));
    }

    // numeric mode unless some populated value refuses to be a number
    let numeric = merged.iter().all(|(_, v1, v2)| {
        [v1, v2]
            .iter()
            .all(|v| matches!(v, Value::Null) || v.as_number().is_some())
    });

    let mut offending: Vec<Vec<Value>> = Vec::new();
    if numeric {
        columns.push("diff".to_string());
        for (keys, v1, v2) in merged {
            let delta = match (v1.as_number(), v2.as_number()) {
                (Some(a), Some(b)) => {
                    let d = a - b;
                    Some(match direction {
                        0 => d.abs(),
                        -1 => d,
                        _ => -d,
                    })
                }
                _ => None,
            };
            let triggered = delta.map(|d| d > threshold).unwrap_or(true);
            if triggered {
                let mut row = keys;
                row.push(v1);
                row.push(v2);
                row.push(delta.map(Value::Float).unwrap_or(Value::Null));
                offending.push(row);
            }
        }
    } else {
        for (keys, v1, v2) in merged {
            if v1 != v2 {
                let mut row = keys;
                row.push(v1);
                row.push(v2);
                offending.push(row);
            }
        }
    }

    if offending.is_empty() {
        Ok(Value::Bool(true))
    } else {
        Ok(alarm(AlarmKind::Diff, Table::new(columns, offending)))
    }
}
