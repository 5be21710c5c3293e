use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::alarm::AlarmInfo;
use crate::table::{Record, Table};

/// Errors raised while parsing or evaluating expressions.
///
/// `Syntax` and `UnknownName` are the two kinds the job validator treats as
/// fatal during its test evaluation; everything else is a runtime fault of
/// the expression itself.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("name {0:?} is not defined")]
    UnknownName(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("value error: {0}")]
    Value(String),
}

/// Arguments passed to a native function: positional plus keyword.
#[derive(Default, Clone)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keyword: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            keyword: Vec::new(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Required positional argument by index, with the function name in the
    /// error message.
    pub fn require(&self, index: usize, func: &str) -> Result<&Value, EvalError> {
        self.positional.get(index).ok_or_else(|| {
            EvalError::Type(format!("{func}() missing required argument #{}", index + 1))
        })
    }

    pub fn kw(&self, name: &str) -> Option<&Value> {
        self.keyword
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Positional-or-keyword lookup, the common calling convention of the
    /// shipped filters and validators.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.arg(index).or_else(|| self.kw(name))
    }
}

/// Native function callable from expressions.
pub type NativeFn = Arc<dyn Fn(CallArgs) -> Result<Value, EvalError> + Send + Sync>;

/// Runtime value of the validator/template expression sublanguage.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DateTime(NaiveDateTime),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Record(Record),
    Table(Table),
    Alarm(Box<AlarmInfo>),
    Func(NativeFn),
}

impl Value {
    pub fn func<F>(f: F) -> Value
    where
        F: Fn(CallArgs) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        Value::Func(Arc::new(f))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::DateTime(_) => "datetime",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Table(_) => "table",
            Value::Alarm(_) => "alarm_info",
            Value::Func(_) => "function",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::DateTime(_) => true,
            Value::Tuple(items) | Value::List(items) => !items.is_empty(),
            Value::Record(r) => !r.is_empty(),
            Value::Table(t) => !t.is_empty(),
            Value::Alarm(_) => true,
            Value::Func(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Length in the Python sense; `None` for unsized values.
    pub fn length(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::Tuple(items) | Value::List(items) => Some(items.len()),
            Value::Record(r) => Some(r.len()),
            Value::Table(t) => Some(t.len()),
            _ => None,
        }
    }

    /// Items of a sequence value, rows included. `None` for scalars.
    pub fn items(&self) -> Option<Vec<Value>> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items.clone()),
            Value::Table(t) => Some(t.records().into_iter().map(Value::Record).collect()),
            Value::Record(r) => Some(r.values.clone()),
            Value::Str(s) => Some(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            _ => None,
        }
    }

    /// Total order where one exists; `None` for incomparable types.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        non_eq => return Some(non_eq),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => {
                let (a, b) = (self.as_number()?, other.as_number()?);
                a.partial_cmp(&b)
            }
        }
    }

    /// Python-style `repr`: strings quoted, containers recursive.
    pub fn repr(&self) -> String {
        match self {
            Value::Null => "None".to_string(),
            Value::Bool(b) => if *b { "True" } else { "False" }.to_string(),
            Value::Str(s) => format!("{s:?}"),
            Value::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                if items.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Record(r) => {
                let inner: Vec<String> = r
                    .fields
                    .iter()
                    .zip(r.values.iter())
                    .map(|(f, v)| format!("{f}={}", v.repr()))
                    .collect();
                format!("({})", inner.join(", "))
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::Tuple(_) | Value::List(_) | Value::Record(_) => write!(f, "{}", self.repr()),
            Value::Table(t) => write!(f, "{}", t.to_text(10)),
            Value::Alarm(info) => write!(f, "AlarmInfo({}, ...)", info.kind.as_str()),
            Value::Func(_) => write!(f, "<function>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Func(_) => write!(f, "Func(<native>)"),
            other => write!(f, "{}", other.repr()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Alarm(a), Value::Alarm(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}
