//! The fixed builtin allow-list available to validator expressions.
//!
//! The name set is closed: nothing outside [`ALLOWED_NAMES`] is bound, and
//! every listed name resolves (names with no honest equivalent on this
//! substrate raise a type error when called, which still satisfies the
//! name-resolution contract of the load-time validator check).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::eval::{call_value, Env};
use super::value::{CallArgs, EvalError, Value};

/// Exactly the names bound into every validator environment.
pub const ALLOWED_NAMES: &[&str] = &[
    "None",
    "False",
    "True",
    "Ellipsis",
    "abs",
    "all",
    "apply",
    "basestring",
    "bin",
    "bool",
    "bytearray",
    "bytes",
    "chr",
    "cmp",
    "complex",
    "dict",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "format",
    "frozenset",
    "hash",
    "hex",
    "int",
    "isinstance",
    "issubclass",
    "len",
    "list",
    "long",
    "map",
    "max",
    "memoryview",
    "min",
    "next",
    "oct",
    "ord",
    "pow",
    "range",
    "reduce",
    "repr",
    "reversed",
    "round",
    "set",
    "slice",
    "sorted",
    "str",
    "sum",
    "tuple",
    "zip",
];

/// Build an environment containing the allow-listed builtins, and nothing
/// else.
pub fn builtin_env() -> Env {
    let mut env = Env::new();

    env.bind("None", Value::Null);
    env.bind("False", Value::Bool(false));
    env.bind("True", Value::Bool(true));
    env.bind("Ellipsis", Value::Str("Ellipsis".into()));

    env.bind("abs", Value::func(builtin_abs));
    env.bind("all", Value::func(builtin_all));
    env.bind("apply", Value::func(builtin_apply));
    env.bind("basestring", Value::func(builtin_str));
    env.bind("bin", Value::func(|a| radix(a, "bin", 2, "0b")));
    env.bind("bool", Value::func(builtin_bool));
    env.bind("bytearray", Value::func(builtin_bytes));
    env.bind("bytes", Value::func(builtin_bytes));
    env.bind("chr", Value::func(builtin_chr));
    env.bind("cmp", Value::func(builtin_cmp));
    env.bind("complex", Value::func(unsupported("complex")));
    env.bind("dict", Value::func(unsupported("dict")));
    env.bind("divmod", Value::func(builtin_divmod));
    env.bind("enumerate", Value::func(builtin_enumerate));
    env.bind("filter", Value::func(builtin_filter));
    env.bind("float", Value::func(builtin_float));
    env.bind("format", Value::func(builtin_format));
    env.bind("frozenset", Value::func(builtin_set));
    env.bind("hash", Value::func(builtin_hash));
    env.bind("hex", Value::func(|a| radix(a, "hex", 16, "0x")));
    env.bind("int", Value::func(builtin_int));
    env.bind("isinstance", Value::func(unsupported("isinstance")));
    env.bind("issubclass", Value::func(unsupported("issubclass")));
    env.bind("len", Value::func(builtin_len));
    env.bind("list", Value::func(builtin_list));
    env.bind("long", Value::func(builtin_int));
    env.bind("map", Value::func(builtin_map));
    env.bind("max", Value::func(|a| extremum(a, "max", true)));
    env.bind("memoryview", Value::func(builtin_identity));
    env.bind("min", Value::func(|a| extremum(a, "min", false)));
    env.bind("next", Value::func(builtin_next));
    env.bind("oct", Value::func(|a| radix(a, "oct", 8, "0o")));
    env.bind("ord", Value::func(builtin_ord));
    env.bind("pow", Value::func(builtin_pow));
    env.bind("range", Value::func(builtin_range));
    env.bind("reduce", Value::func(builtin_reduce));
    env.bind("repr", Value::func(builtin_repr));
    env.bind("reversed", Value::func(builtin_reversed));
    env.bind("round", Value::func(builtin_round));
    env.bind("set", Value::func(builtin_set));
    env.bind("slice", Value::func(|a| Ok(Value::Tuple(a.positional))));
    env.bind("sorted", Value::func(builtin_sorted));
    env.bind("str", Value::func(builtin_str));
    env.bind("sum", Value::func(builtin_sum));
    env.bind("tuple", Value::func(builtin_tuple));
    env.bind("zip", Value::func(builtin_zip));

    env
}

fn unsupported(name: &'static str) -> impl Fn(CallArgs) -> Result<Value, EvalError> {
    move |_| {
        Err(EvalError::Type(format!(
            "{name}() is not supported in validator expressions"
        )))
    }
}

fn sequence_arg(args: &CallArgs, func: &str) -> Result<Vec<Value>, EvalError> {
    let value = args.require(0, func)?;
    value.items().ok_or_else(|| {
        EvalError::Type(format!(
            "{func}() argument must be iterable, got {}",
            value.type_name()
        ))
    })
}

fn builtin_identity(args: CallArgs) -> Result<Value, EvalError> {
    Ok(args.require(0, "memoryview")?.clone())
}

fn builtin_abs(args: CallArgs) -> Result<Value, EvalError> {
    match args.require(0, "abs")? {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        other => Err(EvalError::Type(format!(
            "bad operand type for abs(): {}",
            other.type_name()
        ))),
    }
}

fn builtin_all(args: CallArgs) -> Result<Value, EvalError> {
    Ok(Value::Bool(
        sequence_arg(&args, "all")?.iter().all(Value::truthy),
    ))
}

fn builtin_apply(args: CallArgs) -> Result<Value, EvalError> {
    let func = args.require(0, "apply")?.clone();
    let call_args = match args.arg(1) {
        Some(v) => v.items().ok_or_else(|| {
            EvalError::Type("apply() second argument must be a sequence".into())
        })?,
        None => Vec::new(),
    };
    call_value(&func, CallArgs::positional(call_args))
}

fn builtin_bool(args: CallArgs) -> Result<Value, EvalError> {
    Ok(Value::Bool(
        args.arg(0).map(Value::truthy).unwrap_or(false),
    ))
}

fn builtin_bytes(args: CallArgs) -> Result<Value, EvalError> {
    match args.require(0, "bytes")? {
        Value::Str(s) => Ok(Value::List(
            s.bytes().map(|b| Value::Int(b as i64)).collect(),
        )),
        other => Ok(Value::Str(other.to_string())),
    }
}

fn builtin_chr(args: CallArgs) -> Result<Value, EvalError> {
    match args.require(0, "chr")? {
        Value::Int(n) => char::from_u32(*n as u32)
            .map(|c| Value::Str(c.to_string()))
            .ok_or_else(|| EvalError::Value(format!("chr() arg out of range: {n}"))),
        other => Err(EvalError::Type(format!(
            "chr() requires an integer, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_cmp(args: CallArgs) -> Result<Value, EvalError> {
    let a = args.require(0, "cmp")?;
    let b = args.require(1, "cmp")?;
    let ordering = a.compare(b).ok_or_else(|| {
        EvalError::Type(format!(
            "cmp() not supported between {} and {}",
            a.type_name(),
            b.type_name()
        ))
    })?;
    Ok(Value::Int(ordering as i64))
}

fn builtin_divmod(args: CallArgs) -> Result<Value, EvalError> {
    match (args.require(0, "divmod")?, args.require(1, "divmod")?) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(EvalError::Value("division by zero".into()))
            } else {
                Ok(Value::Tuple(vec![
                    Value::Int(a.div_euclid(*b)),
                    Value::Int(a.rem_euclid(*b)),
                ]))
            }
        }
        (a, b) => match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) if b != 0.0 => Ok(Value::Tuple(vec![
                Value::Float(a.div_euclid(b)),
                Value::Float(a.rem_euclid(b)),
            ])),
            (Some(_), Some(_)) => Err(EvalError::Value("division by zero".into())),
            _ => Err(EvalError::Type("divmod() requires numbers".into())),
        },
    }
}

fn builtin_enumerate(args: CallArgs) -> Result<Value, EvalError> {
    let items = sequence_arg(&args, "enumerate")?;
    let start = match args.arg(1) {
        Some(Value::Int(n)) => *n,
        _ => 0,
    };
    Ok(Value::List(
        items
            .into_iter()
            .enumerate()
            .map(|(i, v)| Value::Tuple(vec![Value::Int(start + i as i64), v]))
            .collect(),
    ))
}

fn builtin_filter(args: CallArgs) -> Result<Value, EvalError> {
    let pred = args.require(0, "filter")?.clone();
    let items = args
        .require(1, "filter")?
        .items()
        .ok_or_else(|| EvalError::Type("filter() second argument must be iterable".into()))?;
    let mut out = Vec::new();
    for item in items {
        let keep = match &pred {
            Value::Null => item.truthy(),
            func => call_value(func, CallArgs::positional(vec![item.clone()]))?.truthy(),
        };
        if keep {
            out.push(item);
        }
    }
    Ok(Value::List(out))
}

fn builtin_float(args: CallArgs) -> Result<Value, EvalError> {
    let value = args.require(0, "float")?;
    if let Some(n) = value.as_number() {
        return Ok(Value::Float(n));
    }
    match value {
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| EvalError::Value(format!("could not convert {s:?} to float"))),
        other => Err(EvalError::Type(format!(
            "float() argument must be a string or a number, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_format(args: CallArgs) -> Result<Value, EvalError> {
    Ok(Value::Str(args.require(0, "format")?.to_string()))
}

fn builtin_hash(args: CallArgs) -> Result<Value, EvalError> {
    let mut hasher = DefaultHasher::new();
    args.require(0, "hash")?.repr().hash(&mut hasher);
    Ok(Value::Int(hasher.finish() as i64))
}

fn builtin_int(args: CallArgs) -> Result<Value, EvalError> {
    match args.require(0, "int")? {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| EvalError::Value(format!("invalid literal for int(): {s:?}"))),
        other => Err(EvalError::Type(format!(
            "int() argument must be a string or a number, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_len(args: CallArgs) -> Result<Value, EvalError> {
    let value = args.require(0, "len")?;
    value
        .length()
        .map(|n| Value::Int(n as i64))
        .ok_or_else(|| {
            EvalError::Type(format!("object of type {} has no len()", value.type_name()))
        })
}

fn builtin_list(args: CallArgs) -> Result<Value, EvalError> {
    match args.arg(0) {
        None => Ok(Value::List(Vec::new())),
        Some(_) => Ok(Value::List(sequence_arg(&args, "list")?)),
    }
}

fn builtin_map(args: CallArgs) -> Result<Value, EvalError> {
    let func = args.require(0, "map")?.clone();
    let items = args
        .require(1, "map")?
        .items()
        .ok_or_else(|| EvalError::Type("map() second argument must be iterable".into()))?;
    items
        .into_iter()
        .map(|item| call_value(&func, CallArgs::positional(vec![item])))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::List)
}

fn extremum(args: CallArgs, func: &str, want_max: bool) -> Result<Value, EvalError> {
    let items = if args.positional.len() > 1 {
        args.positional.clone()
    } else {
        sequence_arg(&args, func)?
    };
    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| EvalError::Value(format!("{func}() arg is an empty sequence")))?;
    for item in iter {
        let ordering = item.compare(&best).ok_or_else(|| {
            EvalError::Type(format!("{func}() arguments are not comparable"))
        })?;
        let better = if want_max {
            ordering == std::cmp::Ordering::Greater
        } else {
            ordering == std::cmp::Ordering::Less
        };
        if better {
            best = item;
        }
    }
    Ok(best)
}

fn builtin_next(args: CallArgs) -> Result<Value, EvalError> {
    let items = sequence_arg(&args, "next")?;
    items
        .into_iter()
        .next()
        .map(Ok)
        .unwrap_or_else(|| match args.arg(1) {
            Some(default) => Ok(default.clone()),
            None => Err(EvalError::Value("next() on an empty sequence".into())),
        })
}

fn builtin_ord(args: CallArgs) -> Result<Value, EvalError> {
    match args.require(0, "ord")? {
        Value::Str(s) if s.chars().count() == 1 => {
            Ok(Value::Int(s.chars().next().expect("checked") as i64))
        }
        other => Err(EvalError::Type(format!(
            "ord() expected a character, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_pow(args: CallArgs) -> Result<Value, EvalError> {
    let base = args.require(0, "pow")?;
    let exp = args.require(1, "pow")?;
    match (base, exp) {
        (Value::Int(b), Value::Int(e)) if *e >= 0 => {
            Ok(Value::Int(b.pow((*e).min(u32::MAX as i64) as u32)))
        }
        (a, b) => match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
            _ => Err(EvalError::Type("pow() requires numbers".into())),
        },
    }
}

fn builtin_range(args: CallArgs) -> Result<Value, EvalError> {
    let int_arg = |idx: usize| -> Result<i64, EvalError> {
        match args.require(idx, "range")? {
            Value::Int(n) => Ok(*n),
            other => Err(EvalError::Type(format!(
                "range() requires integers, got {}",
                other.type_name()
            ))),
        }
    };
    let (start, stop, step) = match args.positional.len() {
        1 => (0, int_arg(0)?, 1),
        2 => (int_arg(0)?, int_arg(1)?, 1),
        3 => (int_arg(0)?, int_arg(1)?, int_arg(2)?),
        n => {
            return Err(EvalError::Type(format!(
                "range() expected 1 to 3 arguments, got {n}"
            )))
        }
    };
    if step == 0 {
        return Err(EvalError::Value("range() step must not be zero".into()));
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        out.push(Value::Int(current));
        if out.len() > 1_000_000 {
            return Err(EvalError::Value("range() result too large".into()));
        }
        current += step;
    }
    Ok(Value::List(out))
}

fn builtin_reduce(args: CallArgs) -> Result<Value, EvalError> {
    let func = args.require(0, "reduce")?.clone();
    let items = args
        .require(1, "reduce")?
        .items()
        .ok_or_else(|| EvalError::Type("reduce() second argument must be iterable".into()))?;
    let mut iter = items.into_iter();
    let mut acc = match args.arg(2) {
        Some(init) => init.clone(),
        None => iter
            .next()
            .ok_or_else(|| EvalError::Value("reduce() of empty sequence".into()))?,
    };
    for item in iter {
        acc = call_value(&func, CallArgs::positional(vec![acc, item]))?;
    }
    Ok(acc)
}

fn builtin_repr(args: CallArgs) -> Result<Value, EvalError> {
    Ok(Value::Str(args.require(0, "repr")?.repr()))
}

fn builtin_reversed(args: CallArgs) -> Result<Value, EvalError> {
    let mut items = sequence_arg(&args, "reversed")?;
    items.reverse();
    Ok(Value::List(items))
}

fn builtin_round(args: CallArgs) -> Result<Value, EvalError> {
    let value = args
        .require(0, "round")?
        .as_number()
        .ok_or_else(|| EvalError::Type("round() requires a number".into()))?;
    match args.arg(1) {
        None => Ok(Value::Int(value.round() as i64)),
        Some(Value::Int(digits)) => {
            let factor = 10f64.powi(*digits as i32);
            Ok(Value::Float((value * factor).round() / factor))
        }
        Some(other) => Err(EvalError::Type(format!(
            "round() digits must be an integer, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_set(args: CallArgs) -> Result<Value, EvalError> {
    let items = sequence_arg(&args, "set")?;
    let mut out: Vec<Value> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    Ok(Value::List(out))
}

fn builtin_sorted(args: CallArgs) -> Result<Value, EvalError> {
    let mut items = sequence_arg(&args, "sorted")?;
    let mut failed = false;
    items.sort_by(|a, b| {
        a.compare(b).unwrap_or_else(|| {
            failed = true;
            std::cmp::Ordering::Equal
        })
    });
    if failed {
        return Err(EvalError::Type("sorted() arguments are not comparable".into()));
    }
    let reverse = args.kw("reverse").map(Value::truthy).unwrap_or(false);
    if reverse {
        items.reverse();
    }
    Ok(Value::List(items))
}

fn builtin_str(args: CallArgs) -> Result<Value, EvalError> {
    Ok(Value::Str(
        args.arg(0).map(Value::to_string).unwrap_or_default(),
    ))
}

fn builtin_sum(args: CallArgs) -> Result<Value, EvalError> {
    let items = sequence_arg(&args, "sum")?;
    let mut int_acc: i64 = match args.arg(1) {
        Some(Value::Int(n)) => *n,
        _ => 0,
    };
    let mut float_acc = match args.arg(1) {
        Some(Value::Float(f)) => Some(*f),
        _ => None,
    };
    for item in items {
        match (&item, float_acc) {
            (Value::Int(n), None) => int_acc += n,
            _ => {
                let n = item.as_number().ok_or_else(|| {
                    EvalError::Type(format!(
                        "unsupported operand type for sum(): {}",
                        item.type_name()
                    ))
                })?;
                float_acc = Some(float_acc.unwrap_or(int_acc as f64) + n);
            }
        }
    }
    Ok(match float_acc {
        Some(f) => Value::Float(f),
        None => Value::Int(int_acc),
    })
}

fn builtin_tuple(args: CallArgs) -> Result<Value, EvalError> {
    match args.arg(0) {
        None => Ok(Value::Tuple(Vec::new())),
        Some(_) => Ok(Value::Tuple(sequence_arg(&args, "tuple")?)),
    }
}

fn builtin_zip(args: CallArgs) -> Result<Value, EvalError> {
    let mut sequences = Vec::new();
    for (i, value) in args.positional.iter().enumerate() {
        sequences.push(value.items().ok_or_else(|| {
            EvalError::Type(format!("zip() argument #{} is not iterable", i + 1))
        })?);
    }
    let shortest = sequences.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(shortest);
    for i in 0..shortest {
        out.push(Value::Tuple(
            sequences.iter().map(|s| s[i].clone()).collect(),
        ));
    }
    Ok(Value::List(out))
}

fn radix(args: CallArgs, func: &str, base: u32, prefix: &str) -> Result<Value, EvalError> {
    match args.require(0, func)? {
        Value::Int(n) => {
            let sign = if *n < 0 { "-" } else { "" };
            let magnitude = n.unsigned_abs();
            let digits = match base {
                2 => format!("{magnitude:b}"),
                8 => format!("{magnitude:o}"),
                16 => format!("{magnitude:x}"),
                _ => unreachable!(),
            };
            Ok(Value::Str(format!("{sign}{prefix}{digits}")))
        }
        other => Err(EvalError::Type(format!(
            "{func}() requires an integer, got {}",
            other.type_name()
        ))),
    }
}
