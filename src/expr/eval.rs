use std::cmp::Ordering;
use std::collections::HashMap;

use super::parser::{BinOp, Expr};
use super::value::{CallArgs, EvalError, Value};

/// Flat name environment for expression evaluation. There is no assignment
/// in the sublanguage, so a single scope is enough.
#[derive(Default, Clone)]
pub struct Env {
    names: HashMap<String, Value>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.names.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn merged(mut self, other: &Env) -> Self {
        for (k, v) in &other.names {
            self.names.insert(k.clone(), v.clone());
        }
        self
    }
}

/// Evaluate a parsed expression in `env`.
pub fn eval_expr(expr: &Expr, env: &Env) -> Result<Value, EvalError> {
    match expr {
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Name(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownName(name.clone())),
        Expr::Tuple(items) => Ok(Value::Tuple(eval_all(items, env)?)),
        Expr::List(items) => Ok(Value::List(eval_all(items, env)?)),
        Expr::Neg(inner) => match eval_expr(inner, env)? {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Bool(b) => Ok(Value::Int(-(b as i64))),
            other => Err(EvalError::Type(format!(
                "bad operand type for unary -: {}",
                other.type_name()
            ))),
        },
        Expr::Not(inner) => Ok(Value::Bool(!eval_expr(inner, env)?.truthy())),
        Expr::And(left, right) => {
            let lhs = eval_expr(left, env)?;
            if lhs.truthy() {
                eval_expr(right, env)
            } else {
                Ok(lhs)
            }
        }
        Expr::Or(left, right) => {
            let lhs = eval_expr(left, env)?;
            if lhs.truthy() {
                Ok(lhs)
            } else {
                eval_expr(right, env)
            }
        }
        Expr::Binary(op, left, right) => {
            let lhs = eval_expr(left, env)?;
            let rhs = eval_expr(right, env)?;
            eval_binary(*op, lhs, rhs)
        }
        Expr::Call { func, args, kwargs } => {
            let callee = eval_expr(func, env)?;
            let mut call = CallArgs::positional(eval_all(args, env)?);
            for (name, value_expr) in kwargs {
                call.keyword.push((name.clone(), eval_expr(value_expr, env)?));
            }
            call_value(&callee, call)
        }
        Expr::Index(target, index) => {
            let target = eval_expr(target, env)?;
            let index = eval_expr(index, env)?;
            eval_index(&target, &index)
        }
        Expr::Attr(target, name) => {
            let target = eval_expr(target, env)?;
            eval_attr(&target, name)
        }
        Expr::Pipe(value_expr, filter_expr) => {
            let value = eval_expr(value_expr, env)?;
            match filter_expr.as_ref() {
                Expr::Call { func, args, kwargs } => {
                    let callee = eval_expr(func, env)?;
                    let mut positional = vec![value];
                    positional.extend(eval_all(args, env)?);
                    let mut call = CallArgs::positional(positional);
                    for (name, v) in kwargs {
                        call.keyword.push((name.clone(), eval_expr(v, env)?));
                    }
                    call_value(&callee, call)
                }
                Expr::Name(_) => {
                    let callee = eval_expr(filter_expr, env)?;
                    call_value(&callee, CallArgs::positional(vec![value]))
                }
                other => Err(EvalError::Type(format!(
                    "filter target must be a call or a name, got {other:?}"
                ))),
            }
        }
    }
}

fn eval_all(items: &[Expr], env: &Env) -> Result<Vec<Value>, EvalError> {
    items.iter().map(|e| eval_expr(e, env)).collect()
}

pub fn call_value(callee: &Value, args: CallArgs) -> Result<Value, EvalError> {
    match callee {
        Value::Func(f) => f(args),
        other => Err(EvalError::Type(format!(
            "{} object is not callable",
            other.type_name()
        ))),
    }
}

fn eval_binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = lhs.compare(&rhs).ok_or_else(|| {
                EvalError::Type(format!(
                    "'{}' not supported between {} and {}",
                    op_symbol(op),
                    lhs.type_name(),
                    rhs.type_name()
                ))
            })?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                BinOp::Ge => ordering != Ordering::Less,
                _ => unreachable!(),
            }))
        }
        BinOp::In => {
            let found = match &rhs {
                Value::Str(haystack) => match &lhs {
                    Value::Str(needle) => haystack.contains(needle.as_str()),
                    _ => false,
                },
                other => other
                    .items()
                    .ok_or_else(|| {
                        EvalError::Type(format!(
                            "argument of type {} is not iterable",
                            other.type_name()
                        ))
                    })?
                    .iter()
                    .any(|item| *item == lhs),
            };
            Ok(Value::Bool(found))
        }
        BinOp::Add => match (&lhs, &rhs) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::List(out))
            }
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            _ => numeric_op(op, &lhs, &rhs),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                BinOp::Sub => Ok(Value::Int(a - b)),
                BinOp::Mul => Ok(Value::Int(a * b)),
                BinOp::Div => {
                    if *b == 0 {
                        Err(EvalError::Value("division by zero".into()))
                    } else {
                        Ok(Value::Float(*a as f64 / *b as f64))
                    }
                }
                BinOp::Mod => {
                    if *b == 0 {
                        Err(EvalError::Value("modulo by zero".into()))
                    } else {
                        Ok(Value::Int(a.rem_euclid(*b)))
                    }
                }
                _ => unreachable!(),
            },
            _ => numeric_op(op, &lhs, &rhs),
        },
    }
}

fn numeric_op(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let (a, b) = match (lhs.as_number(), rhs.as_number()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(EvalError::Type(format!(
                "unsupported operand types for {}: {} and {}",
                op_symbol(op),
                lhs.type_name(),
                rhs.type_name()
            )))
        }
    };
    match op {
        BinOp::Add => Ok(Value::Float(a + b)),
        BinOp::Sub => Ok(Value::Float(a - b)),
        BinOp::Mul => Ok(Value::Float(a * b)),
        BinOp::Div => {
            if b == 0.0 {
                Err(EvalError::Value("division by zero".into()))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        BinOp::Mod => {
            if b == 0.0 {
                Err(EvalError::Value("modulo by zero".into()))
            } else {
                Ok(Value::Float(a.rem_euclid(b)))
            }
        }
        _ => unreachable!(),
    }
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::In => "in",
    }
}

fn eval_index(target: &Value, index: &Value) -> Result<Value, EvalError> {
    let idx = match index {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        other => {
            return Err(EvalError::Type(format!(
                "indices must be integers, not {}",
                other.type_name()
            )))
        }
    };
    let len = target.length().ok_or_else(|| {
        EvalError::Type(format!(
            "{} object is not subscriptable",
            target.type_name()
        ))
    })? as i64;
    let resolved = if idx < 0 { len + idx } else { idx };
    if resolved < 0 || resolved >= len {
        return Err(EvalError::Value(format!("index {idx} out of range")));
    }
    let resolved = resolved as usize;
    match target {
        Value::Tuple(items) | Value::List(items) => Ok(items[resolved].clone()),
        Value::Table(t) => Ok(Value::Record(t.row(resolved).expect("index checked"))),
        Value::Record(r) => Ok(r.values[resolved].clone()),
        Value::Str(s) => Ok(Value::Str(
            s.chars().nth(resolved).map(String::from).unwrap_or_default(),
        )),
        _ => unreachable!("length() returned Some for unindexable value"),
    }
}

fn eval_attr(target: &Value, name: &str) -> Result<Value, EvalError> {
    match target {
        Value::Record(r) => r.get(name).cloned().ok_or_else(|| {
            EvalError::Value(format!("record has no field {name:?}"))
        }),
        Value::Alarm(info) => match name {
            "kind" => Ok(Value::Str(info.kind.as_str().to_string())),
            "content" => Ok(info.content.clone()),
            _ => Err(EvalError::Value(format!(
                "alarm_info has no attribute {name:?}"
            ))),
        },
        other => Err(EvalError::Type(format!(
            "{} object has no attribute {name:?}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;

    fn eval_src(src: &str, env: &Env) -> Result<Value, EvalError> {
        eval_expr(&parse(src)?, env)
    }

    fn env_with_result(value: Value) -> Env {
        let mut env = Env::new();
        env.bind("result", value);
        env
    }

    #[test]
    fn comparison_over_result() {
        let env = env_with_result(Value::Int(1));
        assert_eq!(eval_src("result == 1", &env).unwrap(), Value::Bool(true));
        assert_eq!(eval_src("result > 3", &env).unwrap(), Value::Bool(false));
    }

    #[test]
    fn unknown_name_is_distinguishable() {
        let env = Env::new();
        assert_eq!(
            eval_src("no_such_fn(1)", &env),
            Err(EvalError::UnknownName("no_such_fn".into()))
        );
    }

    #[test]
    fn short_circuit_and_returns_operand() {
        let env = env_with_result(Value::Int(0));
        assert_eq!(eval_src("result and 5", &env).unwrap(), Value::Int(0));
        assert_eq!(eval_src("result or 5", &env).unwrap(), Value::Int(5));
    }

    #[test]
    fn pipe_applies_function() {
        let mut env = Env::new();
        env.bind(
            "double",
            Value::func(|args| match args.require(0, "double")? {
                Value::Int(n) => Ok(Value::Int(n * 2)),
                other => Err(EvalError::Type(format!("bad arg {other:?}"))),
            }),
        );
        assert_eq!(eval_src("3 | double", &env).unwrap(), Value::Int(6));
    }

    #[test]
    fn negative_index_wraps() {
        let env = env_with_result(Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(eval_src("result[-1]", &env).unwrap(), Value::Int(2));
    }

    #[test]
    fn kwargs_reach_callee() {
        let mut env = Env::new();
        env.bind(
            "pick",
            Value::func(|args| {
                Ok(args.kw("key").cloned().unwrap_or(Value::Null))
            }),
        );
        assert_eq!(
            eval_src("pick(key=7)", &env).unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn division_by_zero_is_value_error() {
        let env = Env::new();
        assert!(matches!(
            eval_src("1 / 0", &env),
            Err(EvalError::Value(_))
        ));
    }
}
