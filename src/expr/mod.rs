//! Expression sublanguage for validators and config templates.
//!
//! User-authored validator expressions and `{expr | filter(...)}` template
//! spans are evaluated by this small interpreter rather than any
//! host-language eval, so the builtin allow-list is enforceable: an
//! expression can only reach the names its environment explicitly binds.

pub mod builtins;
mod eval;
mod lexer;
mod parser;
mod value;

pub use builtins::{builtin_env, ALLOWED_NAMES};
pub use eval::{call_value, eval_expr, Env};
pub use parser::{parse, BinOp, Expr};
pub use value::{CallArgs, EvalError, NativeFn, Value};

/// Parse and evaluate in one step.
pub fn eval_str(src: &str, env: &Env) -> Result<Value, EvalError> {
    eval_expr(&parse(src)?, env)
}
