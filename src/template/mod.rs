//! Minimal `{ expr | filter(args) }` renderer for config options.
//!
//! Single-brace spans, no nesting. Rendering is two-pass: at load time
//! every string option renders with `BASETIME` in scope while spans
//! mentioning `DUETIME` are left untouched (the due time is not known
//! yet); once the due time is parsed, the dependent options re-render
//! with `DUETIME` bound.

use crate::errors::{MonitorError, Result};
use crate::expr::{eval_str, Env, Value};

/// Names whose spans survive pass-1 rendering verbatim.
pub const DEFERRED_TOKENS: &[&str] = &["DUETIME"];

/// Render every `{expr}` span of `input` against `env`. A string without
/// `{` is returned unchanged.
pub fn render(input: &str, env: &Env) -> Result<String> {
    render_deferring(input, env, &[])
}

/// Like [`render`], but spans containing any of `deferred` are emitted
/// verbatim instead of being evaluated.
pub fn render_deferring(input: &str, env: &Env, deferred: &[&str]) -> Result<String> {
    if !input.contains('{') {
        return Ok(input.to_string());
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let close = after_open.find('}').ok_or_else(|| {
            MonitorError::Template(format!(
                "unclosed '{{' in {input:?}"
            ))
        })?;
        let span = &after_open[..close];
        if span.contains('{') {
            return Err(MonitorError::Template(format!(
                "nested '{{' in template span {span:?}"
            )));
        }
        if deferred.iter().any(|token| span.contains(token)) {
            out.push('{');
            out.push_str(span);
            out.push('}');
        } else {
            let value = eval_str(span, env).map_err(|err| {
                MonitorError::Template(format!("failed rendering {{{span}}}: {err}"))
            })?;
            out.push_str(&stringify(&value));
        }
        rest = &after_open[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn env() -> Env {
        let base = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        crate::context::filter_env(&[("BASETIME", Value::DateTime(base))])
    }

    #[test]
    fn plain_string_is_identity() {
        assert_eq!(render("SELECT 1", &env()).unwrap(), "SELECT 1");
    }

    #[test]
    fn renders_filter_pipeline() {
        let out = render(
            "dt >= '{BASETIME | dt_add(days=-1) | dt_format}'",
            &env(),
        )
        .unwrap();
        assert_eq!(out, "dt >= '2024-05-31 00:00:00'");
    }

    #[test]
    fn defers_duetime_spans() {
        let out = render_deferring(
            "{BASETIME | dt_format(fmt='%Y-%m-%d')} and {DUETIME | dt_format}",
            &env(),
            DEFERRED_TOKENS,
        )
        .unwrap();
        assert_eq!(out, "2024-06-01 and {DUETIME | dt_format}");
    }

    #[test]
    fn unclosed_brace_is_an_error() {
        assert!(render("oops {BASETIME", &env()).is_err());
    }

    #[test]
    fn render_failure_names_span() {
        let err = render("{no_such_filter(1)}", &env()).unwrap_err();
        assert!(err.to_string().contains("no_such_filter"));
    }

    #[test]
    fn closing_brace_alone_is_literal() {
        assert_eq!(render("a } b", &env()).unwrap(), "a } b");
    }
}
