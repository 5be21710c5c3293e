use thiserror::Error;
use tracing_subscriber::filter::FromEnvError;

/// Main error type for datamon operations
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Mail address error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Mail build error: {0}")]
    Mail(#[from] lettre::error::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Glob pattern error: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Tracing From Env Error: {0}")]
    FromEnv(#[from] FromEnvError),

    #[error("Expression error: {0}")]
    Eval(#[from] crate::expr::EvalError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conflicted job name {name:?} in {first:?} and {second:?}")]
    Conflict {
        name: String,
        first: String,
        second: String,
    },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Validator error: {0}")]
    Validator(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Convenience Result type that uses MonitorError
pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MonitorError::Config("missing option".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing option");
    }

    #[test]
    fn test_conflict_error_names_both_files() {
        let err = MonitorError::Conflict {
            name: "job_foo".into(),
            first: "a.cfg".into(),
            second: "b.cfg".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("job_foo"));
        assert!(msg.contains("a.cfg"));
        assert!(msg.contains("b.cfg"));
    }
}
