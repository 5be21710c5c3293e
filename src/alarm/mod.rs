//! Alerting: failure descriptions, IM text formatting, HTML email
//! formatting, and the two delivery transports.
//!
//! Transport failures are logged and never propagate into the job
//! lifecycle; by the time an alert is being sent the job has already
//! failed.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use lettre::message::header::ContentType;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::job::Job;
use crate::errors::{MonitorError, Result};
use crate::expr::Value;
use crate::table::escape_html;

/// Maximum size of one IM payload chunk, in bytes.
pub const IM_CHUNK_SIZE: usize = 2048;

const SEPARATOR_HEAVY: &str = "====================";
const SEPARATOR_LIGHT: &str = "--------------------";

/// Display cap for tabular alarm contents.
const MAX_TABLE_ROWS: usize = 10;

/// Classification of a failure, driving the message layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    ConfigError,
    Claim,
    Diff,
    Exception,
    Default,
}

impl AlarmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmKind::ConfigError => "config_error",
            AlarmKind::Claim => "claim",
            AlarmKind::Diff => "diff",
            AlarmKind::Exception => "exception",
            AlarmKind::Default => "default",
        }
    }

    /// Unknown kind strings fall back to `Default`, which renders the
    /// generic layout.
    pub fn parse(s: &str) -> AlarmKind {
        match s {
            "config_error" => AlarmKind::ConfigError,
            "claim" => AlarmKind::Claim,
            "diff" => AlarmKind::Diff,
            "exception" => AlarmKind::Exception,
            _ => AlarmKind::Default,
        }
    }
}

/// A `(kind, content)` pair describing one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmInfo {
    pub kind: AlarmKind,
    pub content: Value,
}

impl AlarmInfo {
    pub fn new(kind: AlarmKind, content: Value) -> Self {
        Self { kind, content }
    }

    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::new(AlarmKind::ConfigError, Value::Str(reason.into()))
    }

    pub fn exception(trace: impl Into<String>) -> Self {
        Self::new(AlarmKind::Exception, Value::Str(trace.into()))
    }

    /// Coerce a validator-returned info value into an `AlarmInfo`:
    /// a 2-sequence is read as `(kind, content)`, anything else is wrapped
    /// with the generic kind.
    pub fn coerce(value: Value) -> Self {
        match value {
            Value::Alarm(info) => *info,
            Value::Tuple(items) | Value::List(items) if items.len() == 2 => {
                let mut items = items;
                let content = items.pop().expect("len checked");
                let kind = items.pop().expect("len checked");
                match kind {
                    Value::Str(s) => Self::new(AlarmKind::parse(&s), content),
                    other => Self::new(AlarmKind::Default, Value::Tuple(vec![other, content])),
                }
            }
            other => Self::new(AlarmKind::Default, other),
        }
    }
}

/// The job fields the formatters need. Built from a full [`Job`], or from
/// just a name when validation failed before a `Job` existed.
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    pub name: String,
    pub desc: String,
    pub due_time: Option<NaiveDateTime>,
    pub validator: String,
    pub sql: Vec<String>,
    pub datasources: Vec<String>,
}

impl JobSummary {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            desc: job.desc.clone(),
            due_time: Some(job.due_time),
            validator: job.validator.clone(),
            sql: job.sql_statements.clone(),
            datasources: job.datasources.iter().map(|d| d.name.clone()).collect(),
        }
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::Table(t) => t.to_text(MAX_TABLE_ROWS),
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Plain-text message for the IM channel.
pub fn format_text(job: &JobSummary, info: &AlarmInfo) -> String {
    // Any option may be missing when config validation failed, so the
    // config_error layout only relies on the job name.
    if info.kind == AlarmKind::ConfigError {
        return [
            format!("job: {}", job.name),
            SEPARATOR_HEAVY.to_string(),
            "reason: job config error".to_string(),
            SEPARATOR_LIGHT.to_string(),
            content_text(&info.content),
        ]
        .join("\n");
    }

    let due = job
        .due_time
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    let mut msg = vec![
        format!("monitor: {}", job.desc),
        format!("job: {}", job.name),
        format!("due: {due}"),
        SEPARATOR_HEAVY.to_string(),
    ];

    match info.kind {
        AlarmKind::Claim => {
            msg.push("reason: data missing or unqualified".to_string());
            msg.push(format!("validator: `{}`", job.validator));
            msg.push(SEPARATOR_LIGHT.to_string());
            msg.push("unqualified rows:".to_string());
            msg.push(content_text(&info.content));
        }
        AlarmKind::Diff => {
            msg.push("reason: data diff exceeds threshold".to_string());
            msg.push(format!("validator: `{}`", job.validator));
            msg.push(SEPARATOR_LIGHT.to_string());
            msg.push("unqualified rows:".to_string());
            msg.push(content_text(&info.content));
        }
        AlarmKind::Exception => {
            msg.push("reason: job raised an exception".to_string());
            msg.push(SEPARATOR_LIGHT.to_string());
            msg.push(content_text(&info.content));
        }
        _ => {
            msg.push("reason: validation failed".to_string());
            msg.push(SEPARATOR_LIGHT.to_string());
            msg.push(format!("validator: `{}`", job.validator));
            msg.push(format!("query result `result`: `{}`", info.content.repr()));
        }
    }

    msg.join("\n")
}

/// Convert free text into HTML paragraphs, preserving indentation.
fn text_to_html(text: &str) -> String {
    let body = escape_html(text)
        .replace('\t', "    ")
        .replace(' ', "&nbsp;")
        .replace('\n', "</p><p>");
    format!("<p>{body}</p>")
}

/// Kind-specific HTML mail templates. A directory override is honoured so
/// operators can restyle alerts without rebuilding; each file is looked up
/// as `{kind}.html`.
#[derive(Debug, Clone, Default)]
pub struct MailTemplates {
    dir: Option<PathBuf>,
}

impl MailTemplates {
    pub fn from_env() -> Self {
        Self {
            dir: std::env::var("DATAMON_TEMPLATE_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    fn load(&self, kind: AlarmKind) -> String {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.html", kind.as_str()));
            match std::fs::read_to_string(&path) {
                Ok(body) => return body,
                Err(err) => {
                    debug!("mail template {} unavailable: {err}", path.display());
                }
            }
        }
        match kind {
            AlarmKind::ConfigError => include_str!("../../templates/config_error.html"),
            AlarmKind::Claim => include_str!("../../templates/claim.html"),
            AlarmKind::Diff => include_str!("../../templates/diff.html"),
            AlarmKind::Exception => include_str!("../../templates/exception.html"),
            AlarmKind::Default => include_str!("../../templates/default.html"),
        }
        .to_string()
    }
}

/// HTML message for the email channel.
pub fn format_html(job: &JobSummary, info: &AlarmInfo, templates: &MailTemplates) -> String {
    let content = match (&info.kind, &info.content) {
        (AlarmKind::Claim | AlarmKind::Diff, Value::Table(t)) => t.to_html(),
        (AlarmKind::ConfigError | AlarmKind::Exception, value) => {
            text_to_html(&content_text(value))
        }
        (_, value) => escape_html(&content_text(value)),
    };

    let sql_html = job
        .sql
        .iter()
        .map(|s| format!("<p>{}</p>", escape_html(s).replace('\n', "</p><p>")))
        .collect::<Vec<_>>()
        .join("<hr/>");

    let due = job
        .due_time
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();

    templates
        .load(info.kind)
        .replace("{name}", &escape_html(&job.name))
        .replace("{desc}", &escape_html(&job.desc))
        .replace("{due_time}", &due)
        .replace("{validator}", &escape_html(&job.validator))
        .replace("{database}", &escape_html(&job.datasources.join(", ")))
        .replace("{sql}", &sql_html)
        .replace("{content}", &content)
}

/// Split a message into chunks of at most `limit` bytes, cutting after the
/// last newline inside the window when one exists, otherwise hard-cutting
/// on a char boundary. Joining the chunks reconstructs the input exactly.
pub fn chunk_message(msg: &str, limit: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < msg.len() {
        if msg.len() - start <= limit {
            chunks.push(&msg[start..]);
            break;
        }
        let mut end = start + limit;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        if let Some(pos) = msg[start..end].rfind('\n') {
            end = start + pos + 1;
        }
        chunks.push(&msg[start..end]);
        start = end;
    }
    chunks
}

/// HTTP gateway for instant messages.
#[derive(Debug, Clone)]
pub struct ImGateway {
    client: reqwest::Client,
    endpoint: Url,
    access_token: String,
}

impl ImGateway {
    pub fn new(endpoint: Url, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            access_token: access_token.into(),
        }
    }

    /// Build from `DATAMON_IM_ENDPOINT` / `DATAMON_IM_TOKEN`. Returns
    /// `None` when the gateway is not configured.
    pub fn from_env() -> Result<Option<Self>> {
        let endpoint = match std::env::var("DATAMON_IM_ENDPOINT") {
            Ok(e) if !e.is_empty() => e,
            _ => return Ok(None),
        };
        let token = std::env::var("DATAMON_IM_TOKEN").unwrap_or_default();
        Ok(Some(Self::new(Url::parse(&endpoint)?, token)))
    }

    /// POST one chunk to one recipient. Success is a JSON body whose
    /// `result` field equals `"ok"` case-insensitively.
    pub async fn send(&self, to: &str, content: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Payload<'a> {
            access_token: &'a str,
            msg_type: &'a str,
            to: &'a str,
            content: &'a str,
        }
        let form = Payload {
            access_token: &self.access_token,
            msg_type: "text",
            to,
            content,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .form(&form)
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        let ok = body
            .get("result")
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case("ok"))
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(MonitorError::Transport(format!(
                "IM gateway rejected message for {to:?}: {body}"
            )))
        }
    }

    /// Send `msg` to every recipient, chunked. The first failed chunk for a
    /// recipient stops that recipient; remaining recipients still get the
    /// message.
    pub async fn send_to_all(&self, recipients: &[String], msg: &str) {
        let chunks = chunk_message(msg, IM_CHUNK_SIZE);
        for to in recipients {
            for chunk in &chunks {
                if let Err(err) = self.send(to, chunk).await {
                    warn!("IM send to {to:?} failed: {err}");
                    break;
                }
            }
        }
    }
}

/// SMTP relay for email alerts. One SMTP session per dispatch.
#[derive(Debug, Clone)]
pub struct EmailRelay {
    relay: String,
    port: u16,
    from: String,
    default_domain: String,
}

impl EmailRelay {
    const SUBJECT: &'static str = "Data Monitor Alert";

    /// Build from `DATAMON_SMTP_RELAY` (required), `DATAMON_SMTP_PORT`
    /// (default 25), `DATAMON_SMTP_FROM`, `DATAMON_MAIL_DOMAIN`.
    pub fn from_env() -> Option<Self> {
        let relay = match std::env::var("DATAMON_SMTP_RELAY") {
            Ok(r) if !r.is_empty() => r,
            _ => return None,
        };
        let port = std::env::var("DATAMON_SMTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(25);
        let from = std::env::var("DATAMON_SMTP_FROM")
            .unwrap_or_else(|_| "datamon@localhost".to_string());
        let default_domain = std::env::var("DATAMON_MAIL_DOMAIN").unwrap_or_default();
        Some(Self {
            relay,
            port,
            from,
            default_domain,
        })
    }

    fn qualify(&self, user: &str) -> String {
        let user = user.trim();
        if user.contains('@') || self.default_domain.is_empty() {
            user.to_string()
        } else {
            format!("{user}@{}", self.default_domain)
        }
    }

    pub async fn send(&self, to_users: &[String], msg: &str) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.from.parse()?)
            .subject(Self::SUBJECT);
        for user in to_users {
            builder = builder.to(self.qualify(user).parse()?);
        }
        // text/html iff the body looks like markup
        let content_type = if msg.contains("</") && msg.contains('>') {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };
        let mail = builder.header(content_type).body(msg.to_string())?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.relay)
            .port(self.port)
            .build();
        transport.send(mail).await?;
        Ok(())
    }
}

/// Seam between the scheduler and the transports; tests substitute a
/// collecting sink.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn dispatch(
        &self,
        job: &JobSummary,
        alarm_im: &[String],
        alarm_email: &[String],
        info: &AlarmInfo,
    );
}

/// Production sink: formats and delivers through whichever transports are
/// configured. Empty recipient lists and missing transports are no-ops.
pub struct AlarmDispatcher {
    im: Option<ImGateway>,
    email: Option<EmailRelay>,
    templates: MailTemplates,
}

impl AlarmDispatcher {
    pub fn new(im: Option<ImGateway>, email: Option<EmailRelay>, templates: MailTemplates) -> Self {
        Self {
            im,
            email,
            templates,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self {
            im: ImGateway::from_env()?,
            email: EmailRelay::from_env(),
            templates: MailTemplates::from_env(),
        })
    }
}

#[async_trait]
impl AlertSink for AlarmDispatcher {
    async fn dispatch(
        &self,
        job: &JobSummary,
        alarm_im: &[String],
        alarm_email: &[String],
        info: &AlarmInfo,
    ) {
        if !alarm_im.is_empty() {
            match &self.im {
                Some(gateway) => {
                    let text = format_text(job, info);
                    gateway.send_to_all(alarm_im, &text).await;
                }
                None => debug!("IM gateway not configured, skipping IM alert"),
            }
        }
        if !alarm_email.is_empty() {
            match &self.email {
                Some(relay) => {
                    let html = format_html(job, info, &self.templates);
                    if let Err(err) = relay.send(alarm_email, &html).await {
                        warn!("email send failed: {err}");
                    }
                }
                None => debug!("SMTP relay not configured, skipping email alert"),
            }
        }
    }
}
