use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::collector::StructuredOutput;
use crate::profile::{ProfileOverrides, ResourceProfile};
use crate::serde_util::{millis, serialize_iso};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owning user or account; the unit of fairness and quota accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured output the caller declares; selects the parser, never auto-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Key-value document.
    #[default]
    #[serde(alias = "document")]
    Json,
    /// Ordered rows of named fields.
    #[serde(alias = "tabular", alias = "records")]
    Csv,
    #[serde(alias = "markup")]
    Xml,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Xml => "xml",
        }
    }

    /// File extension of the output file handed to the script.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "document" => Ok(Self::Json),
            "csv" | "tabular" | "records" => Ok(Self::Csv),
            "xml" | "markup" => Ok(Self::Xml),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// A submission as received from the caller, before admission.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    /// Caller-supplied identifier; the engine assigns one when absent.
    #[serde(default)]
    pub id: Option<JobId>,
    pub tenant: TenantId,
    pub script: String,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub overrides: ProfileOverrides,
}

impl JobRequest {
    pub fn new(tenant: impl Into<String>, script: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            id: None,
            tenant: TenantId::new(tenant),
            script: script.into(),
            format,
            target_url: None,
            overrides: ProfileOverrides::default(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn with_overrides(mut self, overrides: ProfileOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// One admitted request to run a script.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub id: JobId,
    pub tenant: TenantId,
    pub script: Arc<str>,
    pub format: OutputFormat,
    pub target_url: Option<Url>,
    pub submitted_at: DateTime<Utc>,
    /// Fixed at admission; never changes once the job starts.
    pub profile: ResourceProfile,
    pub state: JobState,
    pub result: Option<ExecutionResult>,
}

impl ExecutionJob {
    pub fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            tenant: self.tenant.clone(),
            format: self.format,
            target_url: self.target_url.as_ref().map(Url::to_string),
            submitted_at: self.submitted_at,
            finished_at: Utc::now(),
        }
    }
}

/// Job metadata handed to the persistence sink with the terminal result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub tenant: TenantId,
    pub format: OutputFormat,
    pub target_url: Option<String>,
    #[serde(serialize_with = "serialize_iso")]
    pub submitted_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    pub finished_at: DateTime<Utc>,
}

/// Which terminal variant a job ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialOutput,
    Failure,
    TimedOut,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialOutput => "partial_output",
            Self::Failure => "failure",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Starting,
    Running,
    Collecting,
    Terminal(Outcome),
}

impl JobState {
    /// Position in the lifecycle. A job only ever moves to a higher rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Collecting => 3,
            Self::Terminal(_) => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Collecting => "collecting",
            Self::Terminal(outcome) => outcome.as_str(),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobState {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The host could not provide an isolated environment.
    SandboxUnavailable,
    /// The script exited non-zero or was killed by a resource ceiling.
    ScriptError,
    /// Engine infrastructure failed while supervising the job.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SandboxUnavailable => f.write_str("sandbox_unavailable"),
            Self::ScriptError => f.write_str("script_error"),
            Self::Internal => f.write_str("internal"),
        }
    }
}

/// Why a zero-exit script did not yield a clean result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PartialReason {
    Empty,
    Unparseable(String),
    Truncated,
}

/// Terminal outcome of a job. Exactly one is produced per job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        output: StructuredOutput,
        format: OutputFormat,
        #[serde(rename = "duration_ms", with = "millis")]
        duration: Duration,
    },
    PartialOutput {
        /// Raw text the script produced, kept for diagnostic display.
        output: String,
        reason: PartialReason,
        #[serde(rename = "duration_ms", with = "millis")]
        duration: Duration,
    },
    Failure {
        kind: FailureKind,
        message: String,
        exit_code: Option<i32>,
    },
    TimedOut {
        #[serde(rename = "duration_ms", with = "millis")]
        duration: Duration,
    },
    Cancelled,
}

impl ExecutionResult {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Success { .. } => Outcome::Success,
            Self::PartialOutput { .. } => Outcome::PartialOutput,
            Self::Failure { .. } => Outcome::Failure,
            Self::TimedOut { .. } => Outcome::TimedOut,
            Self::Cancelled => Outcome::Cancelled,
        }
    }

    pub(crate) fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        match self {
            Self::Success { output, format, duration } => format!(
                "{} {format} record(s) in {:.1}s",
                output.record_count(),
                duration.as_secs_f64()
            ),
            Self::PartialOutput { reason, .. } => match reason {
                PartialReason::Empty => "script produced no output".into(),
                PartialReason::Unparseable(detail) => format!("output could not be parsed: {detail}"),
                PartialReason::Truncated => "output exceeded the size limit".into(),
            },
            Self::Failure { kind, message, .. } => format!("{kind}: {message}"),
            Self::TimedOut { duration } => {
                format!("timed out after {:.1}s", duration.as_secs_f64())
            }
            Self::Cancelled => "cancelled".into(),
        }
    }
}

/// Answer to a status query. `result` is present only once terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub tenant: TenantId,
    pub state: JobState,
    pub result: Option<ExecutionResult>,
}
