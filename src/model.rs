use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

/// Largest page the log query API will serve.
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub poll: PollPolicy,
    pub refresh_interval: Duration,
    pub page_size: u32,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_agent: format!("loglens/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(30),
            poll: PollPolicy::default(),
            refresh_interval: Duration::from_secs(30),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Pacing and give-up rules for job status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Consecutive transport failures tolerated before the tracker abandons the job.
    /// `None` polls through failures indefinitely.
    pub max_consecutive_errors: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_consecutive_errors: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("query text must not be empty")]
    EmptyQuery,
    #[error("page numbers start at 1 (got {0})")]
    InvalidPage(u32),
    #[error("anomaly threshold must be within [0, 1] (got {0})")]
    ThresholdOutOfRange(f64),
}

// ── Ingestion jobs ──────────────────────────────────────────────────

pub type JobId = String;

/// Lifecycle of an ingestion job. Variant order is the pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Uploading => "uploading",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "job_id", alias = "id")]
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub processed_count: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Outcome of applying a polled record to the tracked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced,
    Unchanged,
    Rejected,
}

impl JobRecord {
    pub fn queued(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            processed_count: 0,
            error: None,
        }
    }

    /// Apply a freshly polled record. Terminal records are immutable and
    /// status never moves backwards along the pipeline.
    pub fn advance(&mut self, next: &JobRecord) -> Transition {
        if self.status.is_terminal() || next.status < self.status {
            return Transition::Rejected;
        }
        if next.status == self.status
            && next.processed_count == self.processed_count
            && next.error == self.error
        {
            return Transition::Unchanged;
        }
        self.status = next.status;
        self.processed_count = next.processed_count;
        self.error = next.error.clone();
        Transition::Advanced
    }
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or(0))
}

/// File handed to the ingestion API.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub content: bytes::Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub job_id: JobId,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// Notifications emitted by a job tracker, in poll order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        job_id: JobId,
        status: JobStatus,
        processed_count: u64,
    },
    Completed {
        job_id: JobId,
        processed_count: u64,
    },
    Failed {
        job_id: JobId,
        error: String,
    },
    /// Polling gave up after repeated transport failures; the job itself may still finish.
    Abandoned {
        job_id: JobId,
        error: String,
        attempts: u32,
    },
}

impl JobEvent {
    pub(crate) fn from_record(job_id: &str, record: &JobRecord) -> Self {
        let job_id = job_id.to_string();
        match record.status {
            JobStatus::Completed => JobEvent::Completed {
                job_id,
                processed_count: record.processed_count,
            },
            JobStatus::Failed => JobEvent::Failed {
                job_id,
                error: record
                    .error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "job failed".to_string()),
            },
            status => JobEvent::Progress {
                job_id,
                status,
                processed_count: record.processed_count,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }
}

// ── Streaming analysis ──────────────────────────────────────────────

/// An analysis question. Serializes as the streaming API request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRequest {
    #[serde(rename = "query")]
    text: String,
    #[serde(rename = "log_ids")]
    referenced_ids: Vec<String>,
    #[serde(rename = "model", skip_serializing_if = "Option::is_none")]
    model_hint: Option<String>,
}

impl QueryRequest {
    pub fn new(
        text: impl Into<String>,
        referenced_ids: Vec<String>,
        model_hint: Option<String>,
    ) -> Result<Self, ValidationError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        Ok(Self {
            text,
            referenced_ids,
            model_hint: model_hint.filter(|m| !m.trim().is_empty()),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn referenced_ids(&self) -> &[String] {
        &self.referenced_ids
    }

    pub fn model_hint(&self) -> Option<&str> {
        self.model_hint.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TokenChunk(String),
    FinalResult(String),
    ErrorEvent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    High,
    Critical,
}

/// Root-cause analysis returned as the terminal payload of a streaming query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub cause: String,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub affected_services: Vec<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Structured(AnalysisResult),
    /// Terminal payload was not a structured result; the raw text is kept as-is.
    Fallback(String),
}

impl AnalysisOutcome {
    /// Interpret a terminal payload. An empty payload is read from the text
    /// accumulated from token chunks instead. Unstructured outcomes keep both
    /// the streamed text and the payload.
    pub fn from_payload(payload: &str, accumulated: &str) -> Self {
        let source = if payload.trim().is_empty() {
            accumulated
        } else {
            payload
        };
        match serde_json::from_str::<AnalysisResult>(strip_code_fence(source.trim())) {
            Ok(result) => AnalysisOutcome::Structured(result),
            Err(_) => AnalysisOutcome::Fallback(fallback_text(source, accumulated)),
        }
    }
}

fn fallback_text(payload: &str, accumulated: &str) -> String {
    if accumulated.trim().is_empty() || payload.contains(accumulated) {
        payload.to_string()
    } else if accumulated.contains(payload) {
        accumulated.to_string()
    } else {
        format!("{accumulated}\n{payload}")
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Idle,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueryEvent {
    /// Everything received so far, concatenated in arrival order.
    Partial { text: String },
    Completed { outcome: AnalysisOutcome },
    Errored { message: String },
}

// ── Log browsing ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
}

/// User-facing filter and pagination state. The next log request is a pure
/// function of this value (see [`FilterState::to_query`]).
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub service: Option<String>,
    pub level: Option<String>,
    /// Minimum anomaly score; `0.0` means unfiltered.
    pub anomaly_threshold: f64,
    pub search_text: Option<String>,
    pub window: TimeWindow,
    pub page: u32,
    pub page_size: u32,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            service: None,
            level: None,
            anomaly_threshold: 0.0,
            search_text: None,
            window: TimeWindow::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Partial filter update. Present fields override; an empty string clears a text filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPatch {
    pub service: Option<String>,
    pub level: Option<String>,
    pub anomaly_threshold: Option<f64>,
    pub search_text: Option<String>,
    pub window: Option<TimeWindow>,
}

impl FilterPatch {
    /// A patch that resets every filter to unset.
    pub fn cleared() -> Self {
        Self {
            service: Some(String::new()),
            level: Some(String::new()),
            anomaly_threshold: Some(0.0),
            search_text: Some(String::new()),
            window: Some(TimeWindow::default()),
        }
    }
}

impl FilterState {
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Merge `patch` into the filters. Leaves the page untouched; callers decide.
    pub fn merge(&mut self, patch: FilterPatch) -> Result<(), ValidationError> {
        if let Some(threshold) = patch.anomaly_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ValidationError::ThresholdOutOfRange(threshold));
            }
            self.anomaly_threshold = threshold;
        }
        if let Some(service) = patch.service {
            self.service = non_empty(service);
        }
        if let Some(level) = patch.level {
            self.level = non_empty(level).map(|l| l.to_ascii_uppercase());
        }
        if let Some(search) = patch.search_text {
            self.search_text = non_empty(search);
        }
        if let Some(window) = patch.window {
            self.window = window;
        }
        Ok(())
    }

    pub fn to_query(&self) -> LogQuery {
        LogQuery {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, MAX_PAGE_SIZE),
            service: self.service.clone(),
            level: self.level.clone(),
            min_anomaly_score: (self.anomaly_threshold > 0.0).then_some(self.anomaly_threshold),
            search: self.search_text.clone(),
            start_time: self.window.start.and_then(format_rfc3339),
            end_time: self.window.end.and_then(format_rfc3339),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn format_rfc3339(ts: OffsetDateTime) -> Option<String> {
    ts.format(&time::format_description::well_known::Rfc3339).ok()
}

/// Query-string parameters of the paged log API. Unset filters are omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogQuery {
    pub page: u32,
    pub page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_anomaly_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDocument {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    pub timestamp: String,
    pub level: String,
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub anomaly_score: f64,
    #[serde(default)]
    pub raw_line: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    #[serde(default)]
    pub logs: Vec<LogDocument>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pages: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    #[serde(default)]
    pub total_logs: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub warn_count: u64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub top_services: Vec<String>,
    #[serde(default)]
    pub anomaly_count: u64,
    #[serde(default)]
    pub hourly_breakdown: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Health {
    pub alive: bool,
}

impl Health {
    /// Accepts both `{"alive": true}` and `{"status": "ok"}` shaped bodies.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let alive = value
            .get("alive")
            .and_then(serde_json::Value::as_bool)
            .or_else(|| {
                value
                    .get("status")
                    .and_then(serde_json::Value::as_str)
                    .map(|s| matches!(s.to_ascii_lowercase().as_str(), "ok" | "healthy" | "up"))
            })
            .unwrap_or(false);
        Self { alive }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    Logs,
    Analytics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    PageLoaded { query: LogQuery, page: LogPage },
    Summary { analytics: Analytics },
    Liveness { alive: bool },
    FetchFailed { what: FetchKind, message: String },
}
