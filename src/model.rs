use crate::engine::retry::RetryPolicy;
use crate::error::TransportError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub auto_download: bool,
    pub enable_debug_download: bool,
    /// Guess `<stem>_failed.<ext>` when the backend does not name a failed-rows file.
    pub derive_failed_file: bool,
    pub cleanup: bool,
    #[serde(with = "humantime_serde")]
    pub cleanup_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8010".into(),
            poll_interval: Duration::from_secs(3),
            auto_download: true,
            enable_debug_download: false,
            derive_failed_file: false,
            cleanup: true,
            cleanup_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("email-parse-cli/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
        }
    }
}

/// Identifier for an in-flight remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub selected_model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Starting,
    Processing,
    Done,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Starting => "starting",
            JobState::Processing => "processing",
            JobState::Done => "done",
            JobState::Error => "error",
        }
    }
}

/// Snapshot of remote progress. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub emails_fetched_count: u64,
    pub emails_processed_count: u64,
    pub rows_parsed_count: u64,
    pub output_file: Option<String>,
    pub debug_file: Option<String>,
    pub failed_file: Option<String>,
    pub error_message: Option<String>,
}

impl JobStatus {
    pub fn processing(fetched: u64, processed: u64, rows: u64) -> Self {
        Self {
            state: JobState::Processing,
            emails_fetched_count: fetched,
            emails_processed_count: processed.min(fetched),
            rows_parsed_count: rows,
            output_file: None,
            debug_file: None,
            failed_file: None,
            error_message: None,
        }
    }

    #[cfg(test)]
    pub fn done(output_file: impl Into<String>, rows: u64) -> Self {
        Self {
            state: JobState::Done,
            rows_parsed_count: rows,
            output_file: Some(output_file.into()),
            ..Self::processing(0, 0, 0)
        }
    }

    #[cfg(test)]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Error,
            error_message: Some(message.into()),
            ..Self::processing(0, 0, 0)
        }
    }

    /// Fraction of fetched emails already processed, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.emails_fetched_count == 0 {
            return 0.0;
        }
        self.emails_processed_count as f64 / self.emails_fetched_count as f64
    }
}

/// Body of `GET /status/{process_id}` as the backend sends it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default)]
    pub email_count: Option<u64>,
    #[serde(default)]
    pub current_email: Option<u64>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub debug_file: Option<String>,
    #[serde(default)]
    pub debug_log: Option<String>,
    #[serde(default)]
    pub failed_file: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusResponse {
    /// Normalize the wire body into a `JobStatus`, enforcing the snapshot invariants.
    pub fn into_status(self) -> Result<JobStatus, TransportError> {
        let fetched = self.email_count.unwrap_or(0);
        let processed = self.current_email.unwrap_or(0).min(fetched);
        let rows = self.row_count.unwrap_or(0);
        let debug_file = non_empty(self.debug_file).or_else(|| non_empty(self.debug_log));

        let status = match self.status.trim().to_ascii_lowercase().as_str() {
            "done" => {
                let output_file = non_empty(self.output_file).ok_or_else(|| {
                    TransportError::BadResponse("status is done but no output_file was named".into())
                })?;
                JobStatus {
                    state: JobState::Done,
                    emails_fetched_count: fetched,
                    emails_processed_count: processed,
                    rows_parsed_count: rows,
                    output_file: Some(output_file),
                    debug_file,
                    failed_file: non_empty(self.failed_file),
                    error_message: None,
                }
            }
            "error" => JobStatus {
                state: JobState::Error,
                emails_fetched_count: fetched,
                emails_processed_count: processed,
                rows_parsed_count: rows,
                output_file: None,
                debug_file,
                failed_file: None,
                error_message: Some(
                    non_empty(self.error)
                        .unwrap_or_else(|| "remote reported an error without details".into()),
                ),
            },
            other => {
                if other != "processing" {
                    tracing::debug!(status = other, "treating unknown status as still running");
                }
                JobStatus {
                    debug_file,
                    ..JobStatus::processing(fetched, processed, rows)
                }
            }
        };
        Ok(status)
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

/// Why a job ended in `Error`, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobFailure {
    /// The backend ran the job and reported its own failure.
    RemoteReported(String),
    /// The backend could not be reached at all.
    Unreachable(String),
    /// The backend answered with a non-success status code.
    HttpStatus(u16),
    /// The status resource for the job no longer exists.
    StatusGone,
    /// The backend answered with something we cannot interpret.
    Malformed(String),
}

impl JobFailure {
    pub fn message(&self) -> String {
        match self {
            JobFailure::RemoteReported(msg) => format!("Remote reported an error: {msg}"),
            JobFailure::Unreachable(detail) => format!("Could not reach remote: {detail}"),
            JobFailure::HttpStatus(code) => format!("Remote answered with HTTP {code}"),
            JobFailure::StatusGone => "Status resource disappeared; polling stopped".into(),
            JobFailure::Malformed(detail) => format!("Unexpected response from remote: {detail}"),
        }
    }
}

impl From<TransportError> for JobFailure {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(detail) => JobFailure::Unreachable(detail),
            TransportError::Http { status } => JobFailure::HttpStatus(status),
            TransportError::NotFound => JobFailure::StatusGone,
            TransportError::BadResponse(detail) => JobFailure::Malformed(detail),
        }
    }
}

/// Everything a presentation layer needs to render the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub state: JobState,
    pub model: Option<String>,
    pub handle: Option<JobHandle>,
    pub status: Option<JobStatus>,
    pub failure: Option<JobFailure>,
    pub updated_at: String,
}

impl Default for ControllerSnapshot {
    fn default() -> Self {
        Self {
            state: JobState::Idle,
            model: None,
            handle: None,
            status: None,
            failure: None,
            updated_at: now_rfc3339(),
        }
    }
}

impl ControllerSnapshot {
    pub fn output_file(&self) -> Option<&str> {
        if self.state != JobState::Done {
            return None;
        }
        self.status.as_ref().and_then(|s| s.output_file.as_deref())
    }

    pub fn error_message(&self) -> Option<String> {
        if self.state != JobState::Error {
            return None;
        }
        self.failure.as_ref().map(JobFailure::message)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.id.as_str())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadKind {
    Output,
    Debug,
    Failed,
}

impl DownloadKind {
    pub fn label(self) -> &'static str {
        match self {
            DownloadKind::Output => "output",
            DownloadKind::Debug => "debug log",
            DownloadKind::Failed => "failed rows",
        }
    }
}

/// A downloaded file, handed to the presentation layer for persistence.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub kind: DownloadKind,
    /// Filename exactly as requested from the backend.
    pub filename: String,
    pub suggested_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    Snapshot(ControllerSnapshot),
    Downloaded(DownloadedFile),
    DownloadFailed {
        kind: DownloadKind,
        filename: String,
        message: String,
    },
    Info(InfoEvent),
    /// Terminal handling (including auto-downloads) is complete.
    Finished(ControllerSnapshot),
}

/// Structured info events emitted by the controller and consumed by UI/CLI layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    PollingStarted { id: String, interval: Duration },
    PollingStopped { id: String },
    Superseded { id: String },
    CleanupScheduled { id: String, delay: Duration },
    NoRowsParsed { id: String },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::PollingStarted { id, interval } => format!(
                "Polling job {id} every {}",
                humantime::format_duration(*interval)
            ),
            InfoEvent::PollingStopped { id } => format!("Stopped polling job {id}"),
            InfoEvent::Superseded { id } => {
                format!("Job {id} superseded by a new start; its polling was cancelled")
            }
            InfoEvent::CleanupScheduled { id, delay } => format!(
                "Cleanup for job {id} scheduled in {}",
                humantime::format_duration(*delay)
            ),
            InfoEvent::NoRowsParsed { id } => {
                format!("Job {id} parsed no rows. Check logs or try different emails.")
            }
        }
    }
}
