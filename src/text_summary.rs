//! Text summary builder for CLI output.
//!
//! Formats progress lines while a job runs and the human-readable result once it ends.

use crate::model::{ControllerSnapshot, JobState, JobStatus};
use std::path::PathBuf;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// One progress line for a snapshot, or `None` when there is nothing new to say.
pub(crate) fn progress_line(snap: &ControllerSnapshot) -> Option<String> {
    match snap.state {
        JobState::Idle => None,
        JobState::Starting => Some(format!(
            "Starting job with model {}...",
            snap.model.as_deref().unwrap_or("-")
        )),
        JobState::Processing => {
            let id = snap.job_id()?;
            Some(match snap.status.as_ref() {
                Some(s) => format!("[{id}] {}", counts(s)),
                None => format!("[{id}] started, waiting for first status"),
            })
        }
        JobState::Done | JobState::Error => None,
    }
}

fn counts(s: &JobStatus) -> String {
    format!(
        "emails {}/{} ({:.0}%), rows parsed {}",
        s.emails_processed_count,
        s.emails_fetched_count,
        s.progress() * 100.0,
        s.rows_parsed_count
    )
}

/// Final summary for a finished job plus whatever was saved locally.
pub(crate) fn build_text_summary(snap: &ControllerSnapshot, saved: &[PathBuf]) -> TextSummary {
    let mut lines = Vec::new();

    if let Some(id) = snap.job_id() {
        lines.push(format!("Job: {id}"));
    }
    if let Some(model) = snap.model.as_deref() {
        lines.push(format!("Model: {model}"));
    }
    lines.push(format!("State: {}", snap.state.label()));

    if let Some(s) = snap.status.as_ref() {
        lines.push(format!(
            "Emails: {} processed of {} fetched",
            s.emails_processed_count, s.emails_fetched_count
        ));
        lines.push(format!("Rows parsed: {}", s.rows_parsed_count));
    }
    if let Some(out) = snap.output_file() {
        lines.push(format!("Output file: {out}"));
    }
    if let Some(err) = snap.error_message() {
        lines.push(format!("Error: {err}"));
    }
    for p in saved {
        lines.push(format!("Saved: {}", p.display()));
    }

    TextSummary { lines }
}
