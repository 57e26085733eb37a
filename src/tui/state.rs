use crate::model::{ControllerSnapshot, JobEvent, JobState};
use ratatui::{
    style::Color,
    style::Style,
    text::{Line, Span},
};
use std::path::PathBuf;
use std::time::Instant;

/// Models the backend offers.
pub const MODELS: [&str; 4] = ["grok-3", "grok-3-fast", "grok-3-mini", "grok-3-mini-fast"];

const MAX_ACTIVITY: usize = 200;

pub struct UiState {
    pub tab: usize,
    pub info: String,
    /// Selectable models: the known list plus a custom `--model`, if any.
    pub models: Vec<String>,
    pub model_idx: usize,
    pub snapshot: ControllerSnapshot,

    /// Rows parsed per status update, for the sparkline.
    pub rows_series: Vec<u64>,
    pub job_started: Option<Instant>,
    pub job_elapsed: Option<std::time::Duration>,

    /// Timestamped activity lines (newest last).
    pub activity: Vec<String>,
    pub saved: Vec<PathBuf>,
    pub out_dir: PathBuf,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            info: String::new(),
            models: MODELS.iter().map(|m| m.to_string()).collect(),
            model_idx: 0,
            snapshot: ControllerSnapshot::default(),
            rows_series: Vec::new(),
            job_started: None,
            job_elapsed: None,
            activity: Vec::new(),
            saved: Vec::new(),
            out_dir: PathBuf::from("."),
        }
    }
}

impl UiState {
    /// Select `model`, adding it to the cycle when it is not one of the known ones.
    pub fn with_model(mut self, model: &str) -> Self {
        let model = model.trim();
        if model.is_empty() {
            return self;
        }
        self.model_idx = match self.models.iter().position(|m| m == model) {
            Some(idx) => idx,
            None => {
                self.models.push(model.to_string());
                self.models.len() - 1
            }
        };
        self
    }

    pub fn model(&self) -> &str {
        self.models
            .get(self.model_idx)
            .map(String::as_str)
            .unwrap_or(MODELS[0])
    }

    pub fn cycle_model(&mut self, forward: bool) {
        let n = self.models.len().max(1);
        self.model_idx = if forward {
            (self.model_idx + 1) % n
        } else {
            (self.model_idx + n - 1) % n
        };
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.snapshot.state,
            JobState::Starting | JobState::Processing
        )
    }

    /// Forget everything about the previous job before a new start.
    pub fn reset_job(&mut self) {
        self.rows_series.clear();
        self.saved.clear();
        self.job_started = Some(Instant::now());
        self.job_elapsed = None;
    }

    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.job_elapsed
            .or_else(|| self.job_started.map(|t| t.elapsed()))
    }

    pub fn log(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        let ts = time::OffsetDateTime::now_local()
            .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
        let stamp = ts
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_default();
        self.activity.push(format!("{stamp} {msg}"));
        if self.activity.len() > MAX_ACTIVITY {
            let excess = self.activity.len() - MAX_ACTIVITY;
            self.activity.drain(0..excess);
        }
        self.info = msg;
    }

    pub fn push_series(series: &mut Vec<u64>, v: u64) {
        const MAX: usize = 120;
        series.push(v);
        if series.len() > MAX {
            let excess = series.len() - MAX;
            series.drain(0..excess);
        }
    }
}

/// Apply one controller event to the UI model. Downloaded files are written to `out_dir`.
pub fn apply_event(state: &mut UiState, ev: JobEvent) {
    match ev {
        JobEvent::Snapshot(snap) => {
            if let Some(status) = snap.status.as_ref() {
                if snap.state == JobState::Processing {
                    UiState::push_series(&mut state.rows_series, status.rows_parsed_count);
                }
            }
            state.snapshot = snap;
        }
        JobEvent::Downloaded(file) => {
            match crate::storage::save_download(&state.out_dir, &file) {
                Ok(p) => {
                    state.log(format!("Saved {}: {}", file.kind.label(), p.display()));
                    state.saved.push(p);
                }
                Err(e) => state.log(format!("Save of {} failed: {e:#}", file.filename)),
            }
        }
        JobEvent::DownloadFailed {
            kind,
            filename,
            message,
        } => {
            state.log(format!(
                "Download of {} ({filename}) failed: {message}",
                kind.label()
            ));
        }
        JobEvent::Info(info) => state.log(info.to_message()),
        JobEvent::Finished(snap) => {
            state.job_elapsed = state.job_started.map(|t| t.elapsed());
            let msg = match snap.state {
                JobState::Done => format!(
                    "Job done: {} rows parsed",
                    snap.status
                        .as_ref()
                        .map(|s| s.rows_parsed_count)
                        .unwrap_or(0)
                ),
                _ => snap
                    .error_message()
                    .unwrap_or_else(|| "Job failed".to_string()),
            };
            state.snapshot = snap;
            state.log(msg);
        }
    }
}

pub fn state_color(state: JobState) -> Color {
    match state {
        JobState::Idle => Color::Gray,
        JobState::Starting | JobState::Processing => Color::Yellow,
        JobState::Done => Color::Green,
        JobState::Error => Color::Red,
    }
}

pub fn push_wrapped_status_kv(
    out: &mut Vec<Line<'static>>,
    label: &str,
    value: &str,
    status_area_width: u16,
) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }

    // Account for borders (2 chars on each side)
    let usable_width = status_area_width.saturating_sub(4).max(1);
    let label_text = format!("{label}:");
    let label_width = label_text.chars().count() as u16;

    let value_chars: Vec<char> = value.chars().collect();
    let mut remaining = value_chars.as_slice();
    let mut first = true;

    while !remaining.is_empty() {
        let line_width = if first {
            usable_width.saturating_sub(label_width + 1).max(1)
        } else {
            usable_width.saturating_sub(2).max(1)
        };

        let chars_to_take = (remaining.len() as u16).min(line_width) as usize;
        let (line_chars, rest) = remaining.split_at(chars_to_take);
        let line_text: String = line_chars.iter().collect();

        if first {
            out.push(Line::from(vec![
                Span::styled(label_text.clone(), Style::default().fg(Color::Gray)),
                Span::raw(" "),
                Span::raw(line_text),
            ]));
            first = false;
        } else {
            out.push(Line::from(vec![Span::raw("  "), Span::raw(line_text)]));
        }

        remaining = rest;
    }
}
