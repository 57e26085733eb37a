//! Post-completion utilities.
//!
//! Decides which files a finished job offers for download and runs the
//! best-effort backend cleanup afterwards.

use crate::engine::JobTransport;
use crate::model::{ControllerConfig, DownloadKind, JobStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Companion "failed rows" filename for an output file: `out.csv` -> `out_failed.csv`.
///
/// This mirrors a naming convention of one backend deployment and is only used
/// when the backend does not name the file itself.
pub(crate) fn failed_companion(output_file: &str) -> String {
    match output_file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
            format!("{stem}_failed.{ext}")
        }
        _ => format!("{output_file}_failed"),
    }
}

/// The backend filename for `kind`, if this job has one.
pub(crate) fn file_for(kind: DownloadKind, status: &JobStatus, cfg: &ControllerConfig) -> Option<String> {
    match kind {
        DownloadKind::Output => status.output_file.clone(),
        DownloadKind::Debug => status.debug_file.clone(),
        DownloadKind::Failed => status.failed_file.clone().or_else(|| {
            cfg.derive_failed_file
                .then(|| status.output_file.as_deref().map(failed_companion))
                .flatten()
        }),
    }
}

/// Files to fetch automatically once a job is done, output last.
pub(crate) fn download_plan(status: &JobStatus, cfg: &ControllerConfig) -> Vec<(DownloadKind, String)> {
    let mut plan = Vec::new();
    if cfg.enable_debug_download {
        if let Some(f) = file_for(DownloadKind::Debug, status, cfg) {
            plan.push((DownloadKind::Debug, f));
        }
    }
    if let Some(f) = file_for(DownloadKind::Failed, status, cfg) {
        plan.push((DownloadKind::Failed, f));
    }
    if status.rows_parsed_count > 0 {
        if let Some(f) = file_for(DownloadKind::Output, status, cfg) {
            plan.push((DownloadKind::Output, f));
        }
    }
    plan
}

/// A cleanup call waiting for its delay to elapse.
pub(crate) struct PendingCleanup {
    pub job_id: String,
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PendingCleanup {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Issue the cleanup now if the delay has not elapsed yet, otherwise wait for it.
    pub async fn flush(self, transport: &dyn JobTransport) {
        // Whoever flips `fired` first owns the call.
        if self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.task.await;
            return;
        }
        self.task.abort();
        run_cleanup(transport, &self.job_id).await;
    }
}

/// Schedule `cleanup(id)` after `delay`.
pub(crate) fn spawn_cleanup(transport: Arc<dyn JobTransport>, job_id: String, delay: Duration) -> PendingCleanup {
    let fired = Arc::new(AtomicBool::new(false));
    let task_fired = fired.clone();
    let id = job_id.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if task_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        run_cleanup(transport.as_ref(), &id).await;
    });
    PendingCleanup { job_id, fired, task }
}

/// Best-effort: failures are logged and never retried.
pub(crate) async fn run_cleanup(transport: &dyn JobTransport, job_id: &str) {
    match transport.cleanup(job_id).await {
        Ok(()) => tracing::info!(process_id = job_id, "remote cleanup done"),
        Err(e) => tracing::warn!(process_id = job_id, error = %e, "remote cleanup failed"),
    }
}
