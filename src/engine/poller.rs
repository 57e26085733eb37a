//! Periodic status polling for a single job.
//!
//! Fetches never overlap: the next tick is only awaited once the previous
//! fetch (retries included) has resolved, and missed ticks are delayed rather
//! than bunched up.

use crate::engine::retry::{with_retry, RetryPolicy};
use crate::engine::JobTransport;
use crate::error::TransportError;
use crate::model::{JobHandle, JobStatus};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Outcome of one poll tick, delivered to the poller's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Status(JobStatus),
    /// The status fetch failed for good; polling has stopped.
    Failed(TransportError),
}

/// Handle to a running poll loop. Dropping it stops polling.
pub struct Poller {
    job_id: String,
    // Open while callbacks may run. Delivery happens under this lock, so
    // once `stop` has flipped it no callback can start.
    gate: Arc<Mutex<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn start<F>(
        transport: Arc<dyn JobTransport>,
        handle: &JobHandle,
        interval: Duration,
        retry: RetryPolicy,
        on_update: F,
    ) -> Self
    where
        F: Fn(PollEvent) + Send + Sync + 'static,
    {
        let gate = Arc::new(Mutex::new(true));
        let job_id = handle.id.clone();
        let task_gate = gate.clone();
        let id = job_id.clone();
        let interval = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let transport = &transport;
            let id = id.as_str();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let res = with_retry(&retry, "status", move || transport.fetch_status(id)).await;
                let (event, finished) = match res {
                    Ok(status) => {
                        let finished = status.state.is_terminal();
                        (PollEvent::Status(status), finished)
                    }
                    Err(e) => {
                        tracing::warn!(process_id = %id, error = %e, "status poll failed, stopping");
                        (PollEvent::Failed(e), true)
                    }
                };
                if !deliver(&task_gate, &on_update, event) || finished {
                    break;
                }
            }
            close(&task_gate);
            tracing::debug!(process_id = %id, "poll loop exited");
        });

        tracing::debug!(process_id = %job_id, interval_ms = interval.as_millis() as u64, "poll loop started");
        Self {
            job_id,
            gate,
            task: Some(task),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// True until the loop hit a stop condition or `stop` was called.
    pub fn is_active(&self) -> bool {
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner)
            && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel polling. Idempotent; no callback runs after this returns.
    pub fn stop(&mut self) {
        close(&self.gate);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deliver<F: Fn(PollEvent)>(gate: &Mutex<bool>, on_update: &F, event: PollEvent) -> bool {
    let open = gate.lock().unwrap_or_else(PoisonError::into_inner);
    if !*open {
        return false;
    }
    on_update(event);
    true
}

fn close(gate: &Mutex<bool>) {
    *gate.lock().unwrap_or_else(PoisonError::into_inner) = false;
}
