//! Scripted in-memory transport for poller and controller tests.

use crate::engine::JobTransport;
use crate::error::TransportError;
use crate::model::{DownloadKind, DownloadedFile, JobHandle, JobStatus};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct FakeTransport {
    starts: Mutex<VecDeque<Result<String, TransportError>>>,
    statuses: Mutex<HashMap<String, VecDeque<Result<JobStatus, TransportError>>>>,
    status_calls: Mutex<HashMap<String, usize>>,
    status_delay: Mutex<Duration>,
    start_delay: Mutex<Duration>,
    download_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    failing_downloads: Mutex<Vec<String>>,
    downloads: Mutex<Vec<String>>,
    cleanups: Mutex<Vec<String>>,
    fail_cleanup: Mutex<bool>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_status_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.status_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_start_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.start_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_download_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.download_delay.lock().unwrap() = delay;
        self
    }

    pub fn push_start(&self, result: Result<&str, TransportError>) {
        self.starts
            .lock()
            .unwrap()
            .push_back(result.map(str::to_string));
    }

    pub fn push_status(&self, id: &str, result: Result<JobStatus, TransportError>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn fail_download(&self, filename: &str) {
        self.failing_downloads.lock().unwrap().push(filename.to_string());
    }

    pub fn fail_cleanup(&self) {
        *self.fail_cleanup.lock().unwrap() = true;
    }

    pub fn status_calls(&self, id: &str) -> usize {
        self.status_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn cleanups(&self) -> Vec<String> {
        self.cleanups.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobTransport for FakeTransport {
    async fn start(&self, model: &str) -> Result<JobHandle, TransportError> {
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .starts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted start".into())));
        next.map(|id| JobHandle {
            id,
            selected_model: model.to_string(),
        })
    }

    async fn fetch_status(&self, id: &str) -> Result<JobStatus, TransportError> {
        *self
            .status_calls
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.status_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Unscripted ticks keep the job running.
        self.statuses
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(JobStatus::processing(1, 0, 0)))
    }

    async fn download(
        &self,
        kind: DownloadKind,
        filename: &str,
    ) -> Result<DownloadedFile, TransportError> {
        self.downloads.lock().unwrap().push(filename.to_string());
        let delay = *self.download_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_downloads.lock().unwrap().iter().any(|f| f == filename) {
            return Err(TransportError::NotFound);
        }
        Ok(DownloadedFile {
            kind,
            filename: filename.to_string(),
            suggested_name: filename.to_string(),
            content_type: Some("text/csv".into()),
            bytes: Bytes::from(format!("contents of {filename}")),
        })
    }

    async fn cleanup(&self, id: &str) -> Result<(), TransportError> {
        self.cleanups.lock().unwrap().push(id.to_string());
        if *self.fail_cleanup.lock().unwrap() {
            return Err(TransportError::Http { status: 500 });
        }
        Ok(())
    }
}
