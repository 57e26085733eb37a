//! Remote job plumbing: the transport seam, the reqwest client behind it,
//! retry policy and the status poller.

pub mod client;
pub mod poller;
pub mod retry;
#[cfg(test)]
pub(crate) mod testing;

use crate::error::TransportError;
use crate::model::{DownloadKind, DownloadedFile, JobHandle, JobStatus};
use async_trait::async_trait;

pub use client::RemoteClient;
pub use poller::{PollEvent, Poller};

/// The calls the controller and poller make against the remote job service.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Start a job for `model`. Never retried: the call is not idempotent.
    async fn start(&self, model: &str) -> Result<JobHandle, TransportError>;

    async fn fetch_status(&self, id: &str) -> Result<JobStatus, TransportError>;

    async fn download(
        &self,
        kind: DownloadKind,
        filename: &str,
    ) -> Result<DownloadedFile, TransportError>;

    /// Best-effort release of server-side resources.
    async fn cleanup(&self, id: &str) -> Result<(), TransportError>;
}
