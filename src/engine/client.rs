use crate::engine::JobTransport;
use crate::error::TransportError;
use crate::model::{ControllerConfig, DownloadKind, DownloadedFile, JobHandle, JobStatus, StatusResponse};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct StartResponse {
    process_id: String,
}

#[derive(Debug, Deserialize)]
struct LogResponse {
    #[serde(default)]
    log: Option<String>,
}

/// HTTP client for the remote email-parsing service.
#[derive(Clone)]
pub struct RemoteClient {
    pub(crate) http: reqwest::Client,
    base_url: Url,
    // Deadline for small JSON calls. Downloads are bounded by the read timeout only.
    call_timeout: Duration,
}

impl RemoteClient {
    pub fn new(cfg: &ControllerConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid base URL: {}", cfg.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("base URL cannot carry a path: {}", cfg.base_url);
        }
        // Connect and per-read deadlines only; file bodies and proxied streams
        // may run longer than `request_timeout` in total.
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.request_timeout)
            .read_timeout(cfg.request_timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            call_timeout: cfg.request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Append percent-encoded path segments to the base URL (keeping any path prefix).
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let resp = req.send().await?;
        check_status(resp)
    }

    fn get(&self, segments: &[&str]) -> reqwest::RequestBuilder {
        self.http.get(self.endpoint(segments)).timeout(self.call_timeout)
    }

    /// Fetch the backend's processing log for a job, if it has one.
    pub async fn fetch_log(&self, id: &str) -> Result<Option<String>, TransportError> {
        let resp = self.send(self.get(&["log", id])).await?;
        let body: LogResponse = read_json(resp).await?;
        Ok(body.log)
    }

    /// Ping the backend so hosted instances do not spin down.
    pub async fn keep_alive(&self) -> Result<serde_json::Value, TransportError> {
        let resp = self.send(self.get(&["keep-alive"])).await?;
        read_json(resp).await
    }
}

#[async_trait]
impl JobTransport for RemoteClient {
    async fn start(&self, model: &str) -> Result<JobHandle, TransportError> {
        let mut url = self.endpoint(&["start-process"]);
        url.query_pairs_mut().append_pair("model", model);
        let resp = self.send(self.http.post(url).timeout(self.call_timeout)).await?;
        let body: StartResponse = read_json(resp).await?;
        let id = body.process_id.trim();
        if id.is_empty() {
            return Err(TransportError::BadResponse("empty process_id".into()));
        }
        tracing::info!(process_id = id, model, "remote job started");
        Ok(JobHandle {
            id: id.to_string(),
            selected_model: model.to_string(),
        })
    }

    async fn fetch_status(&self, id: &str) -> Result<JobStatus, TransportError> {
        let resp = self.send(self.get(&["status", id])).await?;
        let body: StatusResponse = read_json(resp).await?;
        body.into_status()
    }

    async fn download(
        &self,
        kind: DownloadKind,
        filename: &str,
    ) -> Result<DownloadedFile, TransportError> {
        let resp = self
            .send(self.http.get(self.endpoint(&["download", filename])))
            .await?;
        let headers = resp.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let suggested_name = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| filename.to_string());

        let mut buf = BytesMut::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Network(e.to_string()))?;
            buf.extend_from_slice(&chunk);
        }
        tracing::debug!(filename, bytes = buf.len(), "download complete");

        Ok(DownloadedFile {
            kind,
            filename: filename.to_string(),
            suggested_name,
            content_type,
            bytes: buf.freeze(),
        })
    }

    async fn cleanup(&self, id: &str) -> Result<(), TransportError> {
        self.send(
            self.http
                .post(self.endpoint(&["cleanup", id]))
                .timeout(self.call_timeout),
        )
        .await
            .map(|_| ())
    }
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(TransportError::NotFound);
    }
    if !status.is_success() {
        return Err(TransportError::Http {
            status: status.as_u16(),
        });
    }
    Ok(resp)
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, TransportError> {
    let body = resp
        .bytes()
        .await
        .map_err(|e| TransportError::Network(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| TransportError::BadResponse(e.to_string()))
}

/// Extract the `filename` parameter from a `Content-Disposition` header value.
fn filename_from_disposition(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        let (key, val) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let val = val.trim().trim_matches('"');
        (!val.is_empty()).then(|| val.to_string())
    })
}
