//! Pass-through HTTP proxy in front of the parsing backend.
//!
//! Everything under `/api/` is forwarded 1:1 to the backend so a browser front end
//! can talk to it same-origin. Optionally serves a built single-page app for every
//! other path.

use crate::engine::RemoteClient;
use crate::model::ControllerConfig;
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use reqwest::Url;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ProxyState {
    http: reqwest::Client,
    upstream: Url,
}

impl ProxyState {
    pub fn new(http: reqwest::Client, upstream: Url) -> Self {
        Self { http, upstream }
    }

    /// Backend URL for a request path below `/api`.
    fn target(&self, uri: &Uri) -> Url {
        let rest = uri.path().strip_prefix("/api").unwrap_or(uri.path());
        let mut url = self.upstream.clone();
        let path = format!("{}{}", url.path().trim_end_matches('/'), rest);
        url.set_path(&path);
        url.set_query(uri.query());
        url
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to reach backend")]
    Unreachable(#[source] reqwest::Error),

    #[error("failed to build response: {0}")]
    Response(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (error, details) = match &self {
            ProxyError::Unreachable(e) => {
                tracing::error!(error = %e, "backend unreachable");
                ("Failed to reach backend", e.to_string())
            }
            ProxyError::Response(detail) => {
                tracing::error!(error = %detail, "proxy response failed");
                ("Failed to relay backend response", detail.clone())
            }
        };
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": error, "details": details })),
        )
            .into_response()
    }
}

/// Build the proxy app: `/api/*` forwarding, SPA fallback, request tracing.
pub fn router(state: ProxyState, static_dir: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/api/{*rest}", any(forward))
        .with_state(state);
    let app = match static_dir {
        Some(dir) => app.fallback_service(
            ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html"))),
        ),
        None => app,
    };
    app.layer(TraceLayer::new_for_http())
}

async fn forward(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let url = state.target(&uri);
    tracing::debug!(%method, %url, "forwarding");

    let mut req = state.http.request(method, url);
    if let Some(ct) = headers.get(CONTENT_TYPE) {
        req = req.header(CONTENT_TYPE, ct.clone());
    }
    if !body.is_empty() {
        req = req.body(body);
    }
    let upstream = req.send().await.map_err(ProxyError::Unreachable)?;

    let mut builder = Response::builder().status(upstream.status());
    if let Some(ct) = upstream.headers().get(CONTENT_TYPE) {
        builder = builder.header(CONTENT_TYPE, ct.clone());
    }
    match upstream.headers().get(CONTENT_DISPOSITION) {
        Some(cd) => builder = builder.header(CONTENT_DISPOSITION, cd.clone()),
        None => {
            if let Some(value) = attachment_for(uri.path()) {
                builder = builder.header(CONTENT_DISPOSITION, value);
            }
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::Response(e.to_string()))
}

/// Downloads are always offered as attachments, named after the requested file.
fn attachment_for(path: &str) -> Option<HeaderValue> {
    let name = path.strip_prefix("/api/download/")?;
    if name.is_empty() || name.contains('"') {
        return None;
    }
    HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")).ok()
}

/// Run the proxy until Ctrl-C.
pub async fn serve(cfg: &ControllerConfig, listen: SocketAddr, static_dir: Option<PathBuf>) -> Result<()> {
    let client = RemoteClient::new(cfg)?;
    let state = ProxyState::new(client.http.clone(), client.base_url().clone());
    let app = router(state, static_dir.as_deref());

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    tracing::info!(%listen, upstream = %client.base_url(), "proxy listening");
    eprintln!("Proxy listening on http://{listen} -> {}", client.base_url());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("proxy server failed")?;
    Ok(())
}
