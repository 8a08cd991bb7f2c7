//! HTTP management endpoint.
//!
//! - `GET /config` returns the current mapping list as JSON.
//! - `PUT /config` / `POST /config` replace it (JSON, or YAML by content type).
//! - `DELETE /config` removes every mapping.
//! - `POST /shutdown` starts a graceful shutdown.
//! - `GET /status` lists forwarders with their state and live connections.

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::common::parse_listen_address;
use crate::config::{ConfigDocument, ConfigFormat, Mapping};
use crate::error::{Error, Result};
use crate::supervisor::{ApplyReport, ForwarderStatus, Supervisor};

/// Default admin listen address.
pub const DEFAULT_ADMIN_LISTEN: &str = "127.0.0.1:8080";

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Builds the management router.
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route(
            "/config",
            get(get_config)
                .put(replace_config)
                .post(replace_config)
                .delete(delete_config),
        )
        .route("/shutdown", post(shutdown))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(supervisor)
}

/// Binds the admin listener.
pub async fn bind(listen: &str) -> Result<TcpListener> {
    let addr: SocketAddr = parse_listen_address(listen)
        .map_err(|e| Error::Config(format!("invalid admin address: {}", e)))?;
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::ListenFailed {
            addr: listen.to_string(),
            source,
        })
}

/// Serves the management API until the supervisor's shutdown signal fires.
pub async fn serve(listener: TcpListener, supervisor: Arc<Supervisor>) -> Result<()> {
    let shutdown = supervisor.shutdown_token();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "admin endpoint listening");
    }

    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::debug!("admin endpoint stopped");
    Ok(())
}

async fn get_config(State(supervisor): State<Arc<Supervisor>>) -> Json<ConfigDocument> {
    Json(ConfigDocument {
        mappings: supervisor.mappings().to_vec(),
    })
}

async fn replace_config(
    State(supervisor): State<Arc<Supervisor>>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<String, ApiError> {
    let content = std::str::from_utf8(&body)
        .map_err(|_| Error::Config("request body is not valid UTF-8".to_string()))?;
    let doc = ConfigDocument::parse(content, body_format(&headers))?;

    let report = supervisor.replace(doc.mappings).await?;
    Ok(summary("Configuration updated successfully", &report))
}

async fn delete_config(
    State(supervisor): State<Arc<Supervisor>>,
) -> std::result::Result<String, ApiError> {
    let report = supervisor.replace(Vec::<Mapping>::new()).await?;
    Ok(summary("Configuration deleted successfully", &report))
}

async fn shutdown(State(supervisor): State<Arc<Supervisor>>) -> (StatusCode, &'static str) {
    supervisor.shutdown();
    (StatusCode::ACCEPTED, "Initiating graceful shutdown\n")
}

async fn status(State(supervisor): State<Arc<Supervisor>>) -> Json<Vec<ForwarderStatus>> {
    Json(supervisor.status().await)
}

/// Request bodies are JSON unless the client says YAML.
fn body_format(headers: &HeaderMap) -> ConfigFormat {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let is_yaml = ["application/yaml", "application/x-yaml", "text/yaml"]
        .iter()
        .any(|t| content_type.starts_with(t));

    if is_yaml {
        ConfigFormat::Yaml
    } else {
        ConfigFormat::Json
    }
}

fn summary(headline: &str, report: &ApplyReport) -> String {
    let mut out = format!(
        "{} ({} started, {} stopped, {} unchanged)\n",
        headline,
        report.started.len(),
        report.stopped.len(),
        report.kept.len()
    );
    for (mapping, reason) in &report.failed {
        out.push_str(&format!("failed to start {}: {}\n", mapping, reason));
    }
    out
}

/// Maps crate errors onto HTTP responses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            Error::Config(_) | Error::InvalidMapping(_) => StatusCode::BAD_REQUEST,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::ListenFailed { .. } | Error::Persist(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "admin request failed");
        } else {
            tracing::warn!(error = %self.0, "admin request rejected");
        }
        (status, format!("{}\n", self.0)).into_response()
    }
}
