//! HTTP front end.
//!
//! Thin surface over the orchestrator: two token endpoints, a scan page, and
//! a health probe. Session semantics stay in the orchestrator; this module
//! only translates errors into status codes.

use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{Error, ServerError, SessionError};
use crate::orchestrator::Orchestrator;

/// Running HTTP server with graceful shutdown.
pub struct HttpServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HttpServer {
    /// Bind `addr` and start serving. Port 0 picks an ephemeral port;
    /// [`HttpServer::addr`] reports the one actually bound.
    pub async fn start(addr: SocketAddr, orchestrator: Orchestrator) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let addr = listener.local_addr().map_err(|e| ServerError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let router = Router::new()
            .route("/", get(health))
            .route("/pair", get(pair))
            .route("/qr", get(qr_page))
            .route("/qr/data", get(qr_data))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(orchestrator);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "http server terminated");
            }
        });

        tracing::info!(%addr, "http server listening");
        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and wait for in-flight requests to drain.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct NumberParams {
    number: Option<String>,
}

async fn health(State(orchestrator): State<Orchestrator>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": orchestrator.registry().len().await,
    }))
}

async fn pair(
    State(orchestrator): State<Orchestrator>,
    Query(params): Query<NumberParams>,
) -> Response {
    let Some(number) = params.number else {
        return invalid_number();
    };
    match orchestrator.pair_code(&number).await {
        Ok(code) => (StatusCode::OK, Json(json!({ "code": code }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn qr_data(
    State(orchestrator): State<Orchestrator>,
    Query(params): Query<NumberParams>,
) -> Response {
    let Some(number) = params.number else {
        return invalid_number();
    };
    match orchestrator.qr_data_url(&number).await {
        Ok(qr) => (StatusCode::OK, Json(json!({ "qr": qr }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn qr_page() -> Html<&'static str> {
    Html(QR_PAGE)
}

fn invalid_number() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "code": "Invalid number" })),
    )
        .into_response()
}

/// Map orchestrator failures onto the HTTP surface: bad input is the
/// caller's fault, socket construction failures mean the service cannot take
/// the request right now, and a token that never arrived is a timeout.
fn error_response(err: Error) -> Response {
    let (status, body) = match &err {
        Error::Phone(_) => {
            return invalid_number();
        }
        Error::Session(SessionError::SocketInit { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        Error::Session(SessionError::TokenTimeout { .. }) => {
            (StatusCode::GATEWAY_TIMEOUT, err.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    tracing::warn!(%status, error = %body, "request failed");
    (status, Json(json!({ "error": body }))).into_response()
}

const QR_PAGE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Link device</title>
<style>
  body { font-family: sans-serif; max-width: 28rem; margin: 3rem auto; }
  img { width: 256px; height: 256px; }
  #status { color: #666; }
</style>
</head>
<body>
<h1>Link device</h1>
<form id="form">
  <input id="number" type="tel" placeholder="947XXXXXXXX" required>
  <button type="submit">Show QR</button>
</form>
<p id="status"></p>
<img id="qr" hidden alt="scan to link">
<script>
document.getElementById('form').addEventListener('submit', async (e) => {
  e.preventDefault();
  const status = document.getElementById('status');
  const img = document.getElementById('qr');
  img.hidden = true;
  status.textContent = 'Requesting…';
  const number = encodeURIComponent(document.getElementById('number').value);
  try {
    const res = await fetch('/qr/data?number=' + number);
    const body = await res.json();
    if (!res.ok) {
      status.textContent = body.error || body.code || 'Request failed';
      return;
    }
    img.src = body.qr;
    img.hidden = false;
    status.textContent = 'Scan with the device to link.';
  } catch (err) {
    status.textContent = 'Request failed';
  }
});
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::archive::CredentialArchive;
    use crate::config::Config;
    use crate::error::ArchiveError;
    use crate::socket::DevSocketProvider;

    struct NullArchive;

    #[async_trait]
    impl CredentialArchive for NullArchive {
        async fn upload(
            &self,
            _local_path: &Path,
            remote_name: &str,
        ) -> Result<String, ArchiveError> {
            Ok(format!("https://example.com/file/{remote_name}#stub"))
        }
    }

    async fn start_test_server(root: &Path) -> HttpServer {
        let config = Config {
            grace_period: Duration::from_millis(10),
            token_wait: Duration::from_secs(2),
            session_root: root.to_path_buf(),
            ..Config::default()
        };
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(DevSocketProvider::new()),
            Arc::new(NullArchive),
        );
        HttpServer::start("127.0.0.1:0".parse().unwrap(), orchestrator)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_test_server(dir.path()).await;

        let body: serde_json::Value = reqwest::get(format!("http://{}/", server.addr()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn pair_returns_grouped_code() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_test_server(dir.path()).await;

        let res = reqwest::get(format!(
            "http://{}/pair?number=94712345678",
            server.addr()
        ))
        .await
        .unwrap();
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = res.json().await.unwrap();
        let code = body["code"].as_str().unwrap();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn pair_rejects_bad_number_with_expected_body() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_test_server(dir.path()).await;

        for query in ["number=abc", "number=123", ""] {
            let res = reqwest::get(format!("http://{}/pair?{query}", server.addr()))
                .await
                .unwrap();
            assert_eq!(res.status(), 400);
            let body: serde_json::Value = res.json().await.unwrap();
            assert_eq!(body["code"], "Invalid number");
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn qr_data_returns_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_test_server(dir.path()).await;

        let res = reqwest::get(format!(
            "http://{}/qr/data?number=94712345678",
            server.addr()
        ))
        .await
        .unwrap();
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = res.json().await.unwrap();
        assert!(
            body["qr"]
                .as_str()
                .unwrap()
                .starts_with("data:image/svg+xml;base64,")
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn qr_page_serves_html() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_test_server(dir.path()).await;

        let res = reqwest::get(format!("http://{}/qr", server.addr()))
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        assert!(res.text().await.unwrap().contains("/qr/data?number="));

        server.shutdown().await;
    }
}
