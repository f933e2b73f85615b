//! Liveness HTTP server.
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | `GET`  | `/healthz` | `200 ok` |
//!
//! The server stops when the shutdown token is cancelled.

use anyhow::Context;
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(handle_healthz))
        .layer(TraceLayer::new_for_http())
}

/// Bind `bind` and serve until `shutdown` is cancelled.
pub async fn run_server(bind: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind liveness server to {}", bind))?;
    serve(listener, shutdown).await
}

pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "liveness server listening");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("liveness server failed")?;

    info!("liveness server stopped");
    Ok(())
}

async fn handle_healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_answers_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, token.clone()));

        let resp = reqwest::get(format!("http://{}/healthz", addr)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");

        let missing = reqwest::get(format!("http://{}/nope", addr)).await.unwrap();
        assert_eq!(missing.status(), 404);

        token.cancel();
        server.await.unwrap().unwrap();
    }
}
