//! HTTP bridge to the chat platform.
//!
//! The platform side exposes a small JSON API:
//!
//! | Method | Path | Body / Response |
//! |--------|------|-----------------|
//! | `GET`  | `/sources/{source}/latest` | `{"position": u64}` |
//! | `GET`  | `/sources/{source}/items?after=&until=` | `[SourceItem]` |
//! | `POST` | `/messages` | `{"chat": "...", "text": "..."}` |
//!
//! Requests carry `Authorization: Bearer <token>` when a token is
//! configured. Any transport error or non-2xx response from the source
//! endpoints becomes `SourceUnavailable`, which the manager retries.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use filedex_core::{Error, FileSource, Operation, Result, SourceItem};

use crate::config::PlatformConfig;
use crate::progress::Notifier;

fn client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

fn base_url(platform: &PlatformConfig) -> anyhow::Result<String> {
    match platform.base_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(url.trim_end_matches('/').to_string()),
        _ => bail!("platform.base_url is not configured"),
    }
}

#[derive(Deserialize)]
struct LatestResponse {
    position: u64,
}

/// [`FileSource`] served by the platform bridge.
pub struct HttpFileSource {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpFileSource {
    pub fn new(platform: &PlatformConfig, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base: base_url(platform)?,
            token: platform.token.clone(),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, u64)],
    ) -> Result<T> {
        let mut req = self.client.get(url).query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::source_unavailable(format!("GET {}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::source_unavailable(format!(
                "GET {}: {} {}",
                url, status, body
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| Error::source_unavailable(format!("GET {}: bad body: {}", url, e)))
    }
}

#[async_trait]
impl FileSource for HttpFileSource {
    async fn latest_position(&self, source: &str) -> Result<u64> {
        let url = format!("{}/sources/{}/latest", self.base, source);
        let latest: LatestResponse = self.get_json(&url, &[]).await?;
        Ok(latest.position)
    }

    async fn fetch_window(&self, source: &str, after: u64, until: u64) -> Result<Vec<SourceItem>> {
        let url = format!("{}/sources/{}/items", self.base, source);
        let mut items: Vec<SourceItem> = self
            .get_json(&url, &[("after", after), ("until", until)])
            .await?;
        items.retain(|i| i.position > after && i.position <= until);
        items.sort_by_key(|i| i.position);
        Ok(items)
    }
}

#[derive(Serialize)]
struct MessageBody<'a> {
    chat: &'a str,
    text: &'a str,
}

/// Posts progress messages to one chat.
pub struct HttpNotifier {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
    chat: String,
}

impl HttpNotifier {
    pub fn new(platform: &PlatformConfig, chat: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base: base_url(platform)?,
            token: platform.token.clone(),
            chat: chat.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, _op: &Operation, text: &str) -> anyhow::Result<()> {
        let url = format!("{}/messages", self.base);
        let mut req = self.client.post(&url).json(&MessageBody {
            chat: &self.chat,
            text,
        });
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.with_context(|| format!("POST {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("POST {} failed: {} {}", url, status, body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Fake {
        messages: Arc<Mutex<Vec<(String, String)>>>,
    }

    fn item(position: u64) -> SourceItem {
        SourceItem {
            position,
            file_id: format!("f{}", position),
            unique_id: format!("u{}", position),
            file_name: format!("track{}.flac", position),
            file_size: 42,
            mime_type: Some("audio/flac".into()),
            caption: None,
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "Bearer sekrit")
            .unwrap_or(false)
    }

    async fn latest(headers: HeaderMap, Path(source): Path<String>) -> HandlerResult<Json<serde_json::Value>> {
        if !authorized(&headers) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        if source == "broken" {
            return Err(StatusCode::BAD_GATEWAY);
        }
        Ok(Json(serde_json::json!({ "position": 9 })))
    }

    async fn items(
        Path(_source): Path<String>,
        Query(q): Query<HashMap<String, u64>>,
    ) -> Json<Vec<SourceItem>> {
        let after = q.get("after").copied().unwrap_or(0);
        let until = q.get("until").copied().unwrap_or(0);
        // Unordered, plus one item past the window.
        let mut out: Vec<SourceItem> = (after + 1..=until).rev().map(item).collect();
        out.push(item(until + 1));
        Json(out)
    }

    async fn message(State(fake): State<Fake>, Json(body): Json<serde_json::Value>) -> StatusCode {
        let chat = body["chat"].as_str().unwrap_or_default().to_string();
        let text = body["text"].as_str().unwrap_or_default().to_string();
        fake.messages.lock().unwrap().push((chat, text));
        StatusCode::NO_CONTENT
    }

    type HandlerResult<T> = std::result::Result<T, StatusCode>;

    async fn serve_fake() -> (String, Fake) {
        let fake = Fake::default();
        let app = Router::new()
            .route("/sources/{source}/latest", get(latest))
            .route("/sources/{source}/items", get(items))
            .route("/messages", post(message))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), fake)
    }

    fn platform(base: &str, token: Option<&str>) -> PlatformConfig {
        PlatformConfig {
            base_url: Some(format!("{}/", base)),
            token: token.map(str::to_string),
            progress_chat: Some("-100777".into()),
        }
    }

    #[tokio::test]
    async fn source_reads_latest_and_windows() {
        let (base, _) = serve_fake().await;
        let src = HttpFileSource::new(&platform(&base, Some("sekrit")), Duration::from_secs(5)).unwrap();

        assert_eq!(src.latest_position("chan").await.unwrap(), 9);
        let positions: Vec<u64> = src
            .fetch_window("chan", 3, 6)
            .await
            .unwrap()
            .iter()
            .map(|i| i.position)
            .collect();
        assert_eq!(positions, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn http_errors_are_source_unavailable() {
        let (base, _) = serve_fake().await;
        let src = HttpFileSource::new(&platform(&base, Some("sekrit")), Duration::from_secs(5)).unwrap();
        let err = src.latest_position("broken").await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable(_)));
        assert!(err.is_transient());

        let anon = HttpFileSource::new(&platform(&base, None), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            anon.latest_position("chan").await,
            Err(Error::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn notifier_posts_to_chat() {
        let (base, fake) = serve_fake().await;
        let cfg = platform(&base, None);
        let notifier = HttpNotifier::new(&cfg, "-100777", Duration::from_secs(5)).unwrap();
        notifier
            .notify(&Operation::new("chan"), "Indexing chan: 50%")
            .await
            .unwrap();

        let sent = fake.messages.lock().unwrap().clone();
        assert_eq!(sent, vec![("-100777".to_string(), "Indexing chan: 50%".to_string())]);
    }

    #[test]
    fn missing_base_url_is_rejected() {
        let cfg = PlatformConfig::default();
        assert!(HttpFileSource::new(&cfg, Duration::from_secs(1)).is_err());
    }
}
