use super::{Hook, HookError, HookResponse, Result};
use async_trait::async_trait;
use knit_core::hooks::WebHookUrls;
use knit_core::RunDetail;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::marker::PhantomData;
use tracing::debug;

/// Outbound webhook. Each URL receives the run detail as a JSON POST, in
/// order; the first non-2xx answer fails the hook.
pub struct WebHook<R> {
    client: Client,
    before: Vec<Url>,
    after: Vec<Url>,
    _response: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for WebHook<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebHook")
            .field("before", &self.before)
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

impl<R: HookResponse> WebHook<R> {
    pub fn new(client: Client, urls: &WebHookUrls) -> Result<Self> {
        Ok(Self {
            client,
            before: parse_urls(&urls.before)?,
            after: parse_urls(&urls.after)?,
            _response: PhantomData,
        })
    }

    /// POST `detail` to `url`. Returns the decoded body when the endpoint
    /// answered with JSON.
    async fn post(&self, url: &Url, detail: &RunDetail) -> Result<Option<R>> {
        let response = self
            .client
            .post(url.clone())
            .json(detail)
            .send()
            .await
            .map_err(|source| HookError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        debug!(url = %url, status = status.as_u16(), content_type = %content_type, "webhook answered");

        if !status.is_success() {
            let body = if is_textual(&content_type) {
                response.text().await.ok()
            } else {
                None
            };
            return Err(HookError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
                content_type,
                body,
            });
        }

        if mime_essence(&content_type) != "application/json" {
            return Ok(None);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| HookError::Request {
                url: url.to_string(),
                source,
            })?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| HookError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

#[async_trait]
impl<R: HookResponse> Hook<R> for WebHook<R> {
    async fn before(&self, detail: &RunDetail) -> Result<R> {
        let mut merged = R::default();
        for url in &self.before {
            if let Some(response) = self.post(url, detail).await? {
                merged = merged.merge(response);
            }
        }
        Ok(merged)
    }

    async fn after(&self, detail: &RunDetail) -> Result<()> {
        for url in &self.after {
            self.post(url, detail).await?;
        }
        Ok(())
    }
}

fn parse_urls(urls: &[String]) -> Result<Vec<Url>> {
    urls.iter()
        .map(|raw| {
            let url = Url::parse(raw).map_err(|e| HookError::InvalidUrl {
                url: raw.clone(),
                reason: e.to_string(),
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(HookError::InvalidUrl {
                    url: raw.clone(),
                    reason: format!("unsupported scheme {}", url.scheme()),
                });
            }
            Ok(url)
        })
        .collect()
}

fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Bodies worth quoting in an error: `text/*` and JSON flavoured types.
fn is_textual(content_type: &str) -> bool {
    let essence = mime_essence(content_type);
    essence.starts_with("text/")
        || (essence.starts_with("application/") && essence.contains("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{EmptyResponse, StartingHookResponse};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use knit_core::{PlanSummary, RunStatus};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<String>>>;

    fn recorder(name: &'static str, calls: &Calls) -> impl Fn() + Clone + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move || calls.lock().unwrap().push(name.to_string())
    }

    /// Endpoints `a` and `c` answer JSON, `b` refuses with plain text and
    /// `done` answers without a body.
    async fn serve() -> (SocketAddr, Calls) {
        let calls: Calls = Arc::default();
        let (a, b, c, done) = (
            recorder("a", &calls),
            recorder("b", &calls),
            recorder("c", &calls),
            recorder("done", &calls),
        );
        let app = Router::new()
            .route(
                "/a",
                post(move || async move {
                    a();
                    Json(json!({"knitfabExtension": {"env": {"A": "x", "K": "1"}}}))
                }),
            )
            .route(
                "/b",
                post(move || async move {
                    b();
                    (StatusCode::BAD_GATEWAY, "nope")
                }),
            )
            .route(
                "/c",
                post(move || async move {
                    c();
                    Json::<Value>(json!({"knitfabExtension": {"env": {"K": "2"}}}))
                }),
            )
            .route(
                "/done",
                post(move || async move {
                    done();
                    StatusCode::NO_CONTENT
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, calls)
    }

    fn urls(addr: SocketAddr, before: &[&str], after: &[&str]) -> WebHookUrls {
        let to_url = |path: &&str| format!("http://{addr}/{path}");
        WebHookUrls {
            before: before.iter().map(to_url).collect(),
            after: after.iter().map(to_url).collect(),
        }
    }

    fn detail() -> RunDetail {
        RunDetail {
            run_id: "run-1".to_string(),
            status: RunStatus::Ready,
            updated_at: chrono::Utc::now(),
            exit: None,
            plan: PlanSummary {
                plan_id: "plan-train".to_string(),
                image: Some("repo/train:1.0".to_string()),
                name: None,
            },
            inputs: vec![],
            outputs: vec![],
            log: None,
        }
    }

    #[tokio::test]
    async fn first_refusal_stops_the_chain() {
        let (addr, calls) = serve().await;
        let hook =
            WebHook::<StartingHookResponse>::new(Client::new(), &urls(addr, &["a", "b", "c"], &[]))
                .unwrap();

        let err = hook.before(&detail()).await.unwrap_err();
        match &err {
            HookError::Rejected {
                url,
                status,
                content_type,
                body,
            } => {
                assert_eq!(url, &format!("http://{addr}/b"));
                assert_eq!(*status, 502);
                assert!(content_type.starts_with("text/plain"));
                assert_eq!(body.as_deref(), Some("nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let message = err.to_string();
        assert!(message.starts_with(&format!(
            "hook failed: (http://{addr}/b 502, Content-Type: text/plain"
        )));
        assert!(message.ends_with(") nope"));
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn every_endpoint_is_called_in_order_and_responses_merge() {
        let (addr, calls) = serve().await;
        let hook = WebHook::<StartingHookResponse>::new(
            Client::new(),
            &urls(addr, &["a", "c"], &["done", "a"]),
        )
        .unwrap();

        let response = hook.before(&detail()).await.unwrap();
        let env: Vec<(&str, &str)> = response
            .env()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(env, vec![("A", "x"), ("K", "2")]);

        hook.after(&detail()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["a", "c", "done", "a"]);
    }

    #[tokio::test]
    async fn empty_response_accepts_any_json_object() {
        let (addr, calls) = serve().await;
        let hook = WebHook::<EmptyResponse>::new(Client::new(), &urls(addr, &["a", "done"], &[]))
            .unwrap();
        assert_eq!(hook.before(&detail()).await.unwrap(), EmptyResponse {});
        assert_eq!(*calls.lock().unwrap(), vec!["a", "done"]);
    }

    #[test]
    fn textual_content_types() {
        assert!(is_textual("text/plain; charset=utf-8"));
        assert!(is_textual("application/json"));
        assert!(is_textual("application/problem+json"));
        assert!(!is_textual("application/octet-stream"));
        assert!(!is_textual(""));
    }

    #[test]
    fn mime_essence_drops_parameters() {
        assert_eq!(mime_essence("Application/JSON; charset=utf-8"), "application/json");
    }

    #[test]
    fn rejects_non_http_urls() {
        let urls = WebHookUrls {
            before: vec!["ftp://hooks.example/x".to_string()],
            after: vec![],
        };
        let err = WebHook::<EmptyResponse>::new(Client::new(), &urls).unwrap_err();
        assert!(matches!(err, HookError::InvalidUrl { .. }));

        let urls = WebHookUrls {
            before: vec![],
            after: vec!["not a url".to_string()],
        };
        assert!(WebHook::<EmptyResponse>::new(Client::new(), &urls).is_err());
    }
}
