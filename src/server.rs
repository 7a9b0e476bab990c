//! HTTP 入口：健康检查、配额查询与一次性提问。

use crate::error::AppError;
use crate::quota::TextGenerator;
use crate::relay::{FallbackBackend, QuotaReport, Relay, ReplySource};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub struct ServerState<G, F> {
    pub relay: Arc<Relay<G, F>>,
    /// 为空时不做鉴权。
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub reply: String,
    pub source: ReplySource,
    pub model: Option<String>,
}

pub fn router<G, F>(state: Arc<ServerState<G, F>>) -> Router
where
    G: TextGenerator + 'static,
    F: FallbackBackend + 'static,
{
    let api_routes = Router::new()
        .route("/v1/quota", get(handle_quota::<G, F>))
        .route("/v1/ask", post(handle_ask::<G, F>))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware::<G, F>,
        ))
        .with_state(state);

    Router::new()
        .route("/health", get(handle_health))
        .merge(api_routes)
}

pub async fn serve<G, F>(
    addr: &str,
    state: Arc<ServerState<G, F>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AppError>
where
    G: TextGenerator + 'static,
    F: FallbackBackend + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_quota<G, F>(State(state): State<Arc<ServerState<G, F>>>) -> Json<QuotaReport>
where
    G: TextGenerator + 'static,
    F: FallbackBackend + 'static,
{
    Json(state.relay.quota_report().await)
}

async fn handle_ask<G, F>(
    State(state): State<Arc<ServerState<G, F>>>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError>
where
    G: TextGenerator + 'static,
    F: FallbackBackend + 'static,
{
    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return Err(AppError::bad_request("prompt 不能为空"));
    }

    let request_id = format!("ask-{}", Uuid::new_v4().simple());
    let start = Instant::now();
    let reply = state.relay.answer(prompt).await.map_err(|e| {
        tracing::error!(%request_id, error = %e, "兜底后端调用失败");
        AppError::backend(e.to_string())
    })?;

    tracing::info!(
        %request_id,
        source = ?reply.source,
        model = reply.model.as_deref().unwrap_or("-"),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "已生成回复"
    );

    Ok(Json(AskResponse {
        reply: reply.text,
        source: reply.source,
        model: reply.model,
    }))
}

async fn api_key_middleware<G, F>(
    State(state): State<Arc<ServerState<G, F>>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError>
where
    G: TextGenerator + 'static,
    F: FallbackBackend + 'static,
{
    if state.api_key.is_empty() || request_key(request.headers()) == Some(state.api_key.as_str()) {
        return Ok(next.run(request).await);
    }
    Err(AppError::unauthorized("API Key 无效或缺失"))
}

/// 支持 `Authorization: Bearer <key>` 与 `x-api-key: <key>` 两种写法。
fn request_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())
        && let Some(token) = v.strip_prefix("Bearer ")
    {
        return Some(token.trim());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::dispatcher_tests::ScriptedGenerator;
    use crate::relay::tests::{FakeFallback, relay};
    use axum::http::HeaderValue;

    async fn spawn(relay: Relay<ScriptedGenerator, FakeFallback>, api_key: &str) -> String {
        let state = Arc::new(ServerState {
            relay: Arc::new(relay),
            api_key: api_key.to_string(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn health_and_quota() {
        let base = spawn(
            relay(
                &[("models/a", 3)],
                1,
                ScriptedGenerator::with(&[]),
                FakeFallback::ok("local"),
            ),
            "",
        )
        .await;

        let resp = client().get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");

        let v: serde_json::Value = client()
            .get(format!("{base}/v1/quota"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["totalRemaining"], 2);
        assert_eq!(v["nextModel"], "models/a");
        assert_eq!(v["models"][0]["used"], 0);
    }

    #[tokio::test]
    async fn ask_returns_reply_and_source() {
        let base = spawn(
            relay(
                &[("models/a", 3)],
                1,
                ScriptedGenerator::with(&[("models/a", Ok("primary"))]),
                FakeFallback::ok("local"),
            ),
            "",
        )
        .await;

        let v: serde_json::Value = client()
            .post(format!("{base}/v1/ask"))
            .json(&serde_json::json!({ "prompt": "hi" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["reply"], "primary");
        assert_eq!(v["source"], "primary");
        assert_eq!(v["model"], "models/a");
    }

    #[tokio::test]
    async fn ask_rejects_empty_prompt() {
        let base = spawn(
            relay(
                &[("models/a", 3)],
                1,
                ScriptedGenerator::with(&[]),
                FakeFallback::ok("local"),
            ),
            "",
        )
        .await;

        let resp = client()
            .post(format!("{base}/v1/ask"))
            .json(&serde_json::json!({ "prompt": "   " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn fallback_failure_maps_to_bad_gateway() {
        let base = spawn(
            relay(
                &[("models/a", 3)],
                1,
                ScriptedGenerator::with(&[("models/a", Err(500))]),
                FakeFallback::failing(),
            ),
            "",
        )
        .await;

        let resp = client()
            .post(format!("{base}/v1/ask"))
            .json(&serde_json::json!({ "prompt": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v["error"]["type"], "backend");
    }

    #[tokio::test]
    async fn api_key_guards_v1_routes_only() {
        let base = spawn(
            relay(
                &[("models/a", 3)],
                1,
                ScriptedGenerator::with(&[]),
                FakeFallback::ok("local"),
            ),
            "sekrit",
        )
        .await;

        let resp = client().get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client().get(format!("{base}/v1/quota")).send().await.unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client()
            .get(format!("{base}/v1/quota"))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client()
            .get(format!("{base}/v1/quota"))
            .header("x-api-key", "sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[test]
    fn request_key_prefers_bearer() {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        h.insert("x-api-key", HeaderValue::from_static("xyz"));
        assert_eq!(request_key(&h), Some("abc"));

        let mut h = HeaderMap::new();
        h.insert("x-api-key", HeaderValue::from_static(" xyz "));
        assert_eq!(request_key(&h), Some("xyz"));

        assert_eq!(request_key(&HeaderMap::new()), None);
    }
}
