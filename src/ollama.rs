//! 本地 Ollama 后端：无配额限制的兜底生成服务。

use crate::config::Config;
use crate::logging;
use crate::relay::FallbackBackend;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("Ollama 返回 HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    log_level: logging::LogLevel,
}

impl OllamaClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_millis(cfg.ollama_timeout_ms));
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }
        Ok(Self::with_client(
            builder.build()?,
            &cfg.ollama_url,
            &cfg.ollama_model,
            cfg.log_level(),
        ))
    }

    fn with_client(
        http: reqwest::Client,
        base_url: &str,
        model: &str,
        log_level: logging::LogLevel,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            log_level,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn complete(&self, prompt: &str) -> Result<String, FallbackError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = sonic_rs::to_vec(&GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.log_level.backend_enabled() {
            if self.log_level.raw_enabled() {
                logging::backend_request_raw("POST", &url, &headers, &body);
            } else {
                logging::backend_request("POST", &url, &headers, &body);
            }
        }

        let start = Instant::now();
        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if self.log_level.backend_enabled() {
            if self.log_level.raw_enabled() {
                logging::backend_response_raw(status.as_u16(), start.elapsed(), &bytes);
            } else {
                logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
            }
        }
        if !status.is_success() {
            return Err(FallbackError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).chars().take(512).collect(),
            });
        }

        let parsed = sonic_rs::from_slice::<GenerateResponse>(&bytes)?;
        Ok(parsed.response.trim().to_string())
    }
}

impl FallbackBackend for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String, FallbackError> {
        self.complete(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/")
    }

    fn client(base: &str) -> OllamaClient {
        OllamaClient::with_client(
            reqwest::Client::builder().no_proxy().build().unwrap(),
            base,
            "qwen3-vl:4b",
            logging::LogLevel::Off,
        )
    }

    #[tokio::test]
    async fn generate_posts_non_streaming_request_and_trims() {
        let app = Router::new().route(
            "/api/generate",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["model"], "qwen3-vl:4b");
                assert_eq!(body["prompt"], "hello");
                assert_eq!(body["stream"], false);
                Json(serde_json::json!({"model": "qwen3-vl:4b", "response": "  hi!\n", "done": true}))
            }),
        );
        let base = spawn_server(app).await;

        let reply = client(&base).complete("hello").await.unwrap();
        assert_eq!(reply, "hi!");
    }

    #[tokio::test]
    async fn non_2xx_is_an_error() {
        let app = Router::new().route(
            "/api/generate",
            post(|| async { (StatusCode::NOT_FOUND, "model 'x' not found") }),
        );
        let base = spawn_server(app).await;

        let err = client(&base).complete("hello").await.unwrap_err();
        match err {
            FallbackError::Http { status, body } => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
