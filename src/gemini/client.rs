use crate::config::Config;
use crate::gemini::types::{GenerationConfig, Request, Response};
use crate::logging;
use crate::quota::{GenerationSettings, TextGenerator};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use sonic_rs::JsonValueTrait;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Gemini API 错误 {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_delay: Duration,
    },

    #[error("Gemini 返回了空回复")]
    EmptyResponse,

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_delay, .. } if *retry_delay != Duration::ZERO => Some(*retry_delay),
            _ => None,
        }
    }

    /// 429：后端配额/限流耗尽。
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    log_level: logging::LogLevel,
}

impl GeminiClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        // 单次调用的硬超时（配置层保证大于 0）。
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_millis(cfg.timeout_ms));
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self::with_client(
            builder.build()?,
            &cfg.gemini_base_url,
            &cfg.gemini_api_key,
            cfg.log_level(),
        ))
    }

    fn with_client(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        log_level: logging::LogLevel,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            log_level,
        }
    }

    pub fn generate_url(&self, model: &str) -> String {
        let model = model.trim();
        if model.starts_with("models/") || model.starts_with("tunedModels/") {
            format!("{}/v1beta/{model}:generateContent", self.base_url)
        } else {
            format!("{}/v1beta/models/{model}:generateContent", self.base_url)
        }
    }

    fn build_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("gemini-relay/", env!("CARGO_PKG_VERSION"))),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(&self.api_key) {
            h.insert(HeaderName::from_static("x-goog-api-key"), v);
        }
        h
    }

    /// 单次、非流式、不重试的生成调用。
    pub async fn generate_content(&self, model: &str, req: &Request) -> Result<Response, ProviderError> {
        let url = self.generate_url(model);
        let body = sonic_rs::to_vec(req)?;
        let headers = self.build_headers();
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
            .post(url)
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
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        Ok(sonic_rs::from_slice::<Response>(&bytes)?)
    }
}

impl TextGenerator for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        settings: GenerationSettings,
    ) -> Result<String, ProviderError> {
        let req = Request::user_prompt(
            prompt,
            GenerationConfig {
                temperature: Some(settings.temperature),
                max_output_tokens: Some(settings.max_output_tokens),
            },
        );
        let resp = self.generate_content(model, &req).await?;
        let text = resp.text();
        if text.trim().is_empty() {
            tracing::warn!(model, finish_reason = resp.finish_reason(), "Gemini 回复不含文本");
            return Err(ProviderError::EmptyResponse);
        }
        tracing::debug!(
            model,
            model_version = %resp.model_version,
            total_tokens = ?resp.usage_metadata.as_ref().map(|u| u.total_token_count),
            "Gemini 回复完成"
        );
        Ok(text)
    }
}

/// 解析 Google 风格的错误包 `{"error":{code,message,status,details}}`。
fn extract_error_details(status: u16, body: &[u8]) -> ProviderError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        details: Vec<ErrDetail>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ErrDetail {
        #[serde(rename = "@type", default)]
        ty: String,
        #[serde(default)]
        retry_delay: String,
    }

    let mut out_status = status;
    let mut message = "Unknown error".to_string();
    let mut retry_delay = Duration::ZERO;

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(body) {
        let err = err_resp.error;
        if !err.message.is_empty() {
            message = err.message;
        }

        if let Some(code) = err.code {
            if let Some(s) = code.as_str() {
                match s.to_uppercase().as_str() {
                    "RESOURCE_EXHAUSTED" => out_status = 429,
                    "INTERNAL" => out_status = 500,
                    "UNAUTHENTICATED" => out_status = 401,
                    _ => {}
                }
            } else if let Some(i) = code.as_i64()
                && i > 0
                && i <= u16::MAX as i64
            {
                out_status = i as u16;
            }
        }

        for d in err.details {
            if d.ty.contains("RetryInfo")
                && let Some(delay) = parse_retry_delay_seconds(&d.retry_delay)
            {
                retry_delay = delay;
            }
        }
    } else if !body.is_empty() {
        message = String::from_utf8_lossy(body).chars().take(512).collect();
    }

    ProviderError::Http {
        status: out_status,
        message,
        retry_delay,
    }
}

fn parse_retry_delay_seconds(s: &str) -> Option<Duration> {
    // 形如 "2s" / "2.5s" / "0.123s"
    let s = s.trim().strip_suffix('s')?;
    let secs: f64 = s.trim().parse().ok()?;
    if !(secs.is_finite() && secs >= 0.0) {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}
