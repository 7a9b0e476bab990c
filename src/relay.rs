//! 调用方一侧的兜底：主后端全部用尽或失败时改走兜底后端。

use crate::ollama::FallbackError;
use crate::quota::{Dispatcher, TextGenerator};
use serde::Serialize;
use std::future::Future;

/// 无配额限制的兜底生成服务。
pub trait FallbackBackend: Send + Sync {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String, FallbackError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    /// 主后端某个模型成功应答。
    Primary,
    /// 主后端今日已无配额，直接使用兜底后端。
    FallbackQuota,
    /// 主后端有模型可用但调用全部失败。
    FallbackError,
}

impl ReplySource {
    pub fn is_fallback(self) -> bool {
        !matches!(self, Self::Primary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
    /// 仅主后端应答时有值。
    pub model: Option<String>,
}

pub use crate::quota::QuotaReport;

pub struct Relay<G, F> {
    dispatcher: Dispatcher<G>,
    fallback: F,
}

impl<G: TextGenerator, F: FallbackBackend> Relay<G, F> {
    pub fn new(dispatcher: Dispatcher<G>, fallback: F) -> Self {
        Self {
            dispatcher,
            fallback,
        }
    }

    pub async fn has_any_quota(&self) -> bool {
        self.dispatcher.has_any_quota().await
    }

    pub async fn quota_report(&self) -> QuotaReport {
        self.dispatcher.quota_report().await
    }

    /// 主后端优先，失败或用尽时改用兜底后端；只有兜底也失败时才返回错误。
    pub async fn answer(&self, prompt: &str) -> Result<Reply, FallbackError> {
        if !self.dispatcher.has_any_quota().await {
            tracing::warn!("主后端今日配额已用完，改用兜底后端");
            return self.fallback_reply(prompt, ReplySource::FallbackQuota).await;
        }

        match self.dispatcher.dispatch(prompt).await {
            Ok(generated) => Ok(Reply {
                text: generated.text,
                source: ReplySource::Primary,
                model: Some(generated.model),
            }),
            Err(e) => {
                tracing::warn!(error = %e, attempts = ?e.attempts, "主后端不可用，改用兜底后端");
                let source = if e.quota_only() {
                    ReplySource::FallbackQuota
                } else {
                    ReplySource::FallbackError
                };
                self.fallback_reply(prompt, source).await
            }
        }
    }

    async fn fallback_reply(&self, prompt: &str, source: ReplySource) -> Result<Reply, FallbackError> {
        let text = self.fallback.generate(prompt).await?;
        Ok(Reply {
            text,
            source,
            model: None,
        })
    }
}
