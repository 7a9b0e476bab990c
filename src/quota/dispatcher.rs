//! 按偏好顺序逐个尝试模型，单次请求最多成功扣费一个模型。
//!
//! 每个模型每次请求只尝试一次：配额不足则跳过，调用失败则记录后换下一个。
//! 全部走完仍未成功时返回统一的 [`AllModelsExhausted`]。

use crate::gemini::ProviderError;
use crate::quota::ledger::{Clock, UsageLedger};
use crate::quota::selector;
use crate::quota::types::{GenerationSettings, ModelSpec, QuotaReport};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// 主后端的单次生成调用。
pub trait TextGenerator: Send + Sync {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        settings: GenerationSettings,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;
}

/// 单个模型在一次请求中的结果（仅用于诊断）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    QuotaSkipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub model: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Error)]
#[error("今日所有模型均已用尽或调用失败（尝试 {} 个）", .attempts.len())]
pub struct AllModelsExhausted {
    pub attempts: Vec<Attempt>,
    /// 最后一次调用错误；全部因配额跳过时为 None。
    #[source]
    pub last_error: Option<ProviderError>,
}

impl AllModelsExhausted {
    /// 是否所有模型都只是因为配额被跳过（没有任何真实调用）。
    pub fn quota_only(&self) -> bool {
        self.last_error.is_none()
    }
}

/// 一次成功生成：应答的模型与去除首尾空白后的文本。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub model: String,
    pub text: String,
}

enum Step {
    Success(String),
    Skipped,
    Failed(ProviderError),
}

pub struct Dispatcher<G> {
    models: Arc<[ModelSpec]>,
    ledger: Mutex<UsageLedger>,
    generator: G,
    settings: GenerationSettings,
}

impl<G: TextGenerator> Dispatcher<G> {
    pub fn new(
        models: Vec<ModelSpec>,
        safety_margin: u32,
        clock: Arc<dyn Clock>,
        generator: G,
        settings: GenerationSettings,
    ) -> Self {
        let models: Arc<[ModelSpec]> = models.into();
        let ledger = UsageLedger::new(models.clone(), safety_margin, clock);
        Self {
            models,
            ledger: Mutex::new(ledger),
            generator,
            settings,
        }
    }

    #[cfg(test)]
    pub(crate) fn generator(&self) -> &G {
        &self.generator
    }

    pub async fn generate(&self, prompt: &str) -> Result<String, AllModelsExhausted> {
        self.dispatch(prompt).await.map(|g| g.text)
    }

    pub async fn dispatch(&self, prompt: &str) -> Result<Generated, AllModelsExhausted> {
        self.ledger.lock().await.reset_if_new_day();

        let mut attempts = Vec::with_capacity(self.models.len());
        let mut last_error = None;

        for model in self.models.iter() {
            match self.attempt(model, prompt).await {
                Step::Success(text) => {
                    return Ok(Generated {
                        model: model.name.clone(),
                        text,
                    });
                }
                Step::Skipped => {
                    tracing::warn!(model = %model.name, "模型今日配额已用尽，跳过");
                    attempts.push(Attempt {
                        model: model.name.clone(),
                        outcome: AttemptOutcome::QuotaSkipped,
                    });
                }
                Step::Failed(err) => {
                    if err.is_rate_limited() {
                        tracing::warn!(
                            model = %model.name,
                            retry_after = ?err.retry_delay(),
                            "模型被后端限流，尝试下一个"
                        );
                    } else {
                        tracing::warn!(model = %model.name, error = %err, "模型调用失败，尝试下一个");
                    }
                    attempts.push(Attempt {
                        model: model.name.clone(),
                        outcome: AttemptOutcome::Failed(err.to_string()),
                    });
                    last_error = Some(err);
                }
            }
        }

        Err(AllModelsExhausted {
            attempts,
            last_error,
        })
    }

    async fn attempt(&self, model: &ModelSpec, prompt: &str) -> Step {
        // 检查与扣费是两个独立的临界区，中间是网络调用。
        let eligible = self.ledger.lock().await.is_eligible(&model.name);
        if !eligible {
            return Step::Skipped;
        }

        tracing::info!(model = %model.name, "使用模型");
        match self
            .generator
            .generate(&model.name, prompt, self.settings)
            .await
        {
            Ok(text) => {
                self.ledger.lock().await.record_use(&model.name);
                Step::Success(text.trim().to_string())
            }
            Err(err) => Step::Failed(err),
        }
    }

    /// 在一次加锁内生成状态，三项数据互相一致。
    pub async fn quota_report(&self) -> QuotaReport {
        let mut ledger = self.ledger.lock().await;
        let models = ledger.snapshot();
        let total_remaining = ledger.total_remaining();
        let next_model =
            selector::next_eligible(&self.models, &mut ledger).map(|m| m.name.clone());
        QuotaReport {
            day: ledger.current_day(),
            models,
            total_remaining,
            next_model,
        }
    }

    pub async fn has_any_quota(&self) -> bool {
        let mut ledger = self.ledger.lock().await;
        selector::has_any_quota(&self.models, &mut ledger)
    }
}
