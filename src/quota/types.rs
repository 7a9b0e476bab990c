use chrono::NaiveDate;
use serde::Serialize;

/// 一个可调用的模型及其每日调用上限。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// 模型唯一标识（例如 `models/gemini-2.5-flash`）。
    pub name: String,
    /// 每日调用上限（> 0）。
    pub daily_limit: u32,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, daily_limit: u32) -> Self {
        Self {
            name: name.into(),
            daily_limit,
        }
    }

    /// 去掉 `models/` 之类前缀后的短名，用于展示。
    pub fn short_name(&self) -> &str {
        short_model_name(&self.name)
    }
}

pub fn short_model_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// 单个模型的配额快照（展示用：remaining 基于硬上限，不扣安全余量）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

/// 同一时刻的配额状态：各模型用量、扣除安全余量后的总剩余、下一个可用模型。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub day: NaiveDate,
    pub models: Vec<ModelStatus>,
    pub total_remaining: u32,
    pub next_model: Option<String>,
}

/// 固定的生成参数（不由请求方提供）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            max_output_tokens: 2048,
        }
    }
}
