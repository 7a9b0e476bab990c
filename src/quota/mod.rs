//! 配额感知的多模型调度。
//!
//! - ledger：每个模型的每日用量计数，按日期惰性清零
//! - selector：按固定偏好顺序挑选下一个仍有配额的模型
//! - dispatcher：逐个尝试模型，成功即扣费返回，全部失败时给出统一的用尽信号

mod dispatcher;
mod ledger;
mod selector;
mod types;

pub use dispatcher::{AllModelsExhausted, Dispatcher, TextGenerator};
pub use ledger::{Clock, LocalClock};
pub use types::{GenerationSettings, ModelSpec, ModelStatus, QuotaReport, short_model_name};

#[cfg(test)]
pub(crate) use dispatcher::tests as dispatcher_tests;
#[cfg(test)]
pub(crate) use ledger::tests as ledger_tests;
