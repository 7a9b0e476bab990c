//! 选择算法：按固定偏好顺序取第一个仍有配额的模型。
//!
//! 顺序是静态优先级，不根据延迟或错误率动态调整。

use crate::quota::ledger::UsageLedger;
use crate::quota::types::ModelSpec;

pub fn next_eligible<'a>(models: &'a [ModelSpec], ledger: &mut UsageLedger) -> Option<&'a ModelSpec> {
    models.iter().find(|m| ledger.is_eligible(&m.name))
}

pub fn has_any_quota(models: &[ModelSpec], ledger: &mut UsageLedger) -> bool {
    next_eligible(models, ledger).is_some()
}
