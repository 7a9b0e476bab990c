//! 每日用量台账：进程内计数，按自然日惰性清零。

use crate::quota::types::{ModelSpec, ModelStatus};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;

/// “今天”的来源，仅用于检测跨日。
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// 本地时区的系统时钟。
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

pub struct UsageLedger {
    models: Arc<[ModelSpec]>,
    safety_margin: u32,
    clock: Arc<dyn Clock>,
    current_day: NaiveDate,
    usage: HashMap<String, u32>,
}

impl UsageLedger {
    pub fn new(models: Arc<[ModelSpec]>, safety_margin: u32, clock: Arc<dyn Clock>) -> Self {
        let current_day = clock.today();
        let usage = zeroed(&models);
        Self {
            models,
            safety_margin,
            clock,
            current_day,
            usage,
        }
    }

    pub fn current_day(&self) -> NaiveDate {
        self.current_day
    }

    /// 日期变化时清零所有计数。同一天内重复调用无副作用。
    ///
    /// 返回本次是否发生了清零。
    pub fn reset_if_new_day(&mut self) -> bool {
        let today = self.clock.today();
        if today == self.current_day {
            return false;
        }
        self.current_day = today;
        self.usage = zeroed(&self.models);
        tracing::info!(day = %today, "每日配额已重置");
        true
    }

    /// `used < limit - margin`；未知模型视为不可用。
    pub fn is_eligible(&mut self, model: &str) -> bool {
        self.reset_if_new_day();
        match self.limit_of(model) {
            Some(limit) => self.used(model) < limit.saturating_sub(self.safety_margin),
            None => false,
        }
    }

    /// 扣除安全余量后的剩余可用次数。
    pub fn remaining_for(&mut self, model: &str) -> u32 {
        self.reset_if_new_day();
        self.margined_remaining(model)
    }

    /// 记录一次成功调用。不做上限检查：调用方应先检查 `is_eligible`。
    pub fn record_use(&mut self, model: &str) {
        self.reset_if_new_day();
        match self.usage.get_mut(model) {
            Some(used) => *used = used.saturating_add(1),
            None => tracing::warn!(model, "记录用量时遇到未配置的模型，已忽略"),
        }
    }

    /// 按偏好顺序返回每个模型的用量快照。
    pub fn snapshot(&mut self) -> Vec<ModelStatus> {
        self.reset_if_new_day();
        self.models
            .iter()
            .map(|m| {
                let used = self.used(&m.name);
                ModelStatus {
                    name: m.name.clone(),
                    used,
                    limit: m.daily_limit,
                    remaining: m.daily_limit.saturating_sub(used),
                }
            })
            .collect()
    }

    pub fn total_remaining(&mut self) -> u32 {
        self.reset_if_new_day();
        self.models
            .iter()
            .map(|m| self.margined_remaining(&m.name))
            .sum()
    }

    fn used(&self, model: &str) -> u32 {
        self.usage.get(model).copied().unwrap_or(0)
    }

    fn limit_of(&self, model: &str) -> Option<u32> {
        self.models
            .iter()
            .find(|m| m.name == model)
            .map(|m| m.daily_limit)
    }

    fn margined_remaining(&self, model: &str) -> u32 {
        let Some(limit) = self.limit_of(model) else {
            return 0;
        };
        limit
            .saturating_sub(self.safety_margin)
            .saturating_sub(self.used(model))
    }
}

fn zeroed(models: &[ModelSpec]) -> HashMap<String, u32> {
    models.iter().map(|m| (m.name.clone(), 0)).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 可手动拨动的时钟。
    pub(crate) struct ManualClock {
        day: Mutex<NaiveDate>,
    }

    impl ManualClock {
        pub(crate) fn new(day: NaiveDate) -> Arc<Self> {
            Arc::new(Self {
                day: Mutex::new(day),
            })
        }

        pub(crate) fn set(&self, day: NaiveDate) {
            *self.day.lock().unwrap() = day;
        }
    }

    impl Clock for ManualClock {
        fn today(&self) -> NaiveDate {
            *self.day.lock().unwrap()
        }
    }

    pub(crate) fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn models(specs: &[(&str, u32)]) -> Arc<[ModelSpec]> {
        specs.iter().map(|(n, l)| ModelSpec::new(*n, *l)).collect()
    }

    fn ledger(specs: &[(&str, u32)], margin: u32) -> (UsageLedger, Arc<ManualClock>) {
        let clock = ManualClock::new(day(1));
        (UsageLedger::new(models(specs), margin, clock.clone()), clock)
    }

    #[test]
    fn eligibility_follows_margined_limit() {
        let (mut l, _) = ledger(&[("a", 3)], 1);
        assert!(l.is_eligible("a"));
        l.record_use("a");
        assert!(l.is_eligible("a"));
        l.record_use("a");
        // used=2 >= 3-1
        assert!(!l.is_eligible("a"));
        assert_eq!(l.remaining_for("a"), 0);
    }

    #[test]
    fn margin_not_smaller_than_limit_starts_ineligible() {
        let (mut l, _) = ledger(&[("a", 1), ("b", 1)], 1);
        assert!(!l.is_eligible("a"));
        assert!(!l.is_eligible("b"));
        assert_eq!(l.total_remaining(), 0);

        let (mut l, _) = ledger(&[("a", 1)], 5);
        assert!(!l.is_eligible("a"));
        assert_eq!(l.remaining_for("a"), 0);
    }

    #[test]
    fn unknown_model_is_never_eligible() {
        let (mut l, _) = ledger(&[("a", 3)], 0);
        assert!(!l.is_eligible("nope"));
        assert_eq!(l.remaining_for("nope"), 0);
        l.record_use("nope");
        assert_eq!(l.total_remaining(), 3);
    }

    #[test]
    fn record_use_has_no_bound_check() {
        let (mut l, _) = ledger(&[("a", 2)], 1);
        for _ in 0..4 {
            l.record_use("a");
        }
        let snap = l.snapshot();
        assert_eq!(snap[0].used, 4);
        assert_eq!(snap[0].remaining, 0);
        assert_eq!(l.remaining_for("a"), 0);
    }

    #[test]
    fn snapshot_uses_hard_limit_and_keeps_order() {
        let (mut l, _) = ledger(&[("b", 5), ("a", 2)], 1);
        l.record_use("a");
        let snap = l.snapshot();
        assert_eq!(
            snap,
            vec![
                ModelStatus {
                    name: "b".to_string(),
                    used: 0,
                    limit: 5,
                    remaining: 5
                },
                ModelStatus {
                    name: "a".to_string(),
                    used: 1,
                    limit: 2,
                    remaining: 1
                },
            ]
        );
        // 扣安全余量后 a 已无剩余。
        assert_eq!(l.remaining_for("a"), 0);
    }

    #[test]
    fn total_remaining_is_sum_and_non_increasing() {
        let (mut l, _) = ledger(&[("a", 4), ("b", 3)], 1);
        let mut prev = l.total_remaining();
        assert_eq!(prev, 3 + 2);
        for m in ["a", "b", "a", "b", "a", "b", "a"] {
            l.record_use(m);
            let now = l.total_remaining();
            assert_eq!(now, l.remaining_for("a") + l.remaining_for("b"));
            assert!(now <= prev);
            prev = now;
        }
        assert_eq!(prev, 0);
    }

    #[test]
    fn reset_is_idempotent_within_a_day() {
        let (mut l, _) = ledger(&[("a", 4)], 0);
        l.record_use("a");
        assert!(!l.reset_if_new_day());
        assert!(!l.reset_if_new_day());
        assert_eq!(l.snapshot()[0].used, 1);
    }

    #[test]
    fn day_rollover_resets_before_the_operation() {
        let (mut l, clock) = ledger(&[("a", 3), ("b", 2)], 1);
        l.record_use("a");
        l.record_use("a");
        l.record_use("b");
        assert!(!l.is_eligible("a"));
        assert_eq!(l.total_remaining(), 0);

        clock.set(day(2));
        assert!(l.is_eligible("a"));
        assert_eq!(l.current_day(), day(2));
        assert_eq!(l.total_remaining(), 2 + 1);

        // 第二天里记账，然后再跨一天。
        l.record_use("b");
        clock.set(day(3));
        l.record_use("b");
        assert_eq!(l.snapshot()[1].used, 1);
    }
}
