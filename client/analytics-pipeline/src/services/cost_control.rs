//! Cost-control admission gate
//!
//! Every event passes through [`CostController::should_allow`] before it is
//! enriched. The gate combines multi-window hard limits with adaptive
//! sampling that tightens as the daily, monthly or budget windows fill up.
//! Events whose priority reaches `critical_priority` bypass the hard limits;
//! events at or above `high_priority` are never sampled out.

use crate::config::CostControlConfig;
use crate::services::consent::{ConsentCategory, ConsentStore};
use crate::storage::StorageBackends;
use crate::storage_keys;
use chrono::{DateTime, Duration, Utc};
use client_storage::LayeredStore;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Utilization at which sampling starts to tighten
const SAMPLING_RAMP_START: f64 = 0.5;

/// Counters persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetrics {
    pub events_this_minute: u64,
    pub events_this_session: u64,
    pub events_today: u64,
    pub events_this_month: u64,
    /// Estimated spend for the current month
    pub estimated_cost: f64,
    pub events_dropped: u64,
    pub current_sampling_rate: f64,
    pub minute_window_start: DateTime<Utc>,
    pub day_key: String,
    pub month_key: String,
    pub session_id: Option<String>,
}

impl Default for UsageMetrics {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl UsageMetrics {
    fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            events_this_minute: 0,
            events_this_session: 0,
            events_today: 0,
            events_this_month: 0,
            estimated_cost: 0.0,
            events_dropped: 0,
            current_sampling_rate: 1.0,
            minute_window_start: now,
            day_key: day_key(now),
            month_key: month_key(now),
            session_id: None,
        }
    }
}

fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Allowed,
    CostControlDisabled,
    ConsentDenied,
    RateLimited,
    SessionLimit,
    DailyLimit,
    MonthlyLimit,
    BudgetExceeded,
    SampledOut,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Allowed => "allowed",
            DecisionReason::CostControlDisabled => "cost_control_disabled",
            DecisionReason::ConsentDenied => "consent_denied",
            DecisionReason::RateLimited => "rate_limited",
            DecisionReason::SessionLimit => "session_limit",
            DecisionReason::DailyLimit => "daily_limit",
            DecisionReason::MonthlyLimit => "monthly_limit",
            DecisionReason::BudgetExceeded => "budget_exceeded",
            DecisionReason::SampledOut => "sampled_out",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub sampling_rate: f64,
    pub priority: u8,
}

type Sampler = Box<dyn Fn() -> f64 + Send + Sync>;

pub struct CostController {
    config: CostControlConfig,
    consent: Arc<ConsentStore>,
    durable: Arc<LayeredStore>,
    usage: Mutex<UsageMetrics>,
    sampler: Sampler,
}

impl CostController {
    pub fn new(
        config: CostControlConfig,
        consent: Arc<ConsentStore>,
        storage: &StorageBackends,
    ) -> Self {
        let usage = storage
            .durable
            .get_json::<UsageMetrics>(storage_keys::USAGE_METRICS)
            .unwrap_or_default();

        Self {
            config,
            consent,
            durable: storage.durable.clone(),
            usage: Mutex::new(usage),
            sampler: Box::new(|| rand::thread_rng().gen::<f64>()),
        }
    }

    /// Replace the uniform `[0, 1)` draw used for sampling
    pub fn with_sampler<F>(mut self, sampler: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.sampler = Box::new(sampler);
        self
    }

    pub fn should_allow(&self, event_type: &str) -> AdmissionDecision {
        self.should_allow_at(event_type, Utc::now())
    }

    pub fn should_allow_at(&self, event_type: &str, now: DateTime<Utc>) -> AdmissionDecision {
        let priority = self.config.priority_of(event_type);

        if !self.consent.can_track(ConsentCategory::Analytics) {
            return AdmissionDecision {
                allowed: false,
                reason: DecisionReason::ConsentDenied,
                sampling_rate: 0.0,
                priority,
            };
        }

        if !self.config.enabled {
            return AdmissionDecision {
                allowed: true,
                reason: DecisionReason::CostControlDisabled,
                sampling_rate: 1.0,
                priority,
            };
        }

        let mut usage = self.usage.lock();
        self.roll_windows(&mut usage, now);

        let sampling_rate = self.sampling_rate(&usage);
        usage.current_sampling_rate = sampling_rate;

        let decision = |allowed, reason| AdmissionDecision {
            allowed,
            reason,
            sampling_rate,
            priority,
        };

        if priority < self.config.critical_priority {
            if let Some(reason) = self.hard_limit(&usage) {
                usage.events_dropped += 1;
                self.persist(&usage);
                debug!(event_type, reason = %reason, priority, "Event dropped by hard limit");
                return decision(false, reason);
            }
        }

        if priority < self.config.high_priority {
            let draw = (self.sampler)();
            if draw >= sampling_rate {
                usage.events_dropped += 1;
                self.persist(&usage);
                debug!(event_type, sampling_rate, "Event sampled out");
                return decision(false, DecisionReason::SampledOut);
            }
        }

        decision(true, DecisionReason::Allowed)
    }

    /// Count an admitted event against every window
    pub fn record_sent(&self) {
        self.record_sent_at(Utc::now())
    }

    pub fn record_sent_at(&self, now: DateTime<Utc>) {
        let mut usage = self.usage.lock();
        self.roll_windows(&mut usage, now);

        usage.events_this_minute += 1;
        usage.events_this_session += 1;
        usage.events_today += 1;
        usage.events_this_month += 1;
        usage.estimated_cost += self.config.cost_per_event;

        self.persist(&usage);
    }

    /// Reset the session counter when the session id changes
    pub fn observe_session(&self, session_id: &str) {
        let mut usage = self.usage.lock();
        if usage.session_id.as_deref() != Some(session_id) {
            if usage.session_id.is_some() {
                debug!(session_id, "New session, resetting session counter");
            }
            usage.session_id = Some(session_id.to_string());
            usage.events_this_session = 0;
            self.persist(&usage);
        }
    }

    pub fn metrics(&self) -> UsageMetrics {
        self.usage.lock().clone()
    }

    /// Forget the session after consent withdrawal.
    ///
    /// Minute, day and month windows keep counting so that a withdraw and
    /// re-grant cannot reopen the budget early. Nothing is persisted here;
    /// the stored snapshot was removed with the other non-essential keys.
    pub fn forget_session(&self) {
        let mut usage = self.usage.lock();
        usage.session_id = None;
        usage.events_this_session = 0;
    }

    fn roll_windows(&self, usage: &mut UsageMetrics, now: DateTime<Utc>) {
        if now - usage.minute_window_start > Duration::seconds(60) {
            usage.events_this_minute = 0;
            usage.minute_window_start = now;
        }

        let today = day_key(now);
        if usage.day_key != today {
            usage.events_today = 0;
            usage.day_key = today;
        }

        let month = month_key(now);
        if usage.month_key != month {
            usage.events_this_month = 0;
            usage.estimated_cost = 0.0;
            usage.month_key = month;
        }
    }

    fn utilization(&self, usage: &UsageMetrics) -> f64 {
        let ratio = |used: f64, limit: f64| if limit > 0.0 { used / limit } else { 0.0 };

        [
            ratio(usage.events_today as f64, self.config.events_per_day as f64),
            ratio(usage.events_this_month as f64, self.config.events_per_month as f64),
            ratio(usage.estimated_cost, self.config.monthly_budget),
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }

    fn sampling_rate(&self, usage: &UsageMetrics) -> f64 {
        let base = self.config.base_sampling_rate;
        let aggressive = self.config.aggressive_sampling_rate;
        let threshold = self.config.aggressive_threshold;
        let utilization = self.utilization(usage);

        let rate = if utilization < SAMPLING_RAMP_START {
            base
        } else if utilization >= threshold {
            aggressive
        } else {
            let progress = (utilization - SAMPLING_RAMP_START) / (threshold - SAMPLING_RAMP_START);
            base - (base - aggressive) * progress
        };

        rate.clamp(0.0, 1.0)
    }

    fn hard_limit(&self, usage: &UsageMetrics) -> Option<DecisionReason> {
        let config = &self.config;
        if usage.events_this_minute >= config.events_per_minute {
            Some(DecisionReason::RateLimited)
        } else if usage.events_this_session >= config.events_per_session {
            Some(DecisionReason::SessionLimit)
        } else if usage.events_today >= config.events_per_day {
            Some(DecisionReason::DailyLimit)
        } else if usage.events_this_month >= config.events_per_month {
            Some(DecisionReason::MonthlyLimit)
        } else if config.monthly_budget > 0.0 && usage.estimated_cost >= config.monthly_budget {
            Some(DecisionReason::BudgetExceeded)
        } else {
            None
        }
    }

    fn persist(&self, usage: &UsageMetrics) {
        self.durable.set_json(storage_keys::USAGE_METRICS, usage);
    }
}

impl std::fmt::Debug for CostController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostController")
            .field("config", &self.config)
            .field("usage", &*self.usage.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 31, 23, 59, 0).unwrap()
    }

    fn controller(config: CostControlConfig) -> CostController {
        let storage = StorageBackends::in_memory();
        let consent = Arc::new(ConsentStore::new(&storage));
        consent.accept_all();
        CostController::new(config, consent, &storage).with_sampler(|| 0.0)
    }

    fn send(gate: &CostController, event_type: &str, now: DateTime<Utc>) -> AdmissionDecision {
        let decision = gate.should_allow_at(event_type, now);
        if decision.allowed {
            gate.record_sent_at(now);
        }
        decision
    }

    #[test]
    fn test_sixth_event_in_a_minute_is_rate_limited() {
        let gate = controller(CostControlConfig {
            events_per_minute: 5,
            ..Default::default()
        });

        for _ in 0..5 {
            assert!(send(&gate, "click", t0()).allowed);
        }
        let sixth = send(&gate, "click", t0());

        assert!(!sixth.allowed);
        assert_eq!(sixth.reason, DecisionReason::RateLimited);
        assert_eq!(gate.metrics().events_dropped, 1);
    }

    #[test]
    fn test_conversion_bypasses_rate_limit() {
        let gate = controller(CostControlConfig {
            events_per_minute: 5,
            ..Default::default()
        });

        for _ in 0..5 {
            send(&gate, "click", t0());
        }
        let conversion = send(&gate, "conversion", t0());

        assert!(conversion.allowed);
        assert_eq!(conversion.priority, 10);
    }

    #[test]
    fn test_minute_window_rolls_over() {
        let gate = controller(CostControlConfig {
            events_per_minute: 1,
            ..Default::default()
        });

        assert!(send(&gate, "click", t0()).allowed);
        assert!(!send(&gate, "click", t0() + Duration::seconds(30)).allowed);
        assert!(send(&gate, "click", t0() + Duration::seconds(61)).allowed);
    }

    #[test]
    fn test_day_and_month_keys_reset_counters() {
        let gate = controller(CostControlConfig {
            events_per_day: 2,
            ..Default::default()
        });

        send(&gate, "click", t0());
        send(&gate, "click", t0());
        let blocked = gate.should_allow_at("click", t0() + Duration::seconds(30));
        assert_eq!(blocked.reason, DecisionReason::DailyLimit);

        // t0 is the last minute of May
        let next_day = t0() + Duration::minutes(2);
        assert!(send(&gate, "click", next_day).allowed);
        let metrics = gate.metrics();
        assert_eq!(metrics.events_today, 1);
        assert_eq!(metrics.events_this_month, 1);
        assert_eq!(metrics.month_key, "2024-06");
    }

    #[test]
    fn test_session_limit_resets_on_new_session() {
        let gate = controller(CostControlConfig {
            events_per_session: 1,
            ..Default::default()
        });
        gate.observe_session("s1");

        assert!(send(&gate, "click", t0()).allowed);
        assert_eq!(
            gate.should_allow_at("click", t0()).reason,
            DecisionReason::SessionLimit
        );

        gate.observe_session("s2");
        assert!(gate.should_allow_at("click", t0()).allowed);
    }

    #[test]
    fn test_budget_limit() {
        let gate = controller(CostControlConfig {
            monthly_budget: 0.0003,
            cost_per_event: 0.0001,
            ..Default::default()
        });

        for _ in 0..3 {
            send(&gate, "page_view", t0() + Duration::seconds(5));
        }

        let decision = gate.should_allow_at("page_view", t0() + Duration::seconds(10));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::BudgetExceeded);
    }

    #[test]
    fn test_sampling_rate_interpolates() {
        let config = CostControlConfig {
            events_per_day: 100,
            base_sampling_rate: 1.0,
            aggressive_sampling_rate: 0.2,
            aggressive_threshold: 0.9,
            ..Default::default()
        };
        let gate = controller(config);
        let mut usage = UsageMetrics::starting_at(t0());

        usage.events_today = 10;
        assert_eq!(gate.sampling_rate(&usage), 1.0);

        usage.events_today = 70; // halfway between 0.5 and 0.9
        assert!((gate.sampling_rate(&usage) - 0.6).abs() < 1e-9);

        usage.events_today = 90;
        assert_eq!(gate.sampling_rate(&usage), 0.2);
    }

    #[test]
    fn test_sampling_only_hits_low_priority_events() {
        let storage = StorageBackends::in_memory();
        let consent = Arc::new(ConsentStore::new(&storage));
        consent.accept_all();
        let config = CostControlConfig {
            base_sampling_rate: 0.0,
            ..Default::default()
        };
        let gate = CostController::new(config, consent, &storage).with_sampler(|| 0.5);

        let click = gate.should_allow_at("click", t0());
        assert_eq!(click.reason, DecisionReason::SampledOut);

        // page_view sits exactly at the high-priority threshold
        assert!(gate.should_allow_at("page_view", t0()).allowed);
    }

    #[test]
    fn test_consent_and_disabled_short_circuit() {
        let storage = StorageBackends::in_memory();
        let consent = Arc::new(ConsentStore::new(&storage));
        let config = CostControlConfig {
            enabled: false,
            ..Default::default()
        };
        let gate = CostController::new(config, consent.clone(), &storage);

        assert_eq!(
            gate.should_allow_at("click", t0()).reason,
            DecisionReason::ConsentDenied
        );

        consent.accept_all();
        let decision = gate.should_allow_at("click", t0());
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::CostControlDisabled);
    }

    #[test]
    fn test_usage_survives_restart() {
        let storage = StorageBackends::in_memory();
        let consent = Arc::new(ConsentStore::new(&storage));
        consent.accept_all();

        let gate = CostController::new(CostControlConfig::default(), consent.clone(), &storage);
        gate.record_sent();
        gate.record_sent();

        let restarted = CostController::new(CostControlConfig::default(), consent, &storage);
        assert_eq!(restarted.metrics().events_this_month, 2);
    }

    #[test]
    fn test_forget_session_keeps_budget_windows() {
        let storage = StorageBackends::in_memory();
        let consent = Arc::new(ConsentStore::new(&storage));
        consent.accept_all();
        let gate = CostController::new(CostControlConfig::default(), consent, &storage);

        gate.observe_session("s1");
        gate.record_sent_at(t0());
        gate.record_sent_at(t0());
        gate.forget_session();

        let usage = gate.metrics();
        assert_eq!(usage.session_id, None);
        assert_eq!(usage.events_this_session, 0);
        assert_eq!(usage.events_today, 2);
        assert_eq!(usage.events_this_month, 2);
        assert!(usage.estimated_cost > 0.0);
    }
}
