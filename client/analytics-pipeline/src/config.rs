/// Configuration management for the analytics pipeline
///
/// Loads configuration from environment variables, falling back to defaults
/// for anything unset or unparseable.
use crate::error::{PipelineError, PipelineResult};
use crate::services::attribution::AttributionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Application settings stamped on every event
    pub app: AppConfig,
    /// Anonymous id / session lifecycle
    pub identity: IdentityConfig,
    /// Campaign attribution policy
    pub attribution: AttributionConfig,
    /// Admission gate limits and sampling
    pub cost_control: CostControlConfig,
    /// Batch export settings
    pub export: ExportConfig,
    /// Persistence settings
    pub storage: StorageConfig,
    /// Bound on calls queued before initialization
    pub max_queued_calls: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            identity: IdentityConfig::default(),
            attribution: AttributionConfig::default(),
            cost_control: CostControlConfig::default(),
            export: ExportConfig::default(),
            storage: StorageConfig::default(),
            max_queued_calls: 100,
        }
    }
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Deployment environment (development, staging, production)
    pub environment: String,
    pub app_version: String,
    /// Batch `source` field
    pub source: String,
    /// Fallback locale when the client context does not provide one
    pub default_locale: String,
    pub default_timezone: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            source: "web".to_string(),
            default_locale: "en-US".to_string(),
            default_timezone: "UTC".to_string(),
        }
    }
}

/// Identity lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub anonymous_id_expiry_days: i64,
    /// Inactivity after which a new session starts
    pub session_timeout_minutes: i64,
    /// Also rotate the session at the UTC day boundary
    pub reset_session_daily: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            anonymous_id_expiry_days: 365,
            session_timeout_minutes: 30,
            reset_session_daily: false,
        }
    }
}

impl IdentityConfig {
    pub fn anonymous_id_expiry(&self) -> chrono::Duration {
        chrono::Duration::days(self.anonymous_id_expiry_days)
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_timeout_minutes)
    }
}

/// Attribution configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    pub policy: AttributionPolicy,
}

/// Admission gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostControlConfig {
    /// When false every consented event is admitted
    pub enabled: bool,
    pub events_per_minute: u64,
    pub events_per_session: u64,
    pub events_per_day: u64,
    pub events_per_month: u64,
    /// Monthly spend ceiling in the billing currency
    pub monthly_budget: f64,
    /// Estimated cost of one admitted event
    pub cost_per_event: f64,
    /// Sampling rate while utilization is below 50%
    pub base_sampling_rate: f64,
    /// Sampling rate once utilization reaches `aggressive_threshold`
    pub aggressive_sampling_rate: f64,
    pub aggressive_threshold: f64,
    /// Events at or above this priority bypass hard limits
    pub critical_priority: u8,
    /// Events at or above this priority are never sampled
    pub high_priority: u8,
    pub default_priority: u8,
    /// Priority per event type
    pub priorities: HashMap<String, u8>,
}

impl Default for CostControlConfig {
    fn default() -> Self {
        let priorities = [
            ("conversion", 10),
            ("purchase", 10),
            ("error", 9),
            ("sign_up", 9),
            ("form_submit", 6),
            ("page_view", 5),
            ("click", 3),
            ("scroll", 1),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            enabled: true,
            events_per_minute: 60,
            events_per_session: 500,
            events_per_day: 5_000,
            events_per_month: 100_000,
            monthly_budget: 50.0,
            cost_per_event: 0.0001,
            base_sampling_rate: 1.0,
            aggressive_sampling_rate: 0.1,
            aggressive_threshold: 0.8,
            critical_priority: 8,
            high_priority: 5,
            default_priority: 3,
            priorities,
        }
    }
}

impl CostControlConfig {
    pub fn priority_of(&self, event_type: &str) -> u8 {
        self.priorities
            .get(event_type)
            .copied()
            .unwrap_or(self.default_priority)
    }
}

/// Export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub enabled: bool,
    /// Collection endpoint (`POST` JSON batches)
    pub endpoint: Option<String>,
    /// Buffer size that triggers an automatic flush
    pub batch_size: usize,
    /// Total delivery attempts per flush
    pub max_retries: u32,
    /// Delay after the first failure; doubles per attempt
    pub retry_base_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// Prefer the fire-and-forget beacon transport
    pub use_beacon: bool,
    /// Payloads above this size skip the beacon
    pub beacon_max_bytes: usize,
    /// Failed batches retained for replay
    pub max_failed_batches: usize,
    /// Replay stored failures after a successful flush
    pub replay_failed_on_success: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            batch_size: 10,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            request_timeout_ms: 5000,
            use_beacon: true,
            beacon_max_bytes: 64 * 1024,
            max_failed_batches: 10,
            replay_failed_on_success: true,
        }
    }
}

impl ExportConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the durable store; memory only when unset
    pub data_dir: Option<PathBuf>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl PipelineConfig {
    /// Load configuration from `ANALYTICS_*` environment variables
    pub fn from_env() -> PipelineResult<Self> {
        let defaults = PipelineConfig::default();

        let app = AppConfig {
            environment: env_or("ANALYTICS_ENV", defaults.app.environment),
            app_version: env_or("ANALYTICS_APP_VERSION", defaults.app.app_version),
            source: env_or("ANALYTICS_SOURCE", defaults.app.source),
            default_locale: env_or("ANALYTICS_LOCALE", defaults.app.default_locale),
            default_timezone: env_or("ANALYTICS_TIMEZONE", defaults.app.default_timezone),
        };

        let identity = IdentityConfig {
            anonymous_id_expiry_days: env_or(
                "ANALYTICS_ANONYMOUS_ID_EXPIRY_DAYS",
                defaults.identity.anonymous_id_expiry_days,
            ),
            session_timeout_minutes: env_or(
                "ANALYTICS_SESSION_TIMEOUT_MINUTES",
                defaults.identity.session_timeout_minutes,
            ),
            reset_session_daily: env_flag(
                "ANALYTICS_RESET_SESSION_DAILY",
                defaults.identity.reset_session_daily,
            ),
        };

        let attribution = AttributionConfig {
            policy: match std::env::var("ANALYTICS_ATTRIBUTION_POLICY") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|e: String| PipelineError::Config(e))?,
                Err(_) => defaults.attribution.policy,
            },
        };

        let cc = defaults.cost_control;
        let cost_control = CostControlConfig {
            enabled: env_flag("ANALYTICS_COST_CONTROL_ENABLED", cc.enabled),
            events_per_minute: env_or("ANALYTICS_EVENTS_PER_MINUTE", cc.events_per_minute),
            events_per_session: env_or("ANALYTICS_EVENTS_PER_SESSION", cc.events_per_session),
            events_per_day: env_or("ANALYTICS_EVENTS_PER_DAY", cc.events_per_day),
            events_per_month: env_or("ANALYTICS_EVENTS_PER_MONTH", cc.events_per_month),
            monthly_budget: env_or("ANALYTICS_MONTHLY_BUDGET", cc.monthly_budget),
            cost_per_event: env_or("ANALYTICS_COST_PER_EVENT", cc.cost_per_event),
            base_sampling_rate: env_or("ANALYTICS_BASE_SAMPLING_RATE", cc.base_sampling_rate),
            aggressive_sampling_rate: env_or(
                "ANALYTICS_AGGRESSIVE_SAMPLING_RATE",
                cc.aggressive_sampling_rate,
            ),
            aggressive_threshold: env_or("ANALYTICS_AGGRESSIVE_THRESHOLD", cc.aggressive_threshold),
            critical_priority: env_or("ANALYTICS_CRITICAL_PRIORITY", cc.critical_priority),
            high_priority: env_or("ANALYTICS_HIGH_PRIORITY", cc.high_priority),
            default_priority: env_or("ANALYTICS_DEFAULT_PRIORITY", cc.default_priority),
            priorities: cc.priorities,
        };

        let ex = defaults.export;
        let endpoint = std::env::var("ANALYTICS_EXPORT_ENDPOINT")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let export = ExportConfig {
            enabled: env_flag("ANALYTICS_EXPORT_ENABLED", endpoint.is_some()),
            batch_size: env_or("ANALYTICS_EXPORT_BATCH_SIZE", ex.batch_size),
            max_retries: env_or("ANALYTICS_EXPORT_MAX_RETRIES", ex.max_retries),
            retry_base_delay_ms: env_or("ANALYTICS_EXPORT_RETRY_BASE_MS", ex.retry_base_delay_ms),
            request_timeout_ms: env_or("ANALYTICS_EXPORT_TIMEOUT_MS", ex.request_timeout_ms),
            use_beacon: env_flag("ANALYTICS_EXPORT_USE_BEACON", ex.use_beacon),
            beacon_max_bytes: env_or("ANALYTICS_BEACON_MAX_BYTES", ex.beacon_max_bytes),
            max_failed_batches: env_or("ANALYTICS_MAX_FAILED_BATCHES", ex.max_failed_batches),
            replay_failed_on_success: env_flag(
                "ANALYTICS_REPLAY_FAILED_ON_SUCCESS",
                ex.replay_failed_on_success,
            ),
            endpoint,
        };

        let storage = StorageConfig {
            data_dir: std::env::var("ANALYTICS_DATA_DIR").ok().map(PathBuf::from),
        };

        let config = PipelineConfig {
            app,
            identity,
            attribution,
            cost_control,
            export,
            storage,
            max_queued_calls: env_or("ANALYTICS_MAX_QUEUED_CALLS", defaults.max_queued_calls),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory settings
    pub fn validate(&self) -> PipelineResult<()> {
        let cc = &self.cost_control;
        for (name, rate) in [
            ("base_sampling_rate", cc.base_sampling_rate),
            ("aggressive_sampling_rate", cc.aggressive_sampling_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(PipelineError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, rate
                )));
            }
        }
        if !(cc.aggressive_threshold > 0.0 && cc.aggressive_threshold <= 1.0) {
            return Err(PipelineError::Config(format!(
                "aggressive_threshold must be within (0, 1], got {}",
                cc.aggressive_threshold
            )));
        }
        if cc.monthly_budget < 0.0 || cc.cost_per_event < 0.0 {
            return Err(PipelineError::Config(
                "budget and cost_per_event must be non-negative".to_string(),
            ));
        }
        if self.export.batch_size == 0 {
            return Err(PipelineError::Config("export batch_size must be > 0".to_string()));
        }
        if self.export.max_retries == 0 {
            return Err(PipelineError::Config("export max_retries must be > 0".to_string()));
        }
        if self.export.enabled && self.export.endpoint.is_none() {
            return Err(PipelineError::Config(
                "export is enabled but no endpoint is configured".to_string(),
            ));
        }
        if self.identity.session_timeout_minutes <= 0 || self.identity.anonymous_id_expiry_days <= 0 {
            return Err(PipelineError::Config(
                "identity timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("ANALYTICS_") {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_queued_calls, 100);
        assert_eq!(config.cost_control.priority_of("conversion"), 10);
        assert_eq!(config.cost_control.priority_of("unknown_thing"), 3);
        assert_eq!(config.identity.session_timeout(), chrono::Duration::minutes(30));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("ANALYTICS_EVENTS_PER_MINUTE", "5");
        std::env::set_var("ANALYTICS_EXPORT_ENDPOINT", "https://collect.example.com/v1/batch");
        std::env::set_var("ANALYTICS_ATTRIBUTION_POLICY", "last-touch");
        std::env::set_var("ANALYTICS_RESET_SESSION_DAILY", "true");

        let config = PipelineConfig::from_env().unwrap();

        assert_eq!(config.cost_control.events_per_minute, 5);
        assert!(config.export.enabled);
        assert_eq!(config.attribution.policy, AttributionPolicy::LastTouch);
        assert!(config.identity.reset_session_daily);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_garbage_numbers() {
        clear_env();
        std::env::set_var("ANALYTICS_EXPORT_BATCH_SIZE", "lots");

        let config = PipelineConfig::from_env().unwrap();

        assert_eq!(config.export.batch_size, 10);
        assert!(!config.export.enabled);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unknown_policy() {
        clear_env();
        std::env::set_var("ANALYTICS_ATTRIBUTION_POLICY", "linear");

        assert!(matches!(
            PipelineConfig::from_env(),
            Err(PipelineError::Config(_))
        ));
        clear_env();
    }

    #[test]
    fn test_validate_rejects_bad_rates() {
        let mut config = PipelineConfig::default();
        config.cost_control.base_sampling_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.export.enabled = true;
        assert!(config.validate().is_err());
    }
}
