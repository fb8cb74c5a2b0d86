use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    consolidation::ConsolidationConfig,
    error::ConfigError,
    gateway::{content_filter::FilterPolicy, router::RoutingTable},
};

pub const DEFAULT_FAST_DEPLOYMENT: &str = "gpt-4o-mini";
pub const DEFAULT_CAPABLE_DEPLOYMENT: &str = "gpt-4o";
pub const DEFAULT_API_VERSION: &str = "2024-12-01-preview";

/// Connection settings for the external completion provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub api_key: String,
    pub endpoint: String,
    pub fast_deployment: String,
    pub capable_deployment: String,
    pub api_version: String,
    pub timeout_secs: Option<u64>,
}

impl ProviderSettings {
    const API_KEY_ENV: &'static str = "CREDIT_GUARD_API_KEY";
    const ENDPOINT_ENV: &'static str = "CREDIT_GUARD_ENDPOINT";
    const FAST_DEPLOYMENT_ENV: &'static str = "CREDIT_GUARD_FAST_DEPLOYMENT";
    const CAPABLE_DEPLOYMENT_ENV: &'static str = "CREDIT_GUARD_CAPABLE_DEPLOYMENT";
    const API_VERSION_ENV: &'static str = "CREDIT_GUARD_API_VERSION";
    const TIMEOUT_ENV: &'static str = "CREDIT_GUARD_TIMEOUT_SECS";

    /// Load settings from environment variables.
    ///
    /// * `CREDIT_GUARD_API_KEY`: provider key (required).
    /// * `CREDIT_GUARD_ENDPOINT`: provider base URL (required).
    /// * `CREDIT_GUARD_FAST_DEPLOYMENT` / `CREDIT_GUARD_CAPABLE_DEPLOYMENT`: tier deployments.
    pub fn from_env() -> Result<Self> {
        Self::from_map(std::env::vars().collect())
    }

    pub fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let api_key = get(Self::API_KEY_ENV).with_context(|| {
            format!(
                "environment variable {} must be set to reach the completion provider",
                Self::API_KEY_ENV
            )
        })?;
        let endpoint = get(Self::ENDPOINT_ENV).with_context(|| {
            format!(
                "environment variable {} must be set to reach the completion provider",
                Self::ENDPOINT_ENV
            )
        })?;
        let timeout_secs = match get(Self::TIMEOUT_ENV) {
            Some(raw) => Some(raw.parse::<u64>().with_context(|| {
                format!("{} must be a whole number of seconds", Self::TIMEOUT_ENV)
            })?),
            None => None,
        };

        Ok(Self {
            api_key,
            endpoint,
            fast_deployment: get(Self::FAST_DEPLOYMENT_ENV)
                .unwrap_or_else(|| DEFAULT_FAST_DEPLOYMENT.to_string()),
            capable_deployment: get(Self::CAPABLE_DEPLOYMENT_ENV)
                .unwrap_or_else(|| DEFAULT_CAPABLE_DEPLOYMENT.to_string()),
            api_version: get(Self::API_VERSION_ENV)
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            timeout_secs,
        })
    }
}

/// Bounded exponential backoff applied to transient provider failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), doubling and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Caller identity charged against the rate window for pipeline calls.
    pub caller_id: String,
    pub rate_limit_per_window: u32,
    pub rate_window_secs: u64,
    pub max_tokens_ceiling: u32,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub fast_deployment: String,
    pub capable_deployment: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            caller_id: "credit-evaluation".into(),
            rate_limit_per_window: 60,
            rate_window_secs: 60,
            max_tokens_ceiling: 4_000,
            max_concurrency: 8,
            retry: RetryPolicy::default(),
            fast_deployment: DEFAULT_FAST_DEPLOYMENT.into(),
            capable_deployment: DEFAULT_CAPABLE_DEPLOYMENT.into(),
        }
    }
}

/// Everything the pipeline consumes at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gateway: GatewayConfig,
    pub filter: FilterPolicy,
    pub routing: RoutingTable,
    pub consolidation: ConsolidationConfig,
    pub evaluation_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            filter: FilterPolicy::default(),
            routing: RoutingTable::default(),
            consolidation: ConsolidationConfig::default(),
            evaluation_timeout_secs: 120,
        }
    }
}

impl PipelineConfig {
    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (
                self.gateway.rate_limit_per_window == 0,
                "gateway.rate_limit_per_window",
            ),
            (self.gateway.rate_window_secs == 0, "gateway.rate_window_secs"),
            (self.gateway.max_tokens_ceiling == 0, "gateway.max_tokens_ceiling"),
            (self.gateway.max_concurrency == 0, "gateway.max_concurrency"),
            (self.evaluation_timeout_secs == 0, "evaluation_timeout_secs"),
        ];
        if let Some((_, field)) = checks.into_iter().find(|(is_zero, _)| *is_zero) {
            return Err(ConfigError::Zero { field }.into());
        }
        self.consolidation.validate()?;
        self.filter
            .validate()
            .context("invalid filter policy in pipeline configuration")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn with_env_lock<F: FnOnce()>(func: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        func();
    }

    fn clear_env() {
        for key in [
            ProviderSettings::API_KEY_ENV,
            ProviderSettings::ENDPOINT_ENV,
            ProviderSettings::FAST_DEPLOYMENT_ENV,
            ProviderSettings::CAPABLE_DEPLOYMENT_ENV,
            ProviderSettings::API_VERSION_ENV,
            ProviderSettings::TIMEOUT_ENV,
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_for_optional_values() {
        with_env_lock(|| {
            clear_env();
            env::set_var(ProviderSettings::API_KEY_ENV, "secret");
            env::set_var(ProviderSettings::ENDPOINT_ENV, "https://example.openai.azure.com");

            let settings = ProviderSettings::from_env().expect("should load settings");
            assert_eq!(settings.api_key, "secret");
            assert_eq!(settings.fast_deployment, DEFAULT_FAST_DEPLOYMENT);
            assert_eq!(settings.capable_deployment, DEFAULT_CAPABLE_DEPLOYMENT);
            assert_eq!(settings.api_version, DEFAULT_API_VERSION);
            assert!(settings.timeout_secs.is_none());
            clear_env();
        });
    }

    #[test]
    fn errors_when_api_key_missing() {
        with_env_lock(|| {
            clear_env();
            env::set_var(ProviderSettings::ENDPOINT_ENV, "https://example.openai.azure.com");
            let err = ProviderSettings::from_env().expect_err("missing API key should error");
            assert!(err.to_string().contains(ProviderSettings::API_KEY_ENV));
            clear_env();
        });
    }

    #[test]
    fn parses_overrides_from_map() {
        let vars = HashMap::from([
            (ProviderSettings::API_KEY_ENV.to_string(), "k".to_string()),
            (ProviderSettings::ENDPOINT_ENV.to_string(), "http://localhost".to_string()),
            (ProviderSettings::FAST_DEPLOYMENT_ENV.to_string(), "mini-eu".to_string()),
            (ProviderSettings::TIMEOUT_ENV.to_string(), " 45 ".to_string()),
        ]);
        let settings = ProviderSettings::from_map(vars).unwrap();
        assert_eq!(settings.fast_deployment, "mini-eu");
        assert_eq!(settings.timeout_secs, Some(45));
    }

    #[test]
    fn rejects_non_numeric_timeout() {
        let vars = HashMap::from([
            (ProviderSettings::API_KEY_ENV.to_string(), "k".to_string()),
            (ProviderSettings::ENDPOINT_ENV.to_string(), "http://localhost".to_string()),
            (ProviderSettings::TIMEOUT_ENV.to_string(), "soon".to_string()),
        ]);
        let err = ProviderSettings::from_map(vars).unwrap_err();
        assert!(err.to_string().contains(ProviderSettings::TIMEOUT_ENV));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(80), Duration::from_millis(5_000));
    }

    #[test]
    fn default_pipeline_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.gateway.max_tokens_ceiling, 4_000);
        assert_eq!(config.gateway.rate_limit_per_window, 60);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"gateway":{"max_tokens_ceiling":2000},"evaluation_timeout_secs":30}"#,
        )
        .unwrap();
        assert_eq!(config.gateway.max_tokens_ceiling, 2000);
        assert_eq!(config.gateway.max_concurrency, 8);
        assert_eq!(config.evaluation_timeout(), Duration::from_secs(30));
        assert!(config.filter.enable_pii_detection);
    }

    #[test]
    fn rejects_zero_limits() {
        let mut config = PipelineConfig::default();
        config.gateway.max_concurrency = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gateway.max_concurrency"));
    }
}
