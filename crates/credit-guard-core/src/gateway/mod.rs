//! The single chokepoint between pipeline stages and the external completion
//! service.

pub mod azure;
pub mod content_filter;
mod proxy;
pub mod rate_limiter;
pub mod router;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProviderError;

pub use proxy::{CompletionGateway, GatewayUsage, HealthReport, HealthStatus};

/// Top-P sent on every capable-tier call.
pub const CAPABLE_TOP_P: f32 = 0.95;
/// Confidence attached to every successful completion response.
pub const RESPONSE_CONFIDENCE: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheap, low-latency deployment.
    Fast,
    /// Higher-quality, higher-cost deployment.
    Capable,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Capable => f.write_str("capable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub request_id: Uuid,
    pub caller_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Evaluation this call belongs to, threaded into the audit record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<Uuid>,
}

impl CompletionRequest {
    pub fn new(
        caller_id: impl Into<String>,
        agent_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            caller_id: caller_id.into(),
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            max_tokens: 1000,
            temperature: 0.1,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            evaluation_id: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_evaluation(mut self, evaluation_id: Option<Uuid>) -> Self {
        self.evaluation_id = evaluation_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub request_id: Uuid,
    pub response_text: String,
    pub tokens_used: u32,
    pub processing_time_ms: u64,
    /// True when outbound masking altered the provider text.
    pub filtered_content: bool,
    pub confidence_score: f32,
    pub timestamp: DateTime<Utc>,
}

/// Tier-specific sampling parameters as they go over the wire.
///
/// The fast tier only understands a completion-token budget; the capable tier
/// takes the full sampling set with fixed nucleus and penalty defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TierParameters {
    Fast {
        max_completion_tokens: u32,
    },
    Capable {
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
        frequency_penalty: f32,
        presence_penalty: f32,
    },
}

impl TierParameters {
    pub fn for_tier(tier: ModelTier, max_tokens: u32, temperature: f32) -> Self {
        match tier {
            ModelTier::Fast => Self::Fast {
                max_completion_tokens: max_tokens,
            },
            ModelTier::Capable => Self::Capable {
                max_tokens,
                temperature,
                top_p: CAPABLE_TOP_P,
                frequency_penalty: 0.0,
                presence_penalty: 0.0,
            },
        }
    }
}

/// What crosses the provider boundary for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderRequest {
    pub request_id: Uuid,
    pub agent_id: String,
    pub prompt: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub model_tier: ModelTier,
    pub parameters: TierParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReply {
    pub text: String,
    pub tokens_used: u32,
    pub processing_time_ms: u64,
}

/// External completion service. The gateway is its only caller.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError>;
}

/// Offline stand-in used when no provider is configured. Every call fails, so
/// validation fails closed and consolidation falls back to local text.
#[derive(Debug, Default, Clone)]
pub struct NoopProvider;

#[async_trait]
impl CompletionProvider for NoopProvider {
    fn name(&self) -> &str {
        "noop"
    }

    async fn complete(&self, _request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        Err(ProviderError::NotConfigured {
            message: "no completion provider configured; running offline".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_tier_serializes_token_budget_only() {
        let params = TierParameters::for_tier(ModelTier::Fast, 300, 0.0);
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            serde_json::json!({ "max_completion_tokens": 300 })
        );
    }

    #[test]
    fn capable_tier_carries_sampling_defaults() {
        let params = TierParameters::for_tier(ModelTier::Capable, 1500, 0.1);
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["max_tokens"], 1500);
        assert_eq!(value["frequency_penalty"], 0.0);
        assert_eq!(value["presence_penalty"], 0.0);
        assert!((value["top_p"].as_f64().unwrap() - 0.95).abs() < 1e-6);
        assert!(value.get("max_completion_tokens").is_none());
    }

    #[tokio::test]
    async fn noop_provider_is_never_transient() {
        let request = ProviderRequest {
            request_id: Uuid::new_v4(),
            agent_id: "input_validator".into(),
            prompt: "hola".into(),
            system_prompt: String::new(),
            max_tokens: 10,
            temperature: 0.0,
            model_tier: ModelTier::Fast,
            parameters: TierParameters::for_tier(ModelTier::Fast, 10, 0.0),
        };
        let err = NoopProvider.complete(&request).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
