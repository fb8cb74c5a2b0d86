use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by a completion provider while talking to the external service.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    /// The HTTP request never produced a response (connect, TLS, timeout).
    #[error("transport error: {message}")]
    Transport { message: String },
    /// The provider answered with a non-success status code.
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The provider answered but the payload was not a usable completion.
    #[error("invalid provider response: {message}")]
    InvalidResponse { message: String },
    /// Required connection settings are missing.
    #[error("provider not configured: {message}")]
    NotConfigured { message: String },
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::InvalidResponse { .. } | Self::NotConfigured { .. } => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

/// Outcome taxonomy of a single call through the completion gateway.
///
/// The first four variants are policy rejections: they are raised before any
/// network traffic and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayError {
    #[error("rate limit exceeded for caller `{caller_id}` ({limit} requests per window)")]
    RateLimitExceeded { caller_id: String, limit: u32 },
    #[error("blocked content detected (keyword `{keyword}`)")]
    BlockedContent { keyword: String },
    #[error("PII detected in request ({pattern_id})")]
    PiiDetected { pattern_id: String },
    #[error("token limit exceeded: {requested} > {ceiling}")]
    TokenBudgetExceeded { requested: u32, ceiling: u32 },
    #[error("upstream completion failed after {attempts} attempt(s): {source}")]
    UpstreamFailure {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
}

impl GatewayError {
    /// Stable identifier used in audit records and result `error` fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::BlockedContent { .. } => "BlockedContent",
            Self::PiiDetected { .. } => "PIIDetected",
            Self::TokenBudgetExceeded { .. } => "TokenBudgetExceeded",
            Self::UpstreamFailure { .. } => "UpstreamFailure",
        }
    }

    pub fn is_policy_rejection(&self) -> bool {
        !matches!(self, Self::UpstreamFailure { .. })
    }
}

/// Faults that end an evaluation in the `FAILED` state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("validation_failed")]
    ValidationAllUnsafe,
    #[error("timeout during {stage}")]
    Timeout { stage: &'static str },
    #[error("unhandled fault during {stage}: {message}")]
    StageFault { stage: &'static str, message: String },
}

/// Invalid configuration supplied at startup.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("consolidation weights must be non-negative and sum to 1.0 (got {sum})")]
    InvalidWeights { sum: f64 },
    #[error("risk thresholds must satisfy 0 <= medio_min <= bajo_min <= 1000 (got medio_min={medio_min}, bajo_min={bajo_min})")]
    InvalidThresholds { medio_min: f64, bajo_min: f64 },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}
