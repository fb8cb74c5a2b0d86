pub mod analysis;
pub mod audit;
pub mod consolidation;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod record;
pub mod report;
pub mod sanitizer;
pub mod settings;
pub mod structured;
pub mod supervisor;
pub mod validation;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use analysis::{AnalysisFindings, AnalysisOutcome, AnalysisResult, AnalyzerKind, BusinessAnalyzer};
pub use audit::{AuditEvent, AuditEventType, AuditStats, AuditTrail};
pub use consolidation::{
    ConsolidatedReport, ConsolidationConfig, ConsolidationEngine, CreditRiskTier, ScoreBreakdown,
};
pub use error::{ConfigError, GatewayError, PipelineError, ProviderError};
pub use gateway::{
    azure::AzureOpenAiProvider,
    content_filter::{ContentFilter, FilterPolicy, PiiPattern, PolicyError},
    rate_limiter::RateLimiter,
    router::{ModelRecommendation, ModelRouter, RoutingTable},
    CompletionGateway, CompletionProvider, CompletionRequest, CompletionResponse, ModelTier,
    NoopProvider, ProviderReply, ProviderRequest,
};
pub use orchestrator::{EvaluationResult, EvaluationState, Orchestrator};
pub use record::{CompanyField, CompanyRecord};
pub use report::{render_evaluation, OutputFormat};
pub use sanitizer::{OutputSanitizer, SanitizedText};
pub use settings::{GatewayConfig, PipelineConfig, ProviderSettings, RetryPolicy};
pub use supervisor::{RecommendedAction, SecuritySupervisor, SupervisionReport};
pub use validation::{CompanyValidationResult, FieldValidationResult, InputValidationStage, RiskLevel};
