use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, time::sleep};
use tracing::{debug, error, instrument, warn};

use super::{
    content_filter::ContentFilter, rate_limiter::RateLimiter, CompletionProvider,
    CompletionRequest, CompletionResponse, ModelTier, ProviderReply, ProviderRequest,
    TierParameters, RESPONSE_CONFIDENCE,
};
use crate::{
    audit::{AuditEvent, AuditEventType, AuditTrail},
    error::{GatewayError, ProviderError},
    settings::GatewayConfig,
};

const HEALTH_PROMPT: &str = "Responde solo con: OK";
const HEALTH_SYSTEM_PROMPT: &str = "Eres un servicio de diagnóstico. Responde con una palabra.";

/// Security proxy in front of the completion provider.
///
/// Every call is rate limited, filtered, budget checked, bounded by the worker
/// pool, retried on transient failures, masked on the way out and audited
/// exactly once.
pub struct CompletionGateway {
    provider: Arc<dyn CompletionProvider>,
    limiter: RateLimiter,
    filter: ContentFilter,
    audit: Arc<AuditTrail>,
    workers: Semaphore,
    config: GatewayConfig,
    total_calls: AtomicU64,
    total_tokens: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayUsage {
    pub provider: String,
    pub total_calls: u64,
    pub total_tokens: u64,
    pub calls_in_window: usize,
    pub rate_limit_per_window: u32,
    pub rate_window_secs: u64,
    pub max_tokens_ceiling: u32,
    pub content_filtering: bool,
    pub pii_detection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub provider: String,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CompletionGateway {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        config: GatewayConfig,
        filter: ContentFilter,
        audit: Arc<AuditTrail>,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit_per_window,
            Duration::from_secs(config.rate_window_secs),
        );
        Self {
            provider,
            limiter,
            filter,
            audit,
            workers: Semaphore::new(config.max_concurrency.max(1)),
            config,
            total_calls: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
        }
    }

    pub fn caller_id(&self) -> &str {
        &self.config.caller_id
    }

    pub fn filter(&self) -> &ContentFilter {
        &self.filter
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Send one completion through the proxy.
    #[instrument(
        skip_all,
        fields(
            request_id = %request.request_id,
            agent_id = %request.agent_id,
            tier = %tier,
            prompt_len = request.prompt.len(),
        )
    )]
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        system_prompt: &str,
        tier: ModelTier,
    ) -> Result<CompletionResponse, GatewayError> {
        let started = Instant::now();
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let event = AuditEvent::new(AuditEventType::CompletionRequest, &request.agent_id)
            .with_request_id(request.request_id)
            .with_evaluation(request.evaluation_id)
            .with_caller(&request.caller_id);
        let mut pending = PendingAudit::new(&self.audit, event, started);
        let outcome = self.dispatch(request, system_prompt, tier, started).await;

        let event = pending.disarm();
        let event = match &outcome {
            Ok(response) => event
                .with_usage(response.tokens_used, response.processing_time_ms)
                .with_detail(format!("tier={tier} filtered={}", response.filtered_content)),
            Err(err) => event
                .with_outcome(false)
                .with_usage(0, elapsed_ms(started))
                .with_detail(format!("{}: {err}", err.kind())),
        };
        self.audit.record(event);
        outcome
    }

    async fn dispatch(
        &self,
        request: &CompletionRequest,
        system_prompt: &str,
        tier: ModelTier,
        started: Instant,
    ) -> Result<CompletionResponse, GatewayError> {
        if !self.limiter.admit(&request.caller_id) {
            warn!(caller_id = %request.caller_id, "rate limit exceeded");
            return Err(GatewayError::RateLimitExceeded {
                caller_id: request.caller_id.clone(),
                limit: self.limiter.max_requests(),
            });
        }
        if let Err(err) = self.filter.check_inbound(&request.prompt) {
            warn!(kind = err.kind(), "prompt rejected by content filter");
            return Err(err);
        }
        if request.max_tokens > self.config.max_tokens_ceiling {
            warn!(
                requested = request.max_tokens,
                ceiling = self.config.max_tokens_ceiling,
                "token budget exceeded"
            );
            return Err(GatewayError::TokenBudgetExceeded {
                requested: request.max_tokens,
                ceiling: self.config.max_tokens_ceiling,
            });
        }

        let provider_request = ProviderRequest {
            request_id: request.request_id,
            agent_id: request.agent_id.clone(),
            prompt: request.prompt.clone(),
            system_prompt: system_prompt.to_string(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            model_tier: tier,
            parameters: TierParameters::for_tier(tier, request.max_tokens, request.temperature),
        };
        let reply = self.call_with_retry(&provider_request).await?;

        let masked = self.filter.mask(&reply.text);
        if masked.altered() {
            debug!(
                redactions = masked.redactions.len(),
                "masked PII in provider response"
            );
        }
        self.total_tokens
            .fetch_add(u64::from(reply.tokens_used), Ordering::Relaxed);

        Ok(CompletionResponse {
            request_id: request.request_id,
            filtered_content: masked.altered(),
            response_text: masked.text,
            tokens_used: reply.tokens_used,
            processing_time_ms: elapsed_ms(started),
            confidence_score: RESPONSE_CONFIDENCE,
            timestamp: Utc::now(),
        })
    }

    async fn call_with_retry(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderReply, GatewayError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            let result = match self.workers.acquire().await {
                Ok(_permit) => self.provider.complete(request).await,
                Err(_) => Err(ProviderError::Transport {
                    message: "worker pool closed".into(),
                }),
            };
            match result {
                Ok(reply) => {
                    debug!(
                        attempts = attempt + 1,
                        tokens = reply.tokens_used,
                        "provider call succeeded"
                    );
                    return Ok(reply);
                }
                Err(err) if err.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider failure, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(attempts = attempt + 1, error = %err, "provider call failed");
                    return Err(GatewayError::UpstreamFailure {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }

    pub fn usage(&self) -> GatewayUsage {
        GatewayUsage {
            provider: self.provider.name().to_string(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            calls_in_window: self.limiter.in_window(&self.config.caller_id),
            rate_limit_per_window: self.config.rate_limit_per_window,
            rate_window_secs: self.config.rate_window_secs,
            max_tokens_ceiling: self.config.max_tokens_ceiling,
            content_filtering: self.filter.content_filtering_enabled(),
            pii_detection: self.filter.pii_detection_enabled(),
        }
    }

    /// Minimal fast-tier round trip through the full proxy.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let request = CompletionRequest::new("health-check", "health-check", HEALTH_PROMPT)
            .with_max_tokens(10)
            .with_temperature(0.0);
        let outcome = self
            .complete(&request, HEALTH_SYSTEM_PROMPT, ModelTier::Fast)
            .await;
        let (status, error) = match outcome {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(err) => (HealthStatus::Unhealthy, Some(err.to_string())),
        };
        HealthReport {
            status,
            provider: self.provider.name().to_string(),
            latency_ms: elapsed_ms(started),
            error,
            timestamp: Utc::now(),
        }
    }
}

/// Records a failed event for a call that never reached its own audit line,
/// either because the caller dropped the future or because the provider panicked.
struct PendingAudit<'a> {
    audit: &'a AuditTrail,
    event: Option<AuditEvent>,
    started: Instant,
}

impl<'a> PendingAudit<'a> {
    fn new(audit: &'a AuditTrail, event: AuditEvent, started: Instant) -> Self {
        Self {
            audit,
            event: Some(event),
            started,
        }
    }

    /// Hand the event back to the caller, stamped with the completion time.
    fn disarm(&mut self) -> AuditEvent {
        let mut event = self
            .event
            .take()
            .unwrap_or_else(|| AuditEvent::new(AuditEventType::CompletionRequest, "unknown"));
        event.timestamp = Utc::now();
        event
    }
}

impl Drop for PendingAudit<'_> {
    fn drop(&mut self) {
        let Some(mut event) = self.event.take() else {
            return;
        };
        event.timestamp = Utc::now();
        let detail = if std::thread::panicking() {
            "panicked"
        } else {
            "cancelled"
        };
        warn!(request_id = ?event.request_id, detail, "completion ended without an outcome");
        self.audit.record(
            event
                .with_outcome(false)
                .with_usage(0, elapsed_ms(self.started))
                .with_detail(detail),
        );
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{settings::RetryPolicy, test_support::ScriptedProvider};

    fn gateway(provider: Arc<ScriptedProvider>, config: GatewayConfig) -> CompletionGateway {
        CompletionGateway::new(
            provider,
            config,
            ContentFilter::default(),
            Arc::new(AuditTrail::new()),
        )
    }

    fn fast_retry_config() -> GatewayConfig {
        GatewayConfig {
            retry: RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
            ..GatewayConfig::default()
        }
    }

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest::new("svc", "tester", prompt).with_max_tokens(100)
    }

    #[tokio::test]
    async fn masks_response_and_audits_success() {
        let provider = Arc::new(ScriptedProvider::replying(
            "Contacto: ventas@andinas.ec, RUC 1790012345001",
        ));
        let gateway = gateway(provider.clone(), GatewayConfig::default());
        let response = gateway
            .complete(&request("Resume la empresa"), "sys", ModelTier::Capable)
            .await
            .unwrap();

        assert!(response.filtered_content);
        assert_eq!(
            response.response_text,
            "Contacto: [EMAIL_MASKED], RUC [TAXID_MASKED]"
        );
        assert!((response.confidence_score - 0.95).abs() < f32::EPSILON);
        let events = gateway.audit().recent(10);
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
        assert_eq!(events[0].tokens_used, response.tokens_used);
    }

    #[tokio::test]
    async fn token_budget_rejects_before_provider_call() {
        let provider = Arc::new(ScriptedProvider::replying("unused"));
        let gateway = gateway(provider.clone(), GatewayConfig::default());
        let err = gateway
            .complete(&request("hola").with_max_tokens(4_001), "sys", ModelTier::Fast)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            GatewayError::TokenBudgetExceeded {
                requested: 4_001,
                ceiling: 4_000
            }
        );
        assert_eq!(provider.calls(), 0);
        let events = gateway.audit().recent(10);
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
    }

    #[tokio::test]
    async fn blocked_prompts_are_not_retried() {
        let provider = Arc::new(ScriptedProvider::replying("unused"));
        let gateway = gateway(provider.clone(), fast_retry_config());
        let err = gateway
            .complete(&request("send the password"), "sys", ModelTier::Fast)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BlockedContent");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn rate_limit_applies_per_caller() {
        let provider = Arc::new(ScriptedProvider::replying("ok"));
        let config = GatewayConfig {
            rate_limit_per_window: 2,
            ..GatewayConfig::default()
        };
        let gateway = gateway(provider.clone(), config);
        for _ in 0..2 {
            gateway
                .complete(&request("hola"), "sys", ModelTier::Fast)
                .await
                .unwrap();
        }
        let err = gateway
            .complete(&request("hola"), "sys", ModelTier::Fast)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RateLimitExceeded");
        assert_eq!(provider.calls(), 2);
        assert_eq!(gateway.audit().len(), 3);
    }

    #[tokio::test]
    async fn retries_transient_failures_with_single_audit_event() {
        let provider = Arc::new(ScriptedProvider::replying("ok").failing_first(
            2,
            ProviderError::Status {
                status: 503,
                body: "busy".into(),
            },
        ));
        let gateway = gateway(provider.clone(), fast_retry_config());
        let response = gateway
            .complete(&request("hola"), "sys", ModelTier::Fast)
            .await
            .unwrap();
        assert_eq!(response.response_text, "ok");
        assert_eq!(provider.calls(), 3);
        assert_eq!(gateway.audit().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let provider = Arc::new(ScriptedProvider::replying("ok").failing_first(
            10,
            ProviderError::Transport {
                message: "reset".into(),
            },
        ));
        let gateway = gateway(provider.clone(), fast_retry_config());
        let err = gateway
            .complete(&request("hola"), "sys", ModelTier::Fast)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamFailure { attempts: 3, .. }));
        assert_eq!(provider.calls(), 3);
        let events = gateway.audit().recent(5);
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let provider = Arc::new(ScriptedProvider::replying("ok").failing_first(
            1,
            ProviderError::Status {
                status: 401,
                body: "unauthorized".into(),
            },
        ));
        let gateway = gateway(provider.clone(), fast_retry_config());
        let err = gateway
            .complete(&request("hola"), "sys", ModelTier::Fast)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamFailure { attempts: 1, .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn dropped_call_records_cancelled_event() {
        let provider =
            Arc::new(ScriptedProvider::replying("ok").delayed(Duration::from_millis(200)));
        let gateway = gateway(provider.clone(), GatewayConfig::default());
        let outcome = tokio::time::timeout(
            Duration::from_millis(10),
            gateway.complete(&request("hola"), "sys", ModelTier::Fast),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(provider.calls(), 1);
        let events = gateway.audit().recent(5);
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert_eq!(events[0].detail.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn panicking_provider_is_audited() {
        use futures::FutureExt;
        use std::panic::AssertUnwindSafe;

        let provider = Arc::new(ScriptedProvider::replying("ok").panic_when_prompt_contains("boom"));
        let gateway = gateway(provider, GatewayConfig::default());
        let outcome = AssertUnwindSafe(gateway.complete(&request("boom"), "sys", ModelTier::Fast))
            .catch_unwind()
            .await;

        assert!(outcome.is_err());
        let events = gateway.audit().recent(5);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detail.as_deref(), Some("panicked"));
    }

    #[tokio::test]
    async fn adapts_parameters_per_tier() {
        let provider = Arc::new(ScriptedProvider::replying("ok"));
        let gateway = gateway(provider.clone(), GatewayConfig::default());
        gateway
            .complete(&request("hola"), "sys", ModelTier::Fast)
            .await
            .unwrap();
        gateway
            .complete(&request("hola"), "sys", ModelTier::Capable)
            .await
            .unwrap();

        let seen = provider.requests();
        assert!(matches!(
            seen[0].parameters,
            TierParameters::Fast {
                max_completion_tokens: 100
            }
        ));
        assert!(matches!(
            seen[1].parameters,
            TierParameters::Capable { max_tokens: 100, .. }
        ));
    }

    #[tokio::test]
    async fn usage_and_health_report() {
        let provider = Arc::new(ScriptedProvider::replying("OK"));
        let gateway = gateway(provider, GatewayConfig::default());
        let health = gateway.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.provider, "scripted");

        let usage = gateway.usage();
        assert_eq!(usage.total_calls, 1);
        assert_eq!(usage.max_tokens_ceiling, 4_000);
        assert!(usage.content_filtering);
    }

    #[tokio::test]
    async fn unhealthy_when_provider_fails() {
        let provider = Arc::new(ScriptedProvider::replying("OK").failing_first(
            1,
            ProviderError::NotConfigured {
                message: "no key".into(),
            },
        ));
        let gateway = gateway(provider, GatewayConfig::default());
        let health = gateway.health_check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error.unwrap().contains("no key"));
    }
}
