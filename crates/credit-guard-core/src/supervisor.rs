//! Periodic review of the audit trail for abuse and failure patterns.

use std::{collections::HashMap, sync::Arc};

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    audit::{AuditEvent, AuditEventType},
    gateway::{CompletionGateway, CompletionRequest, ModelTier},
    structured::parse_structured,
};

pub const DEFAULT_REVIEW_WINDOW: usize = 100;
const SUPERVISOR_AGENT_ID: &str = "security_supervisor";
const MAX_TOKENS: u32 = 600;
const SYSTEM_PROMPT: &str = "Eres un analista de un centro de operaciones de seguridad \
especializado en sistemas de IA. Responde únicamente con un objeto JSON válido.";

const POLICY_KINDS: [&str; 4] = [
    "RateLimitExceeded",
    "BlockedContent",
    "PIIDetected",
    "TokenBudgetExceeded",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    #[serde(alias = "None", alias = "Ninguna", alias = "ninguna")]
    None,
    #[serde(alias = "ManualReview", alias = "Revisión Manual Requerida")]
    ManualReview,
    #[serde(alias = "CriticalAlert", alias = "Alerta de Seguridad Crítica")]
    CriticalAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Model,
    Heuristic,
}

/// Deterministic counters over the reviewed events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionSignals {
    pub events_reviewed: usize,
    pub failed_validations: usize,
    pub policy_rejections: usize,
    pub upstream_failures: usize,
    pub failed_evaluations: usize,
    /// Highest number of completion calls by one caller inside one rate window.
    pub peak_calls_per_window: usize,
    pub burst_detected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionReport {
    pub anomaly_detected: bool,
    pub confidence_score: f64,
    pub summary: String,
    pub recommended_action: RecommendedAction,
    pub source: VerdictSource,
    pub signals: SupervisionSignals,
}

#[derive(Deserialize)]
struct ModelVerdict {
    anomaly_detected: bool,
    #[serde(default)]
    confidence_score: f64,
    #[serde(default)]
    summary: String,
    recommended_action: RecommendedAction,
}

pub struct SecuritySupervisor {
    gateway: Arc<CompletionGateway>,
}

impl SecuritySupervisor {
    pub fn new(gateway: Arc<CompletionGateway>) -> Self {
        Self { gateway }
    }

    /// Review the most recent `n` audit events.
    #[instrument(skip(self))]
    pub async fn review(&self, n: usize) -> SupervisionReport {
        let events = self.gateway.audit().recent(n);
        if events.is_empty() {
            return SupervisionReport {
                anomaly_detected: false,
                confidence_score: 0.0,
                summary: "The audit trail is empty; nothing to analyse.".into(),
                recommended_action: RecommendedAction::None,
                source: VerdictSource::Heuristic,
                signals: SupervisionSignals::default(),
            };
        }

        let config = self.gateway.config();
        let signals = collect_signals(
            &events,
            config.rate_limit_per_window as usize,
            i64::try_from(config.rate_window_secs).unwrap_or(i64::MAX),
        );
        let heuristic = heuristic_verdict(&signals);
        debug!(?signals, "computed supervision signals");

        let report = match self.model_verdict(&events, &signals).await {
            Some(verdict) => merge(heuristic, verdict),
            None => heuristic,
        };

        if report.anomaly_detected {
            warn!(action = ?report.recommended_action, "security supervision flagged an anomaly");
        } else {
            info!(
                events = report.signals.events_reviewed,
                "security supervision found no anomaly"
            );
        }
        self.gateway.audit().record(
            AuditEvent::new(AuditEventType::SecuritySupervision, SUPERVISOR_AGENT_ID)
                .with_caller(self.gateway.caller_id())
                .with_outcome(!report.anomaly_detected)
                .with_detail(format!(
                    "anomaly={} action={:?} source={:?}",
                    report.anomaly_detected, report.recommended_action, report.source
                )),
        );
        report
    }

    async fn model_verdict(
        &self,
        events: &[AuditEvent],
        signals: &SupervisionSignals,
    ) -> Option<ModelVerdict> {
        let request = CompletionRequest::new(
            self.gateway.caller_id(),
            SUPERVISOR_AGENT_ID,
            supervision_prompt(events, signals),
        )
        .with_max_tokens(MAX_TOKENS)
        .with_temperature(0.0);
        let response = match self
            .gateway
            .complete(&request, SYSTEM_PROMPT, ModelTier::Capable)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(kind = err.kind(), "supervision call failed; using heuristic verdict");
                return None;
            }
        };
        match parse_structured::<ModelVerdict>(&response.response_text) {
            Ok(verdict) => Some(verdict),
            Err(failure) => {
                warn!(reason = %failure.reason, "unparseable supervision verdict; using heuristic verdict");
                None
            }
        }
    }
}

fn failure_kind(event: &AuditEvent) -> Option<&str> {
    event
        .detail
        .as_deref()
        .and_then(|detail| detail.split(':').next())
        .map(str::trim)
}

pub(crate) fn collect_signals(
    events: &[AuditEvent],
    rate_limit: usize,
    window_secs: i64,
) -> SupervisionSignals {
    let mut signals = SupervisionSignals {
        events_reviewed: events.len(),
        ..SupervisionSignals::default()
    };
    let mut per_caller: HashMap<&str, Vec<&AuditEvent>> = HashMap::new();

    for event in events {
        match event.event_type {
            AuditEventType::InputValidation if !event.success => signals.failed_validations += 1,
            AuditEventType::EvaluationFailed => signals.failed_evaluations += 1,
            AuditEventType::CompletionRequest => {
                per_caller.entry(event.caller_id.as_str()).or_default().push(event);
                if !event.success {
                    match failure_kind(event) {
                        Some(kind) if POLICY_KINDS.contains(&kind) => {
                            signals.policy_rejections += 1;
                            if kind == "RateLimitExceeded" {
                                signals.burst_detected = true;
                            }
                        }
                        _ => signals.upstream_failures += 1,
                    }
                }
            }
            _ => {}
        }
    }

    let window = ChronoDuration::seconds(window_secs.clamp(1, i64::from(u32::MAX)));
    for calls in per_caller.values() {
        let mut start = 0;
        for end in 0..calls.len() {
            while calls[end].timestamp - calls[start].timestamp >= window {
                start += 1;
            }
            signals.peak_calls_per_window = signals.peak_calls_per_window.max(end - start + 1);
        }
    }
    if rate_limit > 0 && signals.peak_calls_per_window >= rate_limit {
        signals.burst_detected = true;
    }
    signals
}

pub(crate) fn heuristic_verdict(signals: &SupervisionSignals) -> SupervisionReport {
    let mut findings = Vec::new();
    if signals.failed_validations >= 2 {
        findings.push(format!("{} failed input validations", signals.failed_validations));
    }
    if signals.policy_rejections >= 3 {
        findings.push(format!("{} gateway policy rejections", signals.policy_rejections));
    }
    if signals.upstream_failures >= 3 {
        findings.push(format!("{} upstream failures", signals.upstream_failures));
    }
    if signals.burst_detected {
        findings.push(format!(
            "burst of {} calls from one caller in a single rate window",
            signals.peak_calls_per_window
        ));
    }

    let critical = signals.failed_validations >= 5
        || signals.policy_rejections >= 10
        || (signals.burst_detected && signals.policy_rejections > 0);
    let recommended_action = if critical {
        RecommendedAction::CriticalAlert
    } else if !findings.is_empty() {
        RecommendedAction::ManualReview
    } else {
        RecommendedAction::None
    };
    let anomaly_detected = !findings.is_empty();
    let confidence_score = if anomaly_detected {
        (0.5 + 0.15 * findings.len() as f64).min(1.0)
    } else {
        0.0
    };
    let summary = if anomaly_detected {
        format!("Anomalous activity: {}.", findings.join("; "))
    } else {
        format!(
            "No anomalous pattern in the last {} audit events.",
            signals.events_reviewed
        )
    };
    SupervisionReport {
        anomaly_detected,
        confidence_score,
        summary,
        recommended_action,
        source: VerdictSource::Heuristic,
        signals: signals.clone(),
    }
}

/// The model may escalate a heuristic verdict but never clear it.
fn merge(heuristic: SupervisionReport, verdict: ModelVerdict) -> SupervisionReport {
    let summary = if verdict.summary.trim().is_empty() {
        heuristic.summary
    } else {
        verdict.summary
    };
    SupervisionReport {
        anomaly_detected: heuristic.anomaly_detected || verdict.anomaly_detected,
        confidence_score: verdict
            .confidence_score
            .clamp(0.0, 1.0)
            .max(heuristic.confidence_score),
        summary,
        recommended_action: heuristic.recommended_action.max(verdict.recommended_action),
        source: VerdictSource::Model,
        signals: heuristic.signals,
    }
}

/// Only event shape and counters reach the model, never event details.
fn supervision_prompt(events: &[AuditEvent], signals: &SupervisionSignals) -> String {
    let timeline: Vec<String> = events
        .iter()
        .map(|event| {
            format!(
                "{} {:?} agent={} caller={} ok={}",
                event.timestamp.format("%H:%M:%S%.3f"),
                event.event_type,
                event.agent_id,
                event.caller_id,
                event.success
            )
        })
        .collect();
    format!(
        r#"Analiza la siguiente actividad de auditoría de una plataforma de evaluación crediticia y detecta patrones sospechosos.

Busca, por ejemplo:
- Múltiples validaciones de entrada fallidas en poco tiempo.
- Picos de rechazos de política o de errores del proveedor.
- Actividad repetitiva y rápida que sugiera un ataque automatizado.

CONTADORES:
- eventos revisados: {events}
- validaciones fallidas: {validations}
- rechazos de política: {rejections}
- fallos del proveedor: {upstream}
- evaluaciones fallidas: {evaluations}
- pico de llamadas por ventana: {peak}

ACTIVIDAD:
{timeline}

Responde solo con JSON con las claves "anomaly_detected" (bool), "confidence_score" (0.0 a 1.0), "summary" y "recommended_action" ("Ninguna", "Revisión Manual Requerida" o "Alerta de Seguridad Crítica")."#,
        events = signals.events_reviewed,
        validations = signals.failed_validations,
        rejections = signals.policy_rejections,
        upstream = signals.upstream_failures,
        evaluations = signals.failed_evaluations,
        peak = signals.peak_calls_per_window,
        timeline = timeline.join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::AuditTrail, error::ProviderError, gateway::content_filter::ContentFilter,
        settings::GatewayConfig, test_support::ScriptedProvider,
    };

    fn gateway(provider: ScriptedProvider, audit: Arc<AuditTrail>) -> Arc<CompletionGateway> {
        let config = GatewayConfig {
            retry: crate::settings::RetryPolicy::none(),
            ..GatewayConfig::default()
        };
        Arc::new(CompletionGateway::new(
            Arc::new(provider),
            config,
            ContentFilter::default(),
            audit,
        ))
    }

    fn rejection(kind: &str) -> AuditEvent {
        AuditEvent::new(AuditEventType::CompletionRequest, "financial_analyzer")
            .with_caller("credit-evaluation")
            .with_outcome(false)
            .with_detail(format!("{kind}: rejected"))
    }

    #[tokio::test]
    async fn empty_trail_has_nothing_to_analyse() {
        let provider = ScriptedProvider::replying("{}");
        let supervisor = SecuritySupervisor::new(gateway(provider, Arc::new(AuditTrail::new())));
        let report = supervisor.review(DEFAULT_REVIEW_WINDOW).await;
        assert!(!report.anomaly_detected);
        assert!(report.summary.contains("nothing to analyse"));
        assert_eq!(report.recommended_action, RecommendedAction::None);
    }

    #[test]
    fn counts_failure_signals() {
        let events = vec![
            rejection("BlockedContent"),
            rejection("PIIDetected"),
            rejection("UpstreamFailure"),
            AuditEvent::new(AuditEventType::InputValidation, "input_validator").with_outcome(false),
            AuditEvent::new(AuditEventType::EvaluationFailed, "orchestrator").with_outcome(false),
        ];
        let signals = collect_signals(&events, 60, 60);
        assert_eq!(signals.policy_rejections, 2);
        assert_eq!(signals.upstream_failures, 1);
        assert_eq!(signals.failed_validations, 1);
        assert_eq!(signals.failed_evaluations, 1);
        assert!(!signals.burst_detected);
        assert!(!heuristic_verdict(&signals).anomaly_detected);
    }

    #[test]
    fn burst_with_rejections_is_critical() {
        let mut events: Vec<AuditEvent> = (0..5)
            .map(|_| {
                AuditEvent::new(AuditEventType::CompletionRequest, "input_validator")
                    .with_caller("bot")
                    .with_outcome(true)
            })
            .collect();
        events.push(rejection("RateLimitExceeded"));
        let signals = collect_signals(&events, 5, 60);
        assert!(signals.burst_detected);
        assert_eq!(signals.peak_calls_per_window, 5);
        let report = heuristic_verdict(&signals);
        assert!(report.anomaly_detected);
        assert_eq!(report.recommended_action, RecommendedAction::CriticalAlert);
    }

    #[tokio::test]
    async fn model_verdict_escalates_but_never_clears() {
        let audit = Arc::new(AuditTrail::new());
        for _ in 0..3 {
            audit.record(rejection("BlockedContent"));
        }
        let provider = ScriptedProvider::replying(
            r#"{"anomaly_detected": false, "confidence_score": 0.2, "summary": "Actividad normal", "recommended_action": "Ninguna"}"#,
        );
        let supervisor = SecuritySupervisor::new(gateway(provider, Arc::clone(&audit)));
        let report = supervisor.review(10).await;
        assert!(report.anomaly_detected);
        assert_eq!(report.source, VerdictSource::Model);
        assert_eq!(report.recommended_action, RecommendedAction::ManualReview);
        assert_eq!(
            audit.recent(1)[0].event_type,
            AuditEventType::SecuritySupervision
        );
    }

    #[tokio::test]
    async fn falls_back_to_heuristic_when_model_fails() {
        let audit = Arc::new(AuditTrail::new());
        audit.record(
            AuditEvent::new(AuditEventType::EvaluationCompleted, "orchestrator").with_outcome(true),
        );
        let provider = ScriptedProvider::replying("{}").fail_for_agent(
            SUPERVISOR_AGENT_ID,
            ProviderError::Status {
                status: 500,
                body: "boom".into(),
            },
        );
        let supervisor = SecuritySupervisor::new(gateway(provider, audit));
        let report = supervisor.review(DEFAULT_REVIEW_WINDOW).await;
        assert_eq!(report.source, VerdictSource::Heuristic);
        assert!(!report.anomaly_detected);
        assert_eq!(report.signals.events_reviewed, 1);
    }
}
