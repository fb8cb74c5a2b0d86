//! Weighted composite scoring and the final credit recommendation.

use std::{fmt, sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    analysis::{coerce_list, coerce_text, field, AnalysisOutcome, AnalysisResult, AnalyzerKind},
    audit::{AuditEvent, AuditEventType},
    error::ConfigError,
    gateway::{CompletionGateway, CompletionRequest, ModelTier},
    structured::parse_structured,
};

pub const CONSOLIDATION_AGENT_ID: &str = "consolidation";
const NEUTRAL_SCORE: f64 = 0.5;
const BASE_CONFIDENCE: f64 = 0.30;
const CONFIDENCE_SPAN: f64 = 0.65;
const MAX_TOKENS: u32 = 1_200;
const SYSTEM_PROMPT: &str = "Eres un comité de crédito para PYMEs. Responde únicamente con un objeto JSON válido.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationWeights {
    pub financial: f64,
    pub reputational: f64,
    pub behavioral: f64,
}

impl Default for ConsolidationWeights {
    fn default() -> Self {
        Self {
            financial: 0.6,
            reputational: 0.2,
            behavioral: 0.2,
        }
    }
}

impl ConsolidationWeights {
    pub fn weight(&self, kind: AnalyzerKind) -> f64 {
        match kind {
            AnalyzerKind::Financial => self.financial,
            AnalyzerKind::Reputational => self.reputational,
            AnalyzerKind::Behavioral => self.behavioral,
        }
    }
}

/// Score cut points on the 0–1000 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    /// Scores at or above this are `BAJO`.
    pub bajo_min: f64,
    /// Scores at or above this (and below `bajo_min`) are `MEDIO`.
    pub medio_min: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            bajo_min: 700.0,
            medio_min: 400.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub weights: ConsolidationWeights,
    pub thresholds: RiskThresholds,
}

impl ConsolidationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.weights;
        let sum = w.financial + w.reputational + w.behavioral;
        let non_negative = [w.financial, w.reputational, w.behavioral]
            .iter()
            .all(|v| *v >= 0.0 && v.is_finite());
        if !non_negative || (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidWeights { sum });
        }
        let t = &self.thresholds;
        if !(0.0 <= t.medio_min && t.medio_min <= t.bajo_min && t.bajo_min <= 1000.0) {
            return Err(ConfigError::InvalidThresholds {
                medio_min: t.medio_min,
                bajo_min: t.bajo_min,
            });
        }
        Ok(())
    }
}

/// Credit risk tier; higher scores mean lower risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CreditRiskTier {
    Bajo,
    Medio,
    Alto,
}

impl CreditRiskTier {
    pub fn from_score_with_thresholds(score: f64, thresholds: &RiskThresholds) -> Self {
        if score >= thresholds.bajo_min {
            Self::Bajo
        } else if score >= thresholds.medio_min {
            Self::Medio
        } else {
            Self::Alto
        }
    }
}

impl fmt::Display for CreditRiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Bajo => "BAJO",
            Self::Medio => "MEDIO",
            Self::Alto => "ALTO",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    /// Completed analysis with a usable sub-score.
    Scored,
    /// Degraded, no-data or unscored analysis; contributes the neutral score.
    Neutral,
    /// The analyzer failed.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub kind: AnalyzerKind,
    pub weight: f64,
    pub score: f64,
    pub status: ComponentStatus,
}

impl ComponentScore {
    fn quality(&self) -> f64 {
        match self.status {
            ComponentStatus::Scored => 1.0,
            ComponentStatus::Neutral => 0.5,
            ComponentStatus::Missing => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub final_score: u32,
    pub risk_level: CreditRiskTier,
    pub confidence: f64,
    pub components: Vec<ComponentScore>,
    pub missing_components: Vec<AnalyzerKind>,
}

/// Pure weighted composite of the three analyses.
pub fn score(
    financial: &AnalysisResult,
    reputational: &AnalysisResult,
    behavioral: &AnalysisResult,
    config: &ConsolidationConfig,
) -> ScoreBreakdown {
    let components: Vec<ComponentScore> = [financial, reputational, behavioral]
        .into_iter()
        .map(|result| {
            let (score, status) = match (result.success, result.component_score()) {
                (false, _) => (NEUTRAL_SCORE, ComponentStatus::Missing),
                (true, Some(score)) => (score, ComponentStatus::Scored),
                (true, None) => (NEUTRAL_SCORE, ComponentStatus::Neutral),
            };
            ComponentScore {
                kind: result.kind,
                weight: config.weights.weight(result.kind),
                score,
                status,
            }
        })
        .collect();

    let composite: f64 = components.iter().map(|c| c.weight * c.score).sum();
    let final_score = (composite * 1000.0).round().clamp(0.0, 1000.0) as u32;
    let quality: f64 = components.iter().map(|c| c.weight * c.quality()).sum();
    let confidence = round3(BASE_CONFIDENCE + CONFIDENCE_SPAN * quality.clamp(0.0, 1.0));
    let missing_components = components
        .iter()
        .filter(|c| c.status != ComponentStatus::Scored)
        .map(|c| c.kind)
        .collect();

    ScoreBreakdown {
        final_score,
        risk_level: CreditRiskTier::from_score_with_thresholds(
            f64::from(final_score),
            &config.thresholds,
        ),
        confidence,
        components,
        missing_components,
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeSource {
    Model,
    /// The model call failed or was unparseable; text generated locally.
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedReport {
    pub final_score: u32,
    pub risk_level: CreditRiskTier,
    pub confidence: f64,
    pub credit_recommendation: String,
    pub justification: String,
    pub contributing_factors: Vec<String>,
    pub tokens_used: u32,
    pub components: Vec<ComponentScore>,
    pub missing_components: Vec<AnalyzerKind>,
    pub narrative_source: NarrativeSource,
}

impl ConsolidatedReport {
    /// Every free-text value, for the outbound sanitizer.
    pub fn text_fields_mut(&mut self) -> Vec<&mut String> {
        let mut fields = vec![&mut self.credit_recommendation, &mut self.justification];
        fields.extend(self.contributing_factors.iter_mut());
        fields
    }
}

struct Narrative {
    credit_recommendation: String,
    justification: String,
    contributing_factors: Vec<String>,
}

pub struct ConsolidationEngine {
    gateway: Arc<CompletionGateway>,
    config: ConsolidationConfig,
}

impl ConsolidationEngine {
    pub fn new(gateway: Arc<CompletionGateway>, config: ConsolidationConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Score locally, then ask the capable tier for the narrative.
    #[instrument(skip_all)]
    pub async fn consolidate(
        &self,
        financial: &AnalysisResult,
        reputational: &AnalysisResult,
        behavioral: &AnalysisResult,
        evaluation_id: Option<Uuid>,
    ) -> ConsolidatedReport {
        let started = Instant::now();
        let breakdown = score(financial, reputational, behavioral, &self.config);

        let request = CompletionRequest::new(
            self.gateway.caller_id(),
            CONSOLIDATION_AGENT_ID,
            consolidation_prompt(&breakdown, [financial, reputational, behavioral]),
        )
        .with_max_tokens(MAX_TOKENS)
        .with_temperature(0.1)
        .with_evaluation(evaluation_id);

        let (narrative, tokens_used, source) = match self
            .gateway
            .complete(&request, SYSTEM_PROMPT, ModelTier::Capable)
            .await
        {
            Ok(response) => match parse_narrative(&response.response_text) {
                Some(narrative) => (narrative, response.tokens_used, NarrativeSource::Model),
                None => {
                    warn!("consolidation narrative unparseable; using local text");
                    (
                        local_narrative(&breakdown),
                        response.tokens_used,
                        NarrativeSource::Local,
                    )
                }
            },
            Err(err) => {
                warn!(error_kind = err.kind(), "consolidation call failed; using local text");
                (local_narrative(&breakdown), 0, NarrativeSource::Local)
            }
        };

        let report = ConsolidatedReport {
            final_score: breakdown.final_score,
            risk_level: breakdown.risk_level,
            confidence: breakdown.confidence,
            credit_recommendation: narrative.credit_recommendation,
            justification: narrative.justification,
            contributing_factors: narrative.contributing_factors,
            tokens_used,
            components: breakdown.components,
            missing_components: breakdown.missing_components,
            narrative_source: source,
        };

        self.gateway.audit().record(
            AuditEvent::new(AuditEventType::Consolidation, CONSOLIDATION_AGENT_ID)
                .with_evaluation(evaluation_id)
                .with_caller(self.gateway.caller_id())
                .with_usage(
                    tokens_used,
                    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                )
                .with_detail(format!(
                    "score={} risk={} confidence={:.2} narrative={:?}",
                    report.final_score, report.risk_level, report.confidence, source
                )),
        );
        report
    }
}

fn parse_narrative(raw: &str) -> Option<Narrative> {
    let value: serde_json::Value = parse_structured(raw).ok()?;
    let credit_recommendation = coerce_text(field(&value, "credit_recommendation"));
    let justification = coerce_text(field(&value, "justification"));
    if credit_recommendation.is_empty() || justification.is_empty() {
        return None;
    }
    Some(Narrative {
        credit_recommendation,
        justification,
        contributing_factors: coerce_list(field(&value, "contributing_factors")),
    })
}

fn local_narrative(breakdown: &ScoreBreakdown) -> Narrative {
    let credit_recommendation = match breakdown.risk_level {
        CreditRiskTier::Bajo => "Aprobar el crédito en condiciones estándar.",
        CreditRiskTier::Medio => "Aprobar con condiciones: monto limitado y seguimiento trimestral.",
        CreditRiskTier::Alto => "No aprobar sin garantías adicionales y revisión manual.",
    };
    let mut justification = format!(
        "Puntaje compuesto de {}/1000 (riesgo {}) con confianza {:.2}.",
        breakdown.final_score, breakdown.risk_level, breakdown.confidence
    );
    if !breakdown.missing_components.is_empty() {
        let missing: Vec<String> = breakdown
            .missing_components
            .iter()
            .map(ToString::to_string)
            .collect();
        justification.push_str(&format!(
            " Componentes sin puntaje: {}.",
            missing.join(", ")
        ));
    }
    let contributing_factors = breakdown
        .components
        .iter()
        .map(|c| {
            format!(
                "{} ({:.0}%): {:.2} [{:?}]",
                c.kind,
                c.weight * 100.0,
                c.score,
                c.status
            )
        })
        .collect();
    Narrative {
        credit_recommendation: credit_recommendation.to_string(),
        justification,
        contributing_factors,
    }
}

fn consolidation_prompt(breakdown: &ScoreBreakdown, results: [&AnalysisResult; 3]) -> String {
    let mut sections = String::new();
    for (result, component) in results.iter().zip(&breakdown.components) {
        let status = match (result.success, result.outcome) {
            (false, _) => "NO DISPONIBLE",
            (true, AnalysisOutcome::Complete) => "COMPLETO",
            (true, AnalysisOutcome::Degraded) => "PARCIAL",
            (true, _) => "SIN DATOS",
        };
        sections.push_str(&format!(
            "\n### Análisis {} ({status}, subpuntaje {:.2})\n{}\n",
            result.kind,
            component.score,
            result.findings.describe()
        ));
    }
    format!(
        r#"Consolida los siguientes análisis de una PYME en una recomendación de crédito.
{sections}
Puntaje compuesto calculado: {score}/1000. Nivel de riesgo: {risk}. Confianza: {confidence:.2}.

No modifiques el puntaje ni el nivel de riesgo. Responde solo con JSON con las claves "credit_recommendation" (texto breve), "justification" (un párrafo) y "contributing_factors" (lista ordenada de los factores más influyentes)."#,
        score = breakdown.final_score,
        risk = breakdown.risk_level,
        confidence = breakdown.confidence,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{AnalysisFindings, FinancialFindings},
        audit::AuditTrail,
        error::ProviderError,
        gateway::content_filter::ContentFilter,
        settings::{GatewayConfig, RetryPolicy},
        test_support::ScriptedProvider,
    };
    use proptest::prelude::*;

    fn scored(kind: AnalyzerKind, financial_score: Option<f64>) -> AnalysisResult {
        let mut result = AnalysisResult::no_data(kind);
        result.outcome = AnalysisOutcome::Complete;
        result.caveat = None;
        if let Some(value) = financial_score {
            result.findings = match kind {
                AnalyzerKind::Financial => AnalysisFindings::Financial(FinancialFindings {
                    puntaje_financiero: Some(value),
                    ..FinancialFindings::placeholder("x", "y".into())
                }),
                AnalyzerKind::Reputational => {
                    serde_json::from_value(serde_json::json!({
                        "kind": "reputational",
                        "sentimiento_general": "Positivo",
                        "puntaje_sentimiento": value * 2.0 - 1.0,
                        "temas_positivos": [],
                        "temas_negativos": [],
                        "resumen_ejecutivo": "y"
                    }))
                    .unwrap()
                }
                AnalyzerKind::Behavioral => serde_json::from_value(serde_json::json!({
                    "kind": "behavioral",
                    "patron_de_pago": "Puntual",
                    "fiabilidad_referencias": "Alta",
                    "riesgo_comportamental": "Bajo",
                    "resumen_ejecutivo": "y"
                }))
                .unwrap(),
            };
        }
        result
    }

    fn all_success() -> (AnalysisResult, AnalysisResult, AnalysisResult) {
        (
            scored(AnalyzerKind::Financial, Some(0.8)),
            scored(AnalyzerKind::Reputational, Some(0.75)),
            scored(AnalyzerKind::Behavioral, Some(0.85)),
        )
    }

    #[test]
    fn weighted_composite_on_thousand_scale() {
        let (f, r, b) = all_success();
        let breakdown = score(&f, &r, &b, &ConsolidationConfig::default());
        // 0.6*0.8 + 0.2*0.75 + 0.2*0.85 = 0.80
        assert_eq!(breakdown.final_score, 800);
        assert_eq!(breakdown.risk_level, CreditRiskTier::Bajo);
        assert_eq!(breakdown.confidence, 0.95);
        assert!(breakdown.missing_components.is_empty());
    }

    #[test]
    fn failed_component_lowers_confidence() {
        let (f, _, b) = all_success();
        let failed = AnalysisResult::failed(AnalyzerKind::Reputational, "UpstreamFailure");
        let breakdown = score(&f, &failed, &b, &ConsolidationConfig::default());
        assert!(breakdown.confidence < 0.95);
        assert_eq!(breakdown.confidence, 0.82);
        assert_eq!(breakdown.missing_components, vec![AnalyzerKind::Reputational]);
        assert_eq!(breakdown.components[1].status, ComponentStatus::Missing);
        assert_eq!(breakdown.components[1].score, NEUTRAL_SCORE);
    }

    #[test]
    fn tiers_follow_thresholds() {
        let thresholds = RiskThresholds::default();
        assert_eq!(
            CreditRiskTier::from_score_with_thresholds(700.0, &thresholds),
            CreditRiskTier::Bajo
        );
        assert_eq!(
            CreditRiskTier::from_score_with_thresholds(699.0, &thresholds),
            CreditRiskTier::Medio
        );
        assert_eq!(
            CreditRiskTier::from_score_with_thresholds(399.0, &thresholds),
            CreditRiskTier::Alto
        );
    }

    #[test]
    fn validates_configuration() {
        let mut config = ConsolidationConfig::default();
        config.validate().unwrap();
        config.weights.financial = 0.7;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWeights { .. })
        ));
        let mut config = ConsolidationConfig::default();
        config.thresholds.medio_min = 800.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }

    fn arb_result(kind: AnalyzerKind) -> impl Strategy<Value = AnalysisResult> {
        prop_oneof![
            (0.0f64..=1.0).prop_map(move |s| scored(kind, Some(s))),
            Just(AnalysisResult::no_data(kind)),
            Just(AnalysisResult::failed(kind, "boom")),
        ]
    }

    proptest! {
        #[test]
        fn scoring_is_pure_and_bounded(
            f in arb_result(AnalyzerKind::Financial),
            r in arb_result(AnalyzerKind::Reputational),
            b in arb_result(AnalyzerKind::Behavioral),
        ) {
            let config = ConsolidationConfig::default();
            let first = score(&f, &r, &b, &config);
            let second = score(&f, &r, &b, &config);
            prop_assert_eq!(&first, &second);
            prop_assert!(first.final_score <= 1000);
            prop_assert!((0.30..=0.95).contains(&first.confidence));
        }
    }

    fn engine(provider: Arc<ScriptedProvider>) -> ConsolidationEngine {
        let gateway = Arc::new(CompletionGateway::new(
            provider,
            GatewayConfig {
                retry: RetryPolicy::none(),
                ..GatewayConfig::default()
            },
            ContentFilter::default(),
            Arc::new(AuditTrail::new()),
        ));
        ConsolidationEngine::new(gateway, ConsolidationConfig::default())
    }

    #[tokio::test]
    async fn uses_model_narrative_when_available() {
        let provider = Arc::new(ScriptedProvider::replying(
            r#"{"credit_recommendation": "Aprobar", "justification": "Solidez financiera.", "contributing_factors": ["liquidez", "pagos puntuales"]}"#,
        ));
        let engine = engine(provider.clone());
        let (f, r, b) = all_success();
        let report = engine.consolidate(&f, &r, &b, None).await;
        assert_eq!(report.narrative_source, NarrativeSource::Model);
        assert_eq!(report.credit_recommendation, "Aprobar");
        assert_eq!(report.contributing_factors.len(), 2);
        assert_eq!(report.final_score, 800);
        assert_eq!(provider.requests()[0].model_tier, ModelTier::Capable);
    }

    #[tokio::test]
    async fn falls_back_to_local_narrative() {
        let provider = Arc::new(ScriptedProvider::replying("ok").failing_first(
            1,
            ProviderError::Status {
                status: 500,
                body: String::new(),
            },
        ));
        let engine = engine(provider);
        let (f, r, b) = all_success();
        let report = engine.consolidate(&f, &r, &b, None).await;
        assert_eq!(report.narrative_source, NarrativeSource::Local);
        assert_eq!(report.tokens_used, 0);
        assert!(report.justification.contains("800/1000"));
        assert_eq!(report.contributing_factors.len(), 3);
    }

    #[test]
    fn prompt_passes_inbound_filter() {
        let (f, r, b) = all_success();
        let breakdown = score(&f, &r, &b, &ConsolidationConfig::default());
        let prompt = consolidation_prompt(&breakdown, [&f, &r, &b]);
        assert!(ContentFilter::default().check_inbound(&prompt).is_ok());
    }
}
