//! The three independent business analyzers and their result envelope.

mod behavioral;
mod financial;
mod reputational;

use std::{fmt, sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditEvent, AuditEventType},
    gateway::{CompletionGateway, CompletionRequest, ModelTier},
    structured::ParseFailure,
};

pub use behavioral::BehavioralFindings;
pub use financial::FinancialFindings;
pub use reputational::ReputationalFindings;

const MAX_TOKENS: u32 = 1_500;
const TEMPERATURE: f32 = 0.1;
const DEGRADED_SUMMARY_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    Financial,
    Reputational,
    Behavioral,
}

impl AnalyzerKind {
    pub const ALL: [AnalyzerKind; 3] = [
        AnalyzerKind::Financial,
        AnalyzerKind::Reputational,
        AnalyzerKind::Behavioral,
    ];

    pub fn agent_id(self) -> &'static str {
        match self {
            Self::Financial => "financial_analyzer",
            Self::Reputational => "reputational_analyzer",
            Self::Behavioral => "behavioral_analyzer",
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            Self::Financial => financial::SYSTEM_PROMPT,
            Self::Reputational => reputational::SYSTEM_PROMPT,
            Self::Behavioral => behavioral::SYSTEM_PROMPT,
        }
    }

    fn prompt(self, text: &str) -> String {
        match self {
            Self::Financial => financial::prompt(text),
            Self::Reputational => reputational::prompt(text),
            Self::Behavioral => behavioral::prompt(text),
        }
    }

    fn parse(self, raw: &str) -> Result<AnalysisFindings, ParseFailure> {
        match self {
            Self::Financial => financial::parse(raw).map(AnalysisFindings::Financial),
            Self::Reputational => reputational::parse(raw).map(AnalysisFindings::Reputational),
            Self::Behavioral => behavioral::parse(raw).map(AnalysisFindings::Behavioral),
        }
    }

    /// Findings with every label set to `label` and the given summary.
    fn placeholder(self, label: &str, summary: String) -> AnalysisFindings {
        match self {
            Self::Financial => {
                AnalysisFindings::Financial(FinancialFindings::placeholder(label, summary))
            }
            Self::Reputational => {
                AnalysisFindings::Reputational(ReputationalFindings::placeholder(label, summary))
            }
            Self::Behavioral => {
                AnalysisFindings::Behavioral(BehavioralFindings::placeholder(label, summary))
            }
        }
    }
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Financial => "financial",
            Self::Reputational => "reputational",
            Self::Behavioral => "behavioral",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisFindings {
    Financial(FinancialFindings),
    Reputational(ReputationalFindings),
    Behavioral(BehavioralFindings),
}

impl AnalysisFindings {
    pub fn executive_summary(&self) -> &str {
        match self {
            Self::Financial(f) => &f.resumen_ejecutivo,
            Self::Reputational(r) => &r.resumen_ejecutivo,
            Self::Behavioral(b) => &b.resumen_ejecutivo,
        }
    }

    /// Plain-text rendering used as context for the consolidation call.
    pub fn describe(&self) -> String {
        match self {
            Self::Financial(f) => format!(
                "Solvencia: {}\nLiquidez: {}\nRentabilidad: {}\nTendencia de ventas: {}\nResumen: {}",
                f.solvencia, f.liquidez, f.rentabilidad, f.tendencia_ventas, f.resumen_ejecutivo
            ),
            Self::Reputational(r) => format!(
                "Sentimiento general: {}\nTemas positivos: {}\nTemas negativos: {}\nResumen: {}",
                r.sentimiento_general,
                r.temas_positivos.join(", "),
                r.temas_negativos.join(", "),
                r.resumen_ejecutivo
            ),
            Self::Behavioral(b) => format!(
                "Patrón de pago: {}\nFiabilidad de referencias: {}\nRiesgo comportamental: {}\nResumen: {}",
                b.patron_de_pago, b.fiabilidad_referencias, b.riesgo_comportamental, b.resumen_ejecutivo
            ),
        }
    }

    /// Every free-text value, for the outbound sanitizer.
    pub fn text_fields_mut(&mut self) -> Vec<(&'static str, &mut String)> {
        match self {
            Self::Financial(f) => f.text_fields_mut(),
            Self::Reputational(r) => r.text_fields_mut(),
            Self::Behavioral(b) => b.text_fields_mut(),
        }
    }

    fn component_score(&self) -> Option<f64> {
        match self {
            Self::Financial(f) => f.component_score(),
            Self::Reputational(r) => r.component_score(),
            Self::Behavioral(b) => b.component_score(),
        }
    }
}

/// How an analyzer arrived at its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Complete,
    /// The response could not be parsed; the summary holds truncated raw text.
    Degraded,
    NoData,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub kind: AnalyzerKind,
    pub success: bool,
    pub outcome: AnalysisOutcome,
    pub tokens_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
    pub findings: AnalysisFindings,
}

impl AnalysisResult {
    pub fn no_data(kind: AnalyzerKind) -> Self {
        Self {
            kind,
            success: true,
            outcome: AnalysisOutcome::NoData,
            tokens_used: 0,
            error: None,
            caveat: Some("no input data supplied".into()),
            findings: kind.placeholder(
                "Sin datos",
                "No se proporcionaron datos para este análisis.".into(),
            ),
        }
    }

    pub fn failed(kind: AnalyzerKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            success: false,
            outcome: AnalysisOutcome::Failed,
            tokens_used: 0,
            error: Some(error.into()),
            caveat: None,
            findings: kind.placeholder(
                "No disponible",
                "El análisis no pudo completarse.".into(),
            ),
        }
    }

    fn degraded(kind: AnalyzerKind, raw: &str, tokens_used: u32, reason: &str) -> Self {
        Self {
            kind,
            success: true,
            outcome: AnalysisOutcome::Degraded,
            tokens_used,
            error: None,
            caveat: Some(format!("unstructured response, summary truncated ({reason})")),
            findings: kind.placeholder("No determinado", truncate(raw, DEGRADED_SUMMARY_CHARS)),
        }
    }

    /// Normalized 0–1 health signal; `None` unless the analysis completed
    /// and the model supplied a usable score.
    pub fn component_score(&self) -> Option<f64> {
        if self.outcome != AnalysisOutcome::Complete {
            return None;
        }
        self.findings.component_score()
    }
}

/// One analyzer issuing a single capable-tier completion per call.
#[derive(Clone)]
pub struct BusinessAnalyzer {
    kind: AnalyzerKind,
    gateway: Arc<CompletionGateway>,
}

impl BusinessAnalyzer {
    pub fn new(kind: AnalyzerKind, gateway: Arc<CompletionGateway>) -> Self {
        Self { kind, gateway }
    }

    pub fn kind(&self) -> AnalyzerKind {
        self.kind
    }

    /// Never returns an error: failures are carried in the result.
    #[instrument(skip(self, text), fields(kind = %self.kind, text_len = text.len()))]
    pub async fn analyze(&self, text: &str, evaluation_id: Option<Uuid>) -> AnalysisResult {
        let started = Instant::now();
        let result = if text.trim().is_empty() {
            AnalysisResult::no_data(self.kind)
        } else {
            self.run(text, evaluation_id).await
        };

        let mut event = AuditEvent::new(AuditEventType::BusinessAnalysis, self.kind.agent_id())
            .with_evaluation(evaluation_id)
            .with_caller(self.gateway.caller_id())
            .with_outcome(result.success)
            .with_usage(
                result.tokens_used,
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            );
        event = match &result.error {
            Some(error) => event.with_detail(error.clone()),
            None => event.with_detail(format!("outcome={:?}", result.outcome)),
        };
        self.gateway.audit().record(event);
        result
    }

    async fn run(&self, text: &str, evaluation_id: Option<Uuid>) -> AnalysisResult {
        let request = CompletionRequest::new(
            self.gateway.caller_id(),
            self.kind.agent_id(),
            self.kind.prompt(text.trim()),
        )
        .with_max_tokens(MAX_TOKENS)
        .with_temperature(TEMPERATURE)
        .with_evaluation(evaluation_id);

        let response = match self
            .gateway
            .complete(&request, self.kind.system_prompt(), ModelTier::Capable)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(kind = %self.kind, error_kind = err.kind(), "analysis call failed");
                return AnalysisResult::failed(self.kind, format!("{}: {err}", err.kind()));
            }
        };

        match self.kind.parse(&response.response_text) {
            Ok(findings) => AnalysisResult {
                kind: self.kind,
                success: true,
                outcome: AnalysisOutcome::Complete,
                tokens_used: response.tokens_used,
                error: None,
                caveat: response
                    .filtered_content
                    .then(|| "personal data masked in model output".to_string()),
                findings,
            },
            Err(failure) => {
                warn!(kind = %self.kind, reason = %failure.reason, "degrading unparseable analysis");
                AnalysisResult::degraded(
                    self.kind,
                    &response.response_text,
                    response.tokens_used,
                    &failure.reason,
                )
            }
        }
    }
}

pub(crate) fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "…"
}

/// Accept numbers or numeric strings such as `"0.7"` or `"70%"`.
pub(crate) fn coerce_number(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            match trimmed.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<f64>().ok().map(|v| v / 100.0),
                None => trimmed.parse::<f64>().ok(),
            }
        }
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

/// Accept either a JSON array of strings or a single delimited string.
pub(crate) fn coerce_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        serde_json::Value::String(s) => s
            .split([',', ';', '\n'])
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn coerce_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Look up `key` in a parsed object, returning `Null` when absent.
pub(crate) fn field<'a>(object: &'a serde_json::Value, key: &str) -> &'a serde_json::Value {
    object.get(key).unwrap_or(&serde_json::Value::Null)
}

/// Parse and require at least one of `keys` to carry content.
pub(crate) fn parse_object(raw: &str, keys: &[&str]) -> Result<serde_json::Value, ParseFailure> {
    let value: serde_json::Value = crate::structured::parse_structured(raw)?;
    if !value.is_object() {
        return Err(ParseFailure {
            reason: "response was not a JSON object".into(),
        });
    }
    let has_content = keys.iter().any(|key| match field(&value, key) {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        _ => true,
    });
    if !has_content {
        return Err(ParseFailure {
            reason: "none of the expected fields were present".into(),
        });
    }
    Ok(value)
}
