//! Sequences validation, analysis, sanitization and consolidation for one
//! evaluation and always returns a structured result.

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    analysis::{AnalysisResult, AnalyzerKind, BusinessAnalyzer},
    audit::{AuditEvent, AuditEventType, AuditTrail},
    consolidation::{ConsolidatedReport, ConsolidationEngine, CreditRiskTier},
    error::PipelineError,
    gateway::{
        content_filter::ContentFilter, router::ModelRouter, CompletionGateway,
        CompletionProvider,
    },
    record::CompanyRecord,
    sanitizer::{OutputSanitizer, SanitizationSummary},
    settings::PipelineConfig,
    supervisor::SecuritySupervisor,
    validation::{panic_message, CompanyValidationResult, InputValidationStage},
};

const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";
const SANITIZER_AGENT_ID: &str = "output_sanitizer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationState {
    Init,
    Validating,
    Analyzing,
    Sanitizing,
    Consolidating,
    Done,
    Failed,
}

impl EvaluationState {
    pub fn stage_name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Validating => "validating",
            Self::Analyzing => "analyzing",
            Self::Sanitizing => "sanitizing",
            Self::Consolidating => "consolidating",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// The three analyzer outputs of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSet {
    pub financial: AnalysisResult,
    pub reputational: AnalysisResult,
    pub behavioral: AnalysisResult,
}

impl AnalysisSet {
    pub fn iter(&self) -> impl Iterator<Item = &AnalysisResult> {
        [&self.financial, &self.reputational, &self.behavioral].into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AnalysisResult> {
        [
            &mut self.financial,
            &mut self.reputational,
            &mut self.behavioral,
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerSanitization {
    pub kind: AnalyzerKind,
    #[serde(flatten)]
    pub summary: SanitizationSummary,
}

/// Result envelope for one evaluation. Partial on failure, never discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub evaluation_id: Uuid,
    pub company_id: String,
    pub company_name: String,
    pub state: EvaluationState,
    pub success: bool,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<CompanyValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyses: Option<AnalysisSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sanitization: Vec<AnalyzerSanitization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidated_report: Option<ConsolidatedReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<CreditRiskTier>,
    pub total_tokens: u32,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl EvaluationResult {
    fn new(evaluation_id: Uuid, record: &CompanyRecord) -> Self {
        Self {
            evaluation_id,
            company_id: record.company_id.clone(),
            company_name: record.company_name.clone(),
            state: EvaluationState::Init,
            success: false,
            errors: Vec::new(),
            validation: None,
            analyses: None,
            sanitization: Vec::new(),
            consolidated_report: None,
            final_score: None,
            risk_level: None,
            total_tokens: 0,
            processing_time_ms: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Owns every pipeline stage plus the shared rate window and audit trail.
pub struct Orchestrator {
    gateway: Arc<CompletionGateway>,
    validation: InputValidationStage,
    financial: BusinessAnalyzer,
    reputational: BusinessAnalyzer,
    behavioral: BusinessAnalyzer,
    sanitizer: OutputSanitizer,
    consolidation: ConsolidationEngine,
    router: ModelRouter,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        config: &PipelineConfig,
        audit: Arc<AuditTrail>,
    ) -> Result<Self> {
        config.validate()?;
        let filter = ContentFilter::new(&config.filter).context("invalid filter policy")?;
        let gateway = Arc::new(CompletionGateway::new(
            provider,
            config.gateway.clone(),
            filter.clone(),
            audit,
        ));
        let analyzer = |kind| BusinessAnalyzer::new(kind, Arc::clone(&gateway));
        Ok(Self {
            validation: InputValidationStage::new(Arc::clone(&gateway)),
            financial: analyzer(AnalyzerKind::Financial),
            reputational: analyzer(AnalyzerKind::Reputational),
            behavioral: analyzer(AnalyzerKind::Behavioral),
            sanitizer: OutputSanitizer::new(filter),
            consolidation: ConsolidationEngine::new(
                Arc::clone(&gateway),
                config.consolidation.clone(),
            ),
            router: ModelRouter::new(
                config.routing.clone(),
                config.gateway.fast_deployment.clone(),
                config.gateway.capable_deployment.clone(),
            ),
            timeout: config.evaluation_timeout(),
            gateway,
        })
    }

    pub fn gateway(&self) -> &Arc<CompletionGateway> {
        &self.gateway
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        self.gateway.audit()
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn supervisor(&self) -> SecuritySupervisor {
        SecuritySupervisor::new(Arc::clone(&self.gateway))
    }

    pub async fn evaluate(&self, record: &CompanyRecord) -> EvaluationResult {
        self.evaluate_with_timeout(record, self.timeout).await
    }

    /// Blocking entry point; must not be called from inside a Tokio runtime.
    pub fn evaluate_blocking(&self, record: &CompanyRecord) -> Result<EvaluationResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start evaluation runtime")?;
        Ok(runtime.block_on(self.evaluate(record)))
    }

    #[instrument(skip_all, fields(company_id = %record.company_id, evaluation_id = tracing::field::Empty))]
    pub async fn evaluate_with_timeout(
        &self,
        record: &CompanyRecord,
        timeout: Duration,
    ) -> EvaluationResult {
        let started = Instant::now();
        let deadline = started + timeout;
        let evaluation_id = Uuid::new_v4();
        tracing::Span::current().record("evaluation_id", tracing::field::display(evaluation_id));
        info!("evaluation started");

        let mut result = EvaluationResult::new(evaluation_id, record);
        match self.run(record, &mut result, deadline).await {
            Ok(()) => {
                result.state = EvaluationState::Done;
                result.success = true;
            }
            Err(err) => {
                error!(stage = result.state.stage_name(), error = %err, "evaluation failed");
                result.state = EvaluationState::Failed;
                result.success = false;
                result.errors.push(err.to_string());
            }
        }

        let audit = self.gateway.audit();
        result.total_tokens = audit
            .events_for(evaluation_id)
            .iter()
            .filter(|event| event.event_type == AuditEventType::CompletionRequest)
            .map(|event| event.tokens_used)
            .sum();
        result.processing_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result.timestamp = Utc::now();

        let event_type = if result.success {
            AuditEventType::EvaluationCompleted
        } else {
            AuditEventType::EvaluationFailed
        };
        audit.record(
            AuditEvent::new(event_type, ORCHESTRATOR_AGENT_ID)
                .with_evaluation(Some(evaluation_id))
                .with_caller(self.gateway.caller_id())
                .with_outcome(result.success)
                .with_usage(result.total_tokens, result.processing_time_ms)
                .with_detail(match result.final_score {
                    Some(score) => format!("state={:?} score={score}", result.state),
                    None => format!("state={:?} errors={}", result.state, result.errors.join("; ")),
                }),
        );
        info!(
            success = result.success,
            final_score = result.final_score,
            elapsed_ms = result.processing_time_ms,
            "evaluation finished"
        );
        result
    }

    async fn run(
        &self,
        record: &CompanyRecord,
        result: &mut EvaluationResult,
        deadline: Instant,
    ) -> Result<(), PipelineError> {
        let evaluation_id = Some(result.evaluation_id);

        result.state = EvaluationState::Validating;
        let validation = stage(
            result.state,
            deadline,
            self.validation.validate_company(record, evaluation_id),
        )
        .await?;
        let halt = validation.every_field_unsafe();
        if !validation.all_safe {
            warn!(
                risk = %validation.overall_risk_level,
                blocked = validation.blocked_fields.len(),
                "input validation flagged fields"
            );
        }
        result.validation = Some(validation);
        if halt {
            return Err(PipelineError::ValidationAllUnsafe);
        }

        result.state = EvaluationState::Analyzing;
        let behavioral_text = record.behavioral_text();
        let (financial, reputational, behavioral) = stage(result.state, deadline, async {
            futures::join!(
                analyze_guarded(&self.financial, &record.financial_statements, evaluation_id),
                analyze_guarded(&self.reputational, &record.social_media_data, evaluation_id),
                analyze_guarded(&self.behavioral, &behavioral_text, evaluation_id),
            )
        })
        .await?;
        let analyses = result.analyses.insert(AnalysisSet {
            financial,
            reputational,
            behavioral,
        });
        for analysis in analyses.iter() {
            if let Some(error) = &analysis.error {
                result.errors.push(format!("{}: {error}", analysis.kind));
            }
        }

        result.state = EvaluationState::Sanitizing;
        let sanitizer = &self.sanitizer;
        let sanitization = stage(result.state, deadline, async {
            analyses
                .iter_mut()
                .map(|analysis| AnalyzerSanitization {
                    kind: analysis.kind,
                    summary: sanitizer.sanitize_result(analysis),
                })
                .collect::<Vec<_>>()
        })
        .await?;
        let changed: usize = sanitization
            .iter()
            .map(|s| s.summary.fields_changed.len())
            .sum();
        self.gateway.audit().record(
            AuditEvent::new(AuditEventType::OutputSanitization, SANITIZER_AGENT_ID)
                .with_evaluation(evaluation_id)
                .with_caller(self.gateway.caller_id())
                .with_detail(format!("fields_changed={changed}")),
        );
        debug!(fields_changed = changed, "analysis output sanitized");
        result.sanitization = sanitization;

        result.state = EvaluationState::Consolidating;
        let mut report = stage(
            result.state,
            deadline,
            self.consolidation.consolidate(
                &analyses.financial,
                &analyses.reputational,
                &analyses.behavioral,
                evaluation_id,
            ),
        )
        .await?;
        for text in report.text_fields_mut() {
            let outcome = self.sanitizer.sanitize(text);
            if !outcome.is_safe {
                *text = outcome.sanitized_text;
            }
        }
        result.final_score = Some(report.final_score);
        result.risk_level = Some(report.risk_level);
        result.consolidated_report = Some(report);
        Ok(())
    }
}

/// Run one stage under the evaluation deadline, turning panics into faults.
async fn stage<F, T>(state: EvaluationState, deadline: Instant, work: F) -> Result<T, PipelineError>
where
    F: Future<Output = T>,
{
    let name = state.stage_name();
    debug!(stage = name, "entering stage");
    match timeout_at(deadline, AssertUnwindSafe(work).catch_unwind()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(panic)) => Err(PipelineError::StageFault {
            stage: name,
            message: panic_message(panic.as_ref()),
        }),
        Err(_) => Err(PipelineError::Timeout { stage: name }),
    }
}

async fn analyze_guarded(
    analyzer: &BusinessAnalyzer,
    text: &str,
    evaluation_id: Option<Uuid>,
) -> AnalysisResult {
    AssertUnwindSafe(analyzer.analyze(text, evaluation_id))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            AnalysisResult::failed(
                analyzer.kind(),
                format!("unexpected fault: {}", panic_message(panic.as_ref())),
            )
        })
}
