use std::fmt::Write;

use crate::{analysis::AnalysisResult, orchestrator::EvaluationResult};

/// Format styles supported by the evaluation renderer.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Produce an operator-facing string from an `EvaluationResult`.
pub fn render_evaluation(result: &EvaluationResult, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_human(result),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
    }
}

fn render_human(result: &EvaluationResult) -> anyhow::Result<String> {
    let mut out = render_header(result)?;
    if let Some(validation) = &result.validation {
        writeln!(
            out,
            "Input Validation: {} ({} of {} fields blocked)",
            validation.overall_risk_level,
            validation.blocked_fields.len(),
            validation.field_results.len()
        )?;
        for field in validation.field_results.iter().filter(|f| !f.is_safe) {
            writeln!(
                out,
                "  - {} blocked: {}",
                field.field_name,
                single_line(&field.reason)
            )?;
        }
    }

    if let Some(analyses) = &result.analyses {
        writeln!(out)?;
        writeln!(out, "Analyses:")?;
        for analysis in analyses.iter() {
            write_analysis(&mut out, analysis)?;
        }
    }

    if let Some(report) = &result.consolidated_report {
        writeln!(out)?;
        writeln!(
            out,
            "Confidence: {:.2} • Narrative: {:?}",
            report.confidence, report.narrative_source
        )?;
        if !report.missing_components.is_empty() {
            let missing: Vec<String> = report
                .missing_components
                .iter()
                .map(ToString::to_string)
                .collect();
            writeln!(out, "Missing components: {}", missing.join(", "))?;
        }
        writeln!(out, "Recommendation: {}", single_line(&report.credit_recommendation))?;
        writeln!(out, "Justification: {}", single_line(&report.justification))?;
        if !report.contributing_factors.is_empty() {
            writeln!(out, "Contributing factors:")?;
            for factor in &report.contributing_factors {
                writeln!(out, "  - {}", single_line(factor))?;
            }
        }
    }

    if !result.errors.is_empty() {
        writeln!(out)?;
        writeln!(out, "Errors:")?;
        for error in &result.errors {
            writeln!(out, "  - {}", single_line(error))?;
        }
    }

    writeln!(
        out,
        "\nTokens used: {} • Processing time: {} ms",
        result.total_tokens, result.processing_time_ms
    )?;
    Ok(out)
}

fn render_header(result: &EvaluationResult) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "Evaluation {} for {} ({})",
        result.evaluation_id, result.company_name, result.company_id
    )?;
    writeln!(out, "State: {:?}", result.state)?;
    match (result.final_score, result.risk_level) {
        (Some(score), Some(level)) => writeln!(out, "Credit Score: {score} / 1000 ({level})")?,
        _ => writeln!(out, "Credit Score: not available")?,
    }
    writeln!(out)?;
    Ok(out)
}

fn write_analysis(out: &mut String, analysis: &AnalysisResult) -> anyhow::Result<()> {
    let score = analysis
        .component_score()
        .map(|s| format!("{s:.2}"))
        .unwrap_or_else(|| "n/a".into());
    writeln!(
        out,
        "  - {:>12}: {:?}, sub-score {score}",
        analysis.kind.to_string(),
        analysis.outcome
    )?;
    let summary = analysis.findings.executive_summary();
    if !summary.trim().is_empty() {
        writeln!(out, "    \"{}\"", single_line(summary))?;
    }
    if let Some(error) = &analysis.error {
        writeln!(out, "    error: {}", single_line(error))?;
    }
    Ok(())
}

fn single_line(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}
