//! Outbound review of generated text before it leaves the pipeline.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{analysis::AnalysisResult, gateway::content_filter::ContentFilter};

pub const REDACTION_MARKER: &str = "[DATO REDACTADO]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizationCategory {
    Pii,
    Secret,
    Language,
}

struct SanitizerRule {
    id: &'static str,
    category: SanitizationCategory,
    regex: Regex,
}

static RULES: Lazy<Vec<SanitizerRule>> = Lazy::new(|| {
    [
        (
            "PRIVATE_KEY_BLOCK",
            SanitizationCategory::Secret,
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?(-----END [A-Z ]*PRIVATE KEY-----|$)",
        ),
        (
            "API_KEY",
            SanitizationCategory::Secret,
            r"\bsk-[A-Za-z0-9_-]{16,}",
        ),
        (
            "BEARER_TOKEN",
            SanitizationCategory::Secret,
            r"(?i)\bbearer\s+[A-Za-z0-9._~+/-]{16,}=*",
        ),
        (
            "CREDENTIAL_ASSIGNMENT",
            SanitizationCategory::Secret,
            r"(?i)\b(api[_-]?key|secret|token|contraseña|clave)\s*[:=]\s*[^\s,;]+",
        ),
        (
            "UNPROFESSIONAL_LANGUAGE",
            SanitizationCategory::Language,
            r"(?i)\b(idiota|idiotas|imb[eé]cil|imb[eé]ciles|est[uú]pid[oa]s?|mierda|pendej[oa]s?|stupid|idiots?)\b",
        ),
    ]
    .into_iter()
    .filter_map(|(id, category, pattern)| {
        Regex::new(pattern)
            .ok()
            .map(|regex| SanitizerRule { id, category, regex })
    })
    .collect()
});

/// What the sanitizer replaced, per rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationDetail {
    pub category: SanitizationCategory,
    pub rule_id: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedText {
    /// True when nothing needed replacing.
    pub is_safe: bool,
    pub sanitized_text: String,
    pub details: Vec<SanitizationDetail>,
}

/// Aggregate over every text field of one analyzer result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationSummary {
    pub is_safe: bool,
    pub fields_changed: Vec<String>,
    pub details: Vec<SanitizationDetail>,
}

/// Rule-based redaction of PII, secrets and unprofessional language.
///
/// Never rejects: every call yields usable text.
#[derive(Debug, Clone, Default)]
pub struct OutputSanitizer {
    filter: ContentFilter,
}

impl OutputSanitizer {
    pub fn new(filter: ContentFilter) -> Self {
        Self { filter }
    }

    pub fn sanitize(&self, text: &str) -> SanitizedText {
        let masked = self.filter.mask(text);
        let mut details: Vec<SanitizationDetail> = Vec::new();
        for redaction in &masked.redactions {
            match details
                .iter_mut()
                .find(|detail| detail.rule_id == redaction.pattern_id)
            {
                Some(detail) => detail.count += 1,
                None => details.push(SanitizationDetail {
                    category: SanitizationCategory::Pii,
                    rule_id: redaction.pattern_id.clone(),
                    count: 1,
                }),
            }
        }

        let mut current = masked.text;
        for rule in RULES.iter() {
            let count = rule.regex.find_iter(&current).count();
            if count == 0 {
                continue;
            }
            current = rule
                .regex
                .replace_all(&current, regex::NoExpand(REDACTION_MARKER))
                .into_owned();
            details.push(SanitizationDetail {
                category: rule.category,
                rule_id: rule.id.to_string(),
                count,
            });
        }

        if !details.is_empty() {
            debug!(rules = details.len(), "sanitized outbound text");
        }
        SanitizedText {
            is_safe: details.is_empty(),
            sanitized_text: current,
            details,
        }
    }

    /// Sanitize every text field of an analyzer result in place.
    pub fn sanitize_result(&self, result: &mut AnalysisResult) -> SanitizationSummary {
        let mut summary = SanitizationSummary {
            is_safe: true,
            ..SanitizationSummary::default()
        };
        for (name, value) in result.findings.text_fields_mut() {
            let outcome = self.sanitize(value);
            if outcome.is_safe {
                continue;
            }
            summary.is_safe = false;
            if !summary.fields_changed.iter().any(|f| f == name) {
                summary.fields_changed.push(name.to_string());
            }
            summary.details.extend(outcome.details);
            *value = outcome.sanitized_text;
        }
        if let Some(error) = &result.error {
            let outcome = self.sanitize(error);
            if !outcome.is_safe {
                summary.is_safe = false;
                summary.fields_changed.push("error".into());
                summary.details.extend(outcome.details);
                result.error = Some(outcome.sanitized_text);
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisOutcome, AnalyzerKind};
    use proptest::prelude::*;

    #[test]
    fn clean_text_is_safe() {
        let outcome = OutputSanitizer::default().sanitize("Solvencia alta, liquidez adecuada.");
        assert!(outcome.is_safe);
        assert!(outcome.details.is_empty());
        assert_eq!(outcome.sanitized_text, "Solvencia alta, liquidez adecuada.");
    }

    #[test]
    fn redacts_secrets_and_language() {
        let outcome = OutputSanitizer::default()
            .sanitize("Usar api_key=abc123xyz con Bearer abcdefghijklmnopqrstuvwxyz. Qué idiota.");
        assert!(!outcome.is_safe);
        assert_eq!(
            outcome.sanitized_text,
            "Usar [DATO REDACTADO] con [DATO REDACTADO]. Qué [DATO REDACTADO]."
        );
        let ids: Vec<_> = outcome.details.iter().map(|d| d.rule_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["BEARER_TOKEN", "CREDENTIAL_ASSIGNMENT", "UNPROFESSIONAL_LANGUAGE"]
        );
    }

    #[test]
    fn pii_keeps_typed_tokens() {
        let outcome = OutputSanitizer::default()
            .sanitize("Gerente: 0991234567 y 0987654321, correo gerente@andinas.ec");
        assert_eq!(
            outcome.sanitized_text,
            "Gerente: [ID_MASKED] y [ID_MASKED], correo [EMAIL_MASKED]"
        );
        assert_eq!(
            outcome.details[0],
            SanitizationDetail {
                category: SanitizationCategory::Pii,
                rule_id: "NATIONAL_ID".into(),
                count: 2,
            }
        );
    }

    #[test]
    fn sanitizes_analysis_fields_in_place() {
        let mut result = AnalysisResult::no_data(AnalyzerKind::Behavioral);
        result.outcome = AnalysisOutcome::Complete;
        if let crate::analysis::AnalysisFindings::Behavioral(findings) = &mut result.findings {
            findings.resumen_ejecutivo = "Contacto en sk-abcdefghijklmnopqrstu".into();
        }
        let summary = OutputSanitizer::default().sanitize_result(&mut result);
        assert!(!summary.is_safe);
        assert_eq!(summary.fields_changed, vec!["resumen_ejecutivo"]);
        assert_eq!(
            result.findings.executive_summary(),
            "Contacto en [DATO REDACTADO]"
        );
    }

    proptest! {
        #[test]
        fn every_pii_match_leaves_a_marker(
            words in proptest::collection::vec("[a-z]{2,10}", 0..6),
            ids in proptest::collection::vec("[1-9][0-9]{9}", 1..4),
        ) {
            let mut text = words.join(" ");
            for id in &ids {
                text.push(' ');
                text.push_str(id);
            }
            let outcome = OutputSanitizer::default().sanitize(&text);
            prop_assert_eq!(outcome.sanitized_text.matches("[ID_MASKED]").count(), ids.len());
            for word in &words {
                prop_assert!(outcome.sanitized_text.contains(word.as_str()));
            }
        }
    }
}
