use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Company data submitted for one credit evaluation.
///
/// Free-text fields default to empty; empty fields are skipped by validation
/// and short-circuit their analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub company_id: String,
    pub company_name: String,
    #[serde(default)]
    pub financial_statements: String,
    #[serde(default)]
    pub social_media_data: String,
    #[serde(default)]
    pub commercial_references: String,
    #[serde(default)]
    pub payment_history: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The caller-supplied text fields subject to input validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyField {
    CompanyName,
    FinancialStatements,
    SocialMediaData,
    CommercialReferences,
    PaymentHistory,
}

impl CompanyField {
    pub const ALL: [CompanyField; 5] = [
        CompanyField::CompanyName,
        CompanyField::FinancialStatements,
        CompanyField::SocialMediaData,
        CompanyField::CommercialReferences,
        CompanyField::PaymentHistory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompanyName => "company_name",
            Self::FinancialStatements => "financial_statements",
            Self::SocialMediaData => "social_media_data",
            Self::CommercialReferences => "commercial_references",
            Self::PaymentHistory => "payment_history",
        }
    }
}

impl fmt::Display for CompanyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CompanyRecord {
    pub fn field(&self, field: CompanyField) -> &str {
        match field {
            CompanyField::CompanyName => &self.company_name,
            CompanyField::FinancialStatements => &self.financial_statements,
            CompanyField::SocialMediaData => &self.social_media_data,
            CompanyField::CommercialReferences => &self.commercial_references,
            CompanyField::PaymentHistory => &self.payment_history,
        }
    }

    /// Fields carrying non-whitespace content, in declaration order.
    pub fn non_empty_fields(&self) -> impl Iterator<Item = (CompanyField, &str)> + '_ {
        CompanyField::ALL
            .into_iter()
            .map(move |field| (field, self.field(field)))
            .filter(|(_, value)| !value.trim().is_empty())
    }

    /// Combined input for the behavioral analyzer (references plus payment history).
    pub fn behavioral_text(&self) -> String {
        let mut sections = Vec::new();
        if !self.commercial_references.trim().is_empty() {
            sections.push(format!(
                "REFERENCIAS COMERCIALES:\n{}",
                self.commercial_references.trim()
            ));
        }
        if !self.payment_history.trim().is_empty() {
            sections.push(format!(
                "HISTORIAL DE PAGOS:\n{}",
                self.payment_history.trim()
            ));
        }
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_fields() {
        let record = CompanyRecord {
            company_id: "PYME_001".into(),
            company_name: "Innovaciones Andinas S.A.".into(),
            financial_statements: "Activos: $100,000".into(),
            social_media_data: "   ".into(),
            ..Default::default()
        };
        let fields: Vec<_> = record.non_empty_fields().map(|(f, _)| f).collect();
        assert_eq!(
            fields,
            vec![CompanyField::CompanyName, CompanyField::FinancialStatements]
        );
    }

    #[test]
    fn behavioral_text_is_empty_without_sources() {
        let record = CompanyRecord::default();
        assert!(record.behavioral_text().is_empty());

        let record = CompanyRecord {
            payment_history: "12/12 pagos a tiempo".into(),
            ..Default::default()
        };
        let text = record.behavioral_text();
        assert!(text.starts_with("HISTORIAL DE PAGOS"));
        assert!(!text.contains("REFERENCIAS"));
    }

    #[test]
    fn deserializes_with_missing_optional_fields() {
        let record: CompanyRecord = serde_json::from_str(
            r#"{"company_id":"X1","company_name":"Comercial Quito","financial_statements":"Ventas: $480,000"}"#,
        )
        .unwrap();
        assert_eq!(record.payment_history, "");
        assert!(record.metadata.is_empty());
    }
}
