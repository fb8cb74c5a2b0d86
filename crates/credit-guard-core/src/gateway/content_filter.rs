//! Deny-list and PII matching shared by the inbound gateway check and the
//! outbound masking pass.

use std::{collections::HashSet, fs, path::Path};

use aho_corasick::AhoCorasick;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::error::GatewayError;

const DEFAULT_BLOCKED_KEYWORDS: &[&str] = &[
    "password",
    "ssn",
    "credit_card",
    "bank_account",
    "personal_id",
    "cedula",
    "ruc_personal",
];

/// A PII detector and the fixed token that replaces its matches on output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiPattern {
    pub id: String,
    pub description: String,
    pub pattern: String,
    pub mask: String,
}

impl PiiPattern {
    fn new(id: &str, description: &str, pattern: &str, mask: &str) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            pattern: pattern.into(),
            mask: mask.into(),
        }
    }
}

/// Filter configuration: blocked keywords, PII patterns and feature toggles.
///
/// Pattern order matters for masking: longer digit runs are listed first so a
/// 13-digit tax id is never half-masked as a national id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterPolicy {
    pub enable_content_filtering: bool,
    pub enable_pii_detection: bool,
    pub blocked_keywords: Vec<String>,
    pub pii_patterns: Vec<PiiPattern>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            enable_content_filtering: true,
            enable_pii_detection: true,
            blocked_keywords: DEFAULT_BLOCKED_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            pii_patterns: vec![
                PiiPattern::new(
                    "TAX_ID",
                    "13-digit tax identification number",
                    r"\b\d{13}\b",
                    "[TAXID_MASKED]",
                ),
                PiiPattern::new(
                    "NATIONAL_ID",
                    "10-digit national identity number",
                    r"\b\d{10}\b",
                    "[ID_MASKED]",
                ),
                PiiPattern::new(
                    "PHONE",
                    "9 to 10 digit phone number",
                    r"\b\d{9,10}\b",
                    "[PHONE_MASKED]",
                ),
                PiiPattern::new(
                    "EMAIL",
                    "Email address",
                    r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
                    "[EMAIL_MASKED]",
                ),
            ],
        }
    }
}

/// Errors emitted while validating a filter policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("blocked keyword must not be blank")]
    EmptyKeyword,
    #[error("duplicate blocked keyword `{0}`")]
    DuplicateKeyword(String),
    #[error("duplicate pattern id `{0}`")]
    DuplicatePattern(String),
    #[error("pattern `{id}` must define a non-empty regex and mask")]
    IncompletePattern { id: String },
    #[error("pattern `{id}` is not a valid regex: {message}")]
    InvalidRegex { id: String, message: String },
    #[error("mask for pattern `{id}` must not itself match a PII pattern")]
    SelfMatchingMask { id: String },
    #[error("failed to build keyword automaton: {0}")]
    Automaton(String),
}

impl FilterPolicy {
    /// Load a policy pack from `keywords.txt` and `patterns.json` under `dir`.
    ///
    /// A missing file keeps the built-in defaults for that half of the policy.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut policy = Self::default();

        let keywords_path = dir.join("keywords.txt");
        if keywords_path.exists() {
            let content = fs::read_to_string(&keywords_path).with_context(|| {
                format!("failed to read keyword file at {}", keywords_path.display())
            })?;
            policy.blocked_keywords = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect();
        }

        let patterns_path = dir.join("patterns.json");
        if patterns_path.exists() {
            let raw = fs::read_to_string(&patterns_path).with_context(|| {
                format!("failed to read pattern file at {}", patterns_path.display())
            })?;
            policy.pii_patterns = serde_json::from_str(&raw).with_context(|| {
                format!(
                    "invalid JSON structure in pattern file at {}",
                    patterns_path.display()
                )
            })?;
        }

        policy
            .validate()
            .with_context(|| format!("invalid filter policy in {}", dir.display()))?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        ContentFilter::new(self).map(|_| ())
    }
}

/// One masked span in an outbound text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redaction {
    pub pattern_id: String,
    pub mask: String,
    pub original_len: usize,
}

/// Result of masking a text; `text` keeps every non-PII character in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskOutcome {
    pub text: String,
    pub redactions: Vec<Redaction>,
}

impl MaskOutcome {
    pub fn altered(&self) -> bool {
        !self.redactions.is_empty()
    }
}

/// Compiled form of a [`FilterPolicy`]. Pure over its input text.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    content_filtering: bool,
    pii_detection: bool,
    keywords: Vec<String>,
    automaton: Option<AhoCorasick>,
    patterns: Vec<(Regex, PiiPattern)>,
}

impl ContentFilter {
    pub fn new(policy: &FilterPolicy) -> Result<Self, PolicyError> {
        let mut seen = HashSet::new();
        let mut keywords = Vec::with_capacity(policy.blocked_keywords.len());
        for keyword in &policy.blocked_keywords {
            let normalized = keyword.trim().to_lowercase();
            if normalized.is_empty() {
                return Err(PolicyError::EmptyKeyword);
            }
            if !seen.insert(normalized.clone()) {
                return Err(PolicyError::DuplicateKeyword(normalized));
            }
            keywords.push(normalized);
        }
        let automaton = if keywords.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::new(&keywords)
                    .map_err(|err| PolicyError::Automaton(err.to_string()))?,
            )
        };

        let mut ids = HashSet::new();
        let mut patterns = Vec::with_capacity(policy.pii_patterns.len());
        for pattern in &policy.pii_patterns {
            if !ids.insert(pattern.id.clone()) {
                return Err(PolicyError::DuplicatePattern(pattern.id.clone()));
            }
            if pattern.pattern.is_empty() || pattern.mask.trim().is_empty() {
                return Err(PolicyError::IncompletePattern {
                    id: pattern.id.clone(),
                });
            }
            let regex = Regex::new(&pattern.pattern).map_err(|err| PolicyError::InvalidRegex {
                id: pattern.id.clone(),
                message: err.to_string(),
            })?;
            patterns.push((regex, pattern.clone()));
        }
        for (_, pattern) in &patterns {
            if patterns.iter().any(|(regex, _)| regex.is_match(&pattern.mask)) {
                return Err(PolicyError::SelfMatchingMask {
                    id: pattern.id.clone(),
                });
            }
        }

        Ok(Self {
            content_filtering: policy.enable_content_filtering,
            pii_detection: policy.enable_pii_detection,
            keywords,
            automaton,
            patterns,
        })
    }

    pub fn content_filtering_enabled(&self) -> bool {
        self.content_filtering
    }

    pub fn pii_detection_enabled(&self) -> bool {
        self.pii_detection
    }

    /// First deny-listed keyword contained in `text`, case-insensitively.
    pub fn find_blocked_keyword(&self, text: &str) -> Option<&str> {
        let automaton = self.automaton.as_ref()?;
        let haystack = text.to_lowercase();
        automaton
            .find(&haystack)
            .and_then(|mat| self.keywords.get(mat.pattern().as_usize()))
            .map(String::as_str)
    }

    /// First PII pattern that matches anywhere in `text`.
    pub fn detect_pii(&self, text: &str) -> Option<&PiiPattern> {
        self.patterns
            .iter()
            .find(|(regex, _)| regex.is_match(text))
            .map(|(_, pattern)| pattern)
    }

    /// Inbound check applied to every prompt before it leaves the process.
    pub fn check_inbound(&self, text: &str) -> Result<(), GatewayError> {
        if self.content_filtering {
            if let Some(keyword) = self.find_blocked_keyword(text) {
                return Err(GatewayError::BlockedContent {
                    keyword: keyword.to_string(),
                });
            }
        }
        if self.pii_detection {
            if let Some(pattern) = self.detect_pii(text) {
                return Err(GatewayError::PiiDetected {
                    pattern_id: pattern.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Replace every PII match with its pattern's mask token.
    pub fn mask(&self, text: &str) -> MaskOutcome {
        let mut current = text.to_string();
        let mut redactions = Vec::new();
        for (regex, pattern) in &self.patterns {
            if !regex.is_match(&current) {
                continue;
            }
            for mat in regex.find_iter(&current) {
                redactions.push(Redaction {
                    pattern_id: pattern.id.clone(),
                    mask: pattern.mask.clone(),
                    original_len: mat.as_str().len(),
                });
            }
            trace!(pattern_id = %pattern.id, "masking PII matches");
            current = regex
                .replace_all(&current, regex::NoExpand(&pattern.mask))
                .into_owned();
        }
        MaskOutcome {
            text: current,
            redactions,
        }
    }

    pub(crate) fn patterns(&self) -> impl Iterator<Item = &(Regex, PiiPattern)> {
        self.patterns.iter()
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new(&FilterPolicy::default()).unwrap_or_else(|_| Self {
            content_filtering: true,
            pii_detection: true,
            keywords: Vec::new(),
            automaton: None,
            patterns: Vec::new(),
        })
    }
}
