//! Append-only record of every unit of work performed by the pipeline.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Mutex, RwLock},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CompletionRequest,
    InputValidation,
    BusinessAnalysis,
    OutputSanitization,
    Consolidation,
    EvaluationCompleted,
    EvaluationFailed,
    SecuritySupervision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub agent_id: String,
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<Uuid>,
    pub caller_id: String,
    pub success: bool,
    pub tokens_used: u32,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, agent_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            agent_id: agent_id.into(),
            request_id: Uuid::new_v4(),
            evaluation_id: None,
            caller_id: String::new(),
            success: true,
            tokens_used: 0,
            processing_time_ms: 0,
            detail: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_evaluation(mut self, evaluation_id: Option<Uuid>) -> Self {
        self.evaluation_id = evaluation_id;
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }

    pub fn with_outcome(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_usage(mut self, tokens_used: u32, processing_time_ms: u64) -> Self {
        self.tokens_used = tokens_used;
        self.processing_time_ms = processing_time_ms;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Aggregates over completed and failed evaluations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_evaluations: usize,
    pub successful: usize,
    pub failed: usize,
    pub average_processing_time_ms: f64,
    pub total_tokens_used: u64,
}

/// In-process audit store, optionally mirrored to a JSONL file.
///
/// Events are never edited or removed. Timestamps are clamped so the stored
/// sequence is non-decreasing even if the wall clock steps backwards.
#[derive(Debug, Default)]
pub struct AuditTrail {
    events: RwLock<Vec<AuditEvent>>,
    sink: Option<Mutex<File>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every appended event as one JSON line in `path`.
    pub fn with_jsonl_sink(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open audit log at {}", path.display()))?;
        Ok(Self {
            events: RwLock::default(),
            sink: Some(Mutex::new(file)),
        })
    }

    /// Replay a JSONL audit log into an in-memory trail without a sink.
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read audit log at {}", path.display()))?;
        let trail = Self::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(line).with_context(|| {
                format!("invalid audit event on line {} of {}", index + 1, path.display())
            })?;
            trail.record(event);
        }
        Ok(trail)
    }

    /// Append an event and return the stored copy.
    pub fn record(&self, mut event: AuditEvent) -> AuditEvent {
        {
            let mut events = self
                .events
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(last) = events.last() {
                if event.timestamp < last.timestamp {
                    event.timestamp = last.timestamp;
                }
            }
            events.push(event.clone());
        }
        self.mirror(&event);
        event
    }

    pub fn events_for(&self, evaluation_id: Uuid) -> Vec<AuditEvent> {
        self.read()
            .iter()
            .filter(|event| event.evaluation_id == Some(evaluation_id))
            .cloned()
            .collect()
    }

    /// The last `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEvent> {
        let events = self.read();
        let start = events.len().saturating_sub(n);
        events[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self) -> AuditStats {
        let events = self.read();
        let mut stats = AuditStats::default();
        let mut total_time = 0u64;
        for event in events.iter() {
            match event.event_type {
                AuditEventType::EvaluationCompleted => stats.successful += 1,
                AuditEventType::EvaluationFailed => stats.failed += 1,
                _ => continue,
            }
            total_time += event.processing_time_ms;
            stats.total_tokens_used += u64::from(event.tokens_used);
        }
        stats.total_evaluations = stats.successful + stats.failed;
        if stats.total_evaluations > 0 {
            stats.average_processing_time_ms = total_time as f64 / stats.total_evaluations as f64;
        }
        stats
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<AuditEvent>> {
        self.events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mirror(&self, event: &AuditEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialize audit event");
                return;
            }
        };
        let mut file = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = writeln!(file, "{line}") {
            warn!(error = %err, "failed to write audit event to sink");
        }
    }
}
