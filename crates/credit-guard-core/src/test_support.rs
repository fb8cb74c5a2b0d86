//! Scripted completion provider shared by unit and integration tests.
//!
//! Compiled for `cfg(test)` and behind the `test-support` feature.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::ProviderError,
    gateway::{CompletionProvider, ProviderReply, ProviderRequest},
};

pub const SCRIPTED_TOKENS: u32 = 120;

enum Matcher {
    Prompt(String),
    Agent(String),
}

impl Matcher {
    fn matches(&self, request: &ProviderRequest) -> bool {
        match self {
            Self::Prompt(marker) => request.prompt.contains(marker.as_str()),
            Self::Agent(agent) => request.agent_id == *agent,
        }
    }
}

/// In-process provider with canned replies, failures and call accounting.
pub struct ScriptedProvider {
    default_reply: String,
    rules: Vec<(Matcher, Result<String, ProviderError>)>,
    panic_marker: Option<String>,
    delay: Option<Duration>,
    failures: Mutex<(u32, Option<ProviderError>)>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn replying(text: &str) -> Self {
        Self {
            default_reply: text.to_string(),
            rules: Vec::new(),
            panic_marker: None,
            delay: None,
            failures: Mutex::new((0, None)),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply_when_prompt_contains(mut self, marker: &str, text: &str) -> Self {
        self.rules
            .push((Matcher::Prompt(marker.into()), Ok(text.to_string())));
        self
    }

    pub fn reply_for_agent(mut self, agent: &str, text: &str) -> Self {
        self.rules
            .push((Matcher::Agent(agent.into()), Ok(text.to_string())));
        self
    }

    /// Failures take precedence over replies registered for the same agent.
    pub fn fail_for_agent(mut self, agent: &str, err: ProviderError) -> Self {
        self.rules.insert(0, (Matcher::Agent(agent.into()), Err(err)));
        self
    }

    pub fn failing_first(self, times: u32, err: ProviderError) -> Self {
        *self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = (times, Some(err));
        self
    }

    pub fn panic_when_prompt_contains(mut self, marker: &str) -> Self {
        self.panic_marker = Some(marker.to_string());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_for(&self, agent: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|request| request.agent_id == agent)
            .count()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(marker) = &self.panic_marker {
            if request.prompt.contains(marker.as_str()) {
                panic!("scripted provider fault");
            }
        }
        {
            let mut failures = self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if failures.0 > 0 {
                failures.0 -= 1;
                if let Some(err) = failures.1.clone() {
                    return Err(err);
                }
            }
        }
        let outcome = self
            .rules
            .iter()
            .find(|(matcher, _)| matcher.matches(request))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| Ok(self.default_reply.clone()));
        outcome.map(|text| ProviderReply {
            text,
            tokens_used: SCRIPTED_TOKENS,
            processing_time_ms: 1,
        })
    }
}
