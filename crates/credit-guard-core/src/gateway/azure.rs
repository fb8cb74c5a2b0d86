use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{CompletionProvider, ModelTier, ProviderReply, ProviderRequest, TierParameters};
use crate::{error::ProviderError, settings::ProviderSettings};

/// Chat-completions client for Azure OpenAI deployments, one per model tier.
///
/// Retries are owned by the gateway; this client performs a single attempt.
#[derive(Debug, Clone)]
pub struct AzureOpenAiProvider {
    http: Client,
    endpoint: String,
    api_key: String,
    api_version: String,
    fast_deployment: String,
    capable_deployment: String,
}

impl AzureOpenAiProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            bail!("Azure OpenAI API key must be provided via CREDIT_GUARD_API_KEY");
        }
        if settings.endpoint.trim().is_empty() {
            bail!("CREDIT_GUARD_ENDPOINT must be set for the Azure OpenAI provider");
        }
        let http = Client::builder()
            .user_agent("credit-guard/0.1")
            .timeout(Duration::from_secs(settings.timeout_secs.unwrap_or(60)))
            .build()
            .context("failed to build Azure OpenAI HTTP client")?;

        Ok(Self {
            http,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_version: settings.api_version.clone(),
            fast_deployment: settings.fast_deployment.clone(),
            capable_deployment: settings.capable_deployment.clone(),
        })
    }

    fn url_for(&self, tier: ModelTier) -> String {
        let deployment = match tier {
            ModelTier::Fast => &self.fast_deployment,
            ModelTier::Capable => &self.capable_deployment,
        };
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, deployment, self.api_version
        )
    }
}

#[async_trait]
impl CompletionProvider for AzureOpenAiProvider {
    fn name(&self) -> &str {
        "azure-openai"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        let payload = ChatCompletionRequest {
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            parameters: &request.parameters,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(self.url_for(request.model_tier))
            .header("api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let chat: ChatCompletionResponse =
            response
                .json()
                .await
                .map_err(|err| ProviderError::InvalidResponse {
                    message: format!("failed to parse Azure OpenAI response: {err}"),
                })?;
        let text = chat
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse {
                message: "Azure OpenAI response missing message content".into(),
            })?;

        Ok(ProviderReply {
            text,
            tokens_used: chat.usage.map(|usage| usage.total_tokens).unwrap_or(0),
            processing_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "…"
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    messages: Vec<ChatMessage<'a>>,
    #[serde(flatten)]
    parameters: &'a TierParameters,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}
