use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChatTurn, LlmProvider};
use crate::error::PipelineError;

/// Providers tried in order, primary first. The first success wins; when every
/// tier fails the attempt fails loudly with the last error.
pub struct LlmChain {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl LlmChain {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self { providers }
    }

    pub fn primary_with_fallback(
        primary: Arc<dyn LlmProvider>,
        fallback: Arc<dyn LlmProvider>,
    ) -> Self {
        Self::new(vec![primary, fallback])
    }

    pub async fn complete(&self, system: &str, turns: &[ChatTurn]) -> crate::error::Result<String> {
        let mut last: Option<(String, anyhow::Error)> = None;

        for provider in &self.providers {
            match provider.complete(system, turns).await {
                Ok(text) => {
                    debug!("LLM {} answered ({} chars)", provider.id(), text.len());
                    return Ok(text);
                }
                Err(e) => {
                    warn!("LLM {} failed: {:#}", provider.id(), e);
                    last = Some((provider.id().to_string(), e));
                }
            }
        }

        let (provider, source) =
            last.unwrap_or_else(|| ("llm".to_string(), anyhow!("no LLM providers configured")));
        Err(PipelineError::provider(provider, source))
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiCompatLlm {
    id: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiCompatLlm {
    pub fn new(id: &str, base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            id: id.to_string(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatLlm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(ChatMessage {
            role: "system",
            content: system,
        });
        for turn in turns {
            messages.push(ChatMessage {
                role: match turn.role {
                    super::Role::User => "user",
                    super::Role::Assistant => "assistant",
                },
                content: &turn.content,
            });
        }

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: 0.9,
            max_tokens: 400,
        };

        let response: ChatResponse = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("chat completion request")?
            .error_for_status()?
            .json()
            .await
            .context("chat completion body")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("empty completion"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLlm;

    #[tokio::test]
    async fn falls_back_when_primary_fails() {
        let primary = Arc::new(FakeLlm::failing("primary"));
        let fallback = Arc::new(FakeLlm::replying("fallback", r#"{"type":"text","text":"hi"}"#));
        let chain = LlmChain::primary_with_fallback(primary.clone(), fallback.clone());

        let out = chain.complete("system", &[]).await.unwrap();
        assert!(out.contains("hi"));
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let primary = Arc::new(FakeLlm::replying("primary", "ok"));
        let fallback = Arc::new(FakeLlm::replying("fallback", "unused"));
        let chain = LlmChain::primary_with_fallback(primary, fallback.clone());

        assert_eq!(chain.complete("system", &[]).await.unwrap(), "ok");
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn both_tiers_failing_is_a_provider_failure() {
        let chain = LlmChain::primary_with_fallback(
            Arc::new(FakeLlm::failing("primary")),
            Arc::new(FakeLlm::failing("fallback")),
        );

        match chain.complete("system", &[]).await {
            Err(PipelineError::ProviderFailure { provider, .. }) => assert_eq!(provider, "fallback"),
            other => panic!("expected provider failure, got {:?}", other),
        }
    }
}
