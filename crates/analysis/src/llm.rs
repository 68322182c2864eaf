use anyhow::{Context, Result, bail};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use bug_agent_core::config::OpenAiConfig;

/// A chat-completion model. Returns the content parts of the reply, one per choice.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: Option<&str>, prompt: &str) -> Result<Vec<String>>;
}

pub struct OpenAiChat {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
}

impl OpenAiChat {
    pub fn new(config: &OpenAiConfig, model: impl Into<String>) -> Self {
        let mut openai = OpenAIConfig::new().with_api_key(config.api_key.clone());
        if let Some(api_base) = &config.api_base {
            openai = openai.with_api_base(api_base.clone());
        }
        Self {
            client: Client::with_config(openai),
            model: model.into(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, system: Option<&str>, prompt: &str) -> Result<Vec<String>> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default().content(system).build()?.into(),
            );
        }
        messages
            .push(ChatCompletionRequestUserMessageArgs::default().content(prompt).build()?.into());
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .messages(messages)
            .max_completion_tokens(self.max_tokens)
            .build()
            .context("Failed to build chat completion request")?;
        let start = std::time::Instant::now();
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .with_context(|| format!("Chat completion with {} failed", self.model))?;
        tracing::debug!(
            "Chat completion with {} took {}ms ({} choices)",
            self.model,
            start.elapsed().as_millis(),
            response.choices.len()
        );
        let parts = response
            .choices
            .into_iter()
            .filter_map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            bail!("Chat completion with {} returned no content", self.model);
        }
        Ok(parts)
    }
}
