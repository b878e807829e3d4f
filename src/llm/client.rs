use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        CreateCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::{CompletionMode, Config};

/// Text completion service the callback handler talks to.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Returns the single best reply for `prompt`, trimmed.
    ///
    /// `channel` identifies the bot application the conversation runs through.
    async fn complete(&self, prompt: &str, user_id: &str, channel: &str) -> anyhow::Result<String>;
}

pub struct LlmClient {
    client: Client<OpenAIConfig>,
    model: String,
    mode: CompletionMode,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    presence_penalty: f32,
}

impl LlmClient {
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_base(&config.openai_base_url)
            .with_api_key(&config.openai_api_key);

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client: Client::with_config(openai_config).with_http_client(http_client),
            model: config.openai_model.clone(),
            mode: config.openai_mode,
            max_tokens: config.openai_max_tokens,
            temperature: config.openai_temperature,
            top_p: config.openai_top_p,
            presence_penalty: config.openai_presence_penalty,
        }
    }

    #[allow(deprecated)]
    async fn chat(&self, prompt: &str, user_id: &str) -> anyhow::Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()?
                .into()])
            .max_tokens(self.max_tokens)
            .temperature(self.temperature)
            .top_p(self.top_p)
            .presence_penalty(self.presence_penalty)
            .user(user_id)
            .build()?;

        let response = self.client.chat().create(request).await?;
        first_reply(
            response
                .choices
                .into_iter()
                .map(|choice| choice.message.content),
        )
    }

    async fn completion(&self, prompt: &str, user_id: &str) -> anyhow::Result<String> {
        let request = CreateCompletionRequestArgs::default()
            .model(&self.model)
            .prompt(prompt)
            .max_tokens(self.max_tokens)
            .temperature(self.temperature)
            .top_p(self.top_p)
            .presence_penalty(self.presence_penalty)
            .user(user_id)
            .build()?;

        let response = self.client.completions().create(request).await?;
        first_reply(response.choices.into_iter().map(|choice| Some(choice.text)))
    }
}

#[async_trait]
impl CompletionGateway for LlmClient {
    async fn complete(&self, prompt: &str, user_id: &str, channel: &str) -> anyhow::Result<String> {
        debug!("Requesting {:?} completion for user {} via {}", self.mode, user_id, channel);
        match self.mode {
            CompletionMode::Chat => self.chat(prompt, user_id).await,
            CompletionMode::Completion => self.completion(prompt, user_id).await,
        }
    }
}

/// Picks the first choice. No choices at all is an error; an empty text is not.
fn first_reply<I>(choices: I) -> anyhow::Result<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    let first = choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty completion choices"))?;
    Ok(first.unwrap_or_default().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reply() {
        assert_eq!(
            first_reply(vec![Some("\n\n Fine, thanks. ".to_string()), Some("other".to_string())]).unwrap(),
            "Fine, thanks."
        );
        assert_eq!(first_reply(vec![None]).unwrap(), "");
        assert!(first_reply(Vec::<Option<String>>::new()).is_err());
    }
}
