//! HTTP adapters for the reasoning and search collaborators.
//!
//! Both providers speak the chat-completions dialect, so the request
//! plumbing and the error mapping live here; each adapter only shapes its
//! body and reads its answer.

pub mod openai;
pub mod perplexity;

use std::sync::Arc;
use std::time::Duration;

use cotflow_common::{CollaboratorError, ReasoningClient, SearchClient, Usage};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CotflowToml;

pub use openai::ChatCompletionsClient;
pub use perplexity::PerplexityClient;

/// The two collaborators a queue worker may call.
#[derive(Clone)]
pub struct Collaborators {
    pub reasoning: Arc<dyn ReasoningClient>,
    pub search: Arc<dyn SearchClient>,
}

impl Collaborators {
    /// Build the HTTP adapters from config. A missing API key is not an
    /// error here; calls then fail with `NotConfigured`.
    pub fn from_config(toml: &CotflowToml) -> anyhow::Result<Self> {
        let reasoning_key = api_key(&toml.reasoning.api_key_env);
        let search_key = api_key(&toml.search.api_key_env);
        Ok(Self {
            reasoning: Arc::new(ChatCompletionsClient::new(&toml.reasoning, reasoning_key)?),
            search: Arc::new(PerplexityClient::new(&toml.search, search_key)?),
        })
    }
}

fn api_key(env_name: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        _ => {
            warn!(env = env_name, "API key not set; calls to this collaborator will fail");
            None
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatMessage,
}

/// Fields shared by both providers' chat-completions answers.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletion {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatCompletion {
    pub fn content(&self) -> Result<String, CollaboratorError> {
        self.choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CollaboratorError::Malformed("Response has no message content".into()))
    }
}

/// POST a chat-completions body and return the raw JSON answer.
pub(crate) async fn post_chat(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    timeout: Duration,
    provider: &str,
) -> Result<String, CollaboratorError> {
    let api_key = api_key.ok_or_else(|| CollaboratorError::NotConfigured(format!("{} API key", provider)))?;

    debug!(provider, url, "Sending chat completion request");
    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| transport_error(e, timeout, provider))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        return Err(CollaboratorError::from_status(status.as_u16(), text, retry_after));
    }

    response
        .text()
        .await
        .map_err(|e| transport_error(e, timeout, provider))
}

fn transport_error(e: reqwest::Error, timeout: Duration, provider: &str) -> CollaboratorError {
    if e.is_timeout() {
        CollaboratorError::Timeout { after: timeout }
    } else {
        CollaboratorError::Transport(format!("{} request failed: {}", provider, e))
    }
}

pub(crate) fn parse_completion<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, CollaboratorError> {
    serde_json::from_str(text)
        .map_err(|e| CollaboratorError::Malformed(format!("Unreadable provider response: {}", e)))
}
