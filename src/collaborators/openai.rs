use std::time::Duration;

use async_trait::async_trait;
use cotflow_common::{CollaboratorError, ReasoningClient, ReasoningRequest, ReasoningResponse};
use serde_json::json;

use super::{ChatCompletion, http_client, parse_completion, post_chat};
use crate::config::ReasoningSection;

/// Reasoning collaborator backed by an OpenAI-compatible chat-completions API.
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl ChatCompletionsClient {
    pub fn new(section: &ReasoningSection, api_key: Option<String>) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(section.request_timeout_secs);
        Ok(Self {
            client: http_client(timeout)?,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            model: section.model.clone(),
            api_key,
            timeout,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Request body for one reasoning call. Structured answers are always
    /// requested as a JSON object.
    pub fn body(&self, request: &ReasoningRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
            "response_format": { "type": "json_object" }
        })
    }
}

fn to_response(text: &str) -> Result<ReasoningResponse, CollaboratorError> {
    let completion: ChatCompletion = parse_completion(text)?;
    Ok(ReasoningResponse {
        content: completion.content()?,
        model: completion.model,
        usage: completion.usage,
    })
}

#[async_trait]
impl ReasoningClient for ChatCompletionsClient {
    async fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, CollaboratorError> {
        let text = post_chat(
            &self.client,
            &self.url(),
            self.api_key.as_deref(),
            &self.body(request),
            self.timeout,
            "Reasoning",
        )
        .await?;
        to_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_server;
    use cotflow_common::Usage;

    fn request() -> ReasoningRequest {
        ReasoningRequest {
            prompt: "Plan the research".into(),
            system: Some("You are a planner".into()),
            max_output_tokens: 800,
            temperature: 0.2,
            expected_fields: vec!["queries".into()],
        }
    }

    fn client(base_url: &str, key: Option<&str>) -> ChatCompletionsClient {
        let section = ReasoningSection {
            base_url: base_url.to_string(),
            ..ReasoningSection::default()
        };
        ChatCompletionsClient::new(&section, key.map(String::from)).unwrap()
    }

    #[test]
    fn test_body_carries_system_and_json_mode() {
        let body = client("https://api.openai.com/v1/", None).body(&request());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Plan the research");
        assert_eq!(body["max_tokens"], 800);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_body_without_system_has_one_message() {
        let mut req = request();
        req.system = None;
        let body = client("https://api.openai.com/v1", None).body(&req);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        assert_eq!(
            client("https://api.openai.com/v1/", None).url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_response_reads_content_and_usage() {
        let text = r#"{
            "model": "gpt-4o-mini-2024",
            "choices": [{"message": {"role": "assistant", "content": "{\"queries\": []}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
        }"#;
        let response = to_response(text).unwrap();
        assert_eq!(response.content, r#"{"queries": []}"#);
        assert_eq!(response.model.as_deref(), Some("gpt-4o-mini-2024"));
        assert_eq!(
            response.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 5,
                total_tokens: 17
            })
        );
    }

    #[tokio::test]
    async fn test_reason_round_trip_against_local_server() {
        let body = r#"{"choices": [{"message": {"content": "{\"answer\": 1}"}}]}"#;
        let (url, received) = test_server::serve_once("200 OK", &[("Content-Type", "application/json")], body).await;
        let response = client(&url, Some("sk-test")).reason(&request()).await.unwrap();
        assert_eq!(response.content, r#"{"answer": 1}"#);

        let raw = received.await.unwrap();
        assert!(raw.starts_with("POST /chat/completions"));
        assert!(raw.to_lowercase().contains("authorization: bearer sk-test"));
    }

    #[tokio::test]
    async fn test_reason_without_key_fails_structurally() {
        let err = client("http://127.0.0.1:9", None).reason(&request()).await.unwrap_err();
        assert!(err.is_structural());
    }
}
