use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use cotflow_common::{Citation, CollaboratorError, SearchClient, SearchRequest, SearchResponse};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use super::{ChatChoice, http_client, parse_completion, post_chat};
use crate::config::SearchSection;

static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>()\[\]"']+[^\s<>()\[\]"'.,;:!?]"#).unwrap());

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that analyzes web content.";

/// Search collaborator backed by Perplexity's online chat models.
pub struct PerplexityClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

/// Older responses list citations as bare URLs; newer ones as objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCitation {
    Url(String),
    Hit(SearchHit),
}

#[derive(Debug, Deserialize)]
struct PerplexityCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    citations: Vec<RawCitation>,
    #[serde(default)]
    search_results: Vec<SearchHit>,
}

impl PerplexityClient {
    pub fn new(section: &SearchSection, api_key: Option<String>) -> anyhow::Result<Self> {
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

    pub fn body(&self, request: &SearchRequest) -> serde_json::Value {
        let system = request
            .context
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": request.query }
            ],
            "temperature": 0.2,
            "max_tokens": 2000,
            "search_recency_filter": request.recency.as_str(),
            "return_citations": true,
            "return_images": false
        })
    }
}

fn to_response(text: &str) -> Result<SearchResponse, CollaboratorError> {
    let completion: PerplexityCompletion = parse_completion(text)?;
    let content = completion
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| CollaboratorError::Malformed("Search response has no content".into()))?;

    let mut citations: Vec<Citation> = Vec::new();
    let push = |citations: &mut Vec<Citation>, url: String, title: Option<String>| {
        if !citations.iter().any(|c| c.url == url) {
            citations.push(Citation { url, title });
        }
    };
    for hit in completion.search_results {
        push(&mut citations, hit.url, hit.title);
    }
    for raw in completion.citations {
        match raw {
            RawCitation::Url(url) => push(&mut citations, url, None),
            RawCitation::Hit(hit) => push(&mut citations, hit.url, hit.title),
        }
    }
    if citations.is_empty() {
        for url in URL_REGEX.find_iter(&content) {
            push(&mut citations, url.as_str().to_string(), None);
        }
    }

    Ok(SearchResponse { content, citations })
}

#[async_trait]
impl SearchClient for PerplexityClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, CollaboratorError> {
        let text = post_chat(
            &self.client,
            &self.url(),
            self.api_key.as_deref(),
            &self.body(request),
            self.timeout,
            "Search",
        )
        .await?;
        to_response(&text)
    }
}
