//! Typed request, response and step-result payloads.
//!
//! Every blob that crosses the persistence boundary is one of the closed
//! variants below, tagged by task type or step. Collaborator output is
//! validated here before it may become a step result, so a malformed
//! answer surfaces as a `PayloadError` instead of a half-parsed value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::TaskType;

/// Recency window for a search call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recency {
    Day,
    #[default]
    Week,
    Month,
    Year,
}

impl Recency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for Recency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(format!("Invalid recency window: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Fields the structured answer must contain.
    #[serde(default)]
    pub expected_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub recency: Recency,
    /// Optional system guidance passed along with the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRequest {
    Reasoning(ReasoningRequest),
    Search(SearchRequest),
}

impl TaskRequest {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Reasoning(_) => TaskType::Reasoning,
            Self::Search(_) => TaskType::Search,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResponse {
    Reasoning(ReasoningResponse),
    Search(SearchResponse),
}

impl TaskResponse {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Reasoning(_) => TaskType::Reasoning,
            Self::Search(_) => TaskType::Search,
        }
    }
}

/// One search the THINK step asks EXECUTE to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedQuery {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkResult {
    pub output: Map<String, Value>,
    pub queries: Vec<PlannedQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub query: String,
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub searches: Vec<SearchOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrateResult {
    pub output: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepResult {
    Think(ThinkResult),
    Execute(ExecuteResult),
    Integrate(IntegrateResult),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("Output is not valid JSON: {0}")]
    NotJson(String),

    #[error("Output is not a JSON object")]
    NotAnObject,

    #[error("Output is missing required field '{0}'")]
    MissingField(String),

    #[error("Invalid query plan: {0}")]
    InvalidQueries(String),

    #[error("Expected a {expected} response, got {found}")]
    WrongVariant { expected: TaskType, found: TaskType },
}

/// Parse collaborator text into a JSON object.
///
/// Models often wrap JSON in a markdown fence or add a sentence around
/// it; the outermost `{ ... }` span is used when the text itself does
/// not parse.
pub fn parse_json_object(content: &str) -> Result<Map<String, Value>, PayloadError> {
    let trimmed = strip_fence(content.trim());
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(first) => match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str(&trimmed[start..=end])
                    .map_err(|e| PayloadError::NotJson(e.to_string()))?
            }
            _ => return Err(PayloadError::NotJson(first.to_string())),
        },
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(PayloadError::NotAnObject),
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Every field in `fields` is present and not null.
pub fn require_fields(object: &Map<String, Value>, fields: &[String]) -> Result<(), PayloadError> {
    for field in fields {
        match object.get(field) {
            Some(Value::Null) | None => return Err(PayloadError::MissingField(field.clone())),
            Some(_) => {}
        }
    }
    Ok(())
}

impl ThinkResult {
    /// Validate a THINK answer. `queries` is always required because
    /// EXECUTE fans out over it; an empty list is allowed.
    pub fn from_output(content: &str, expected_fields: &[String]) -> Result<Self, PayloadError> {
        let output = parse_json_object(content)?;
        require_fields(&output, expected_fields)?;
        let raw = output
            .get("queries")
            .ok_or_else(|| PayloadError::MissingField("queries".to_string()))?;
        let items = raw
            .as_array()
            .ok_or_else(|| PayloadError::InvalidQueries("'queries' is not an array".to_string()))?;

        let mut queries = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let planned = match item {
                Value::String(q) if !q.trim().is_empty() => PlannedQuery {
                    query: q.trim().to_string(),
                    intent: None,
                    category: None,
                },
                Value::Object(obj) => {
                    let query = obj
                        .get("query")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|q| !q.is_empty())
                        .ok_or_else(|| {
                            PayloadError::InvalidQueries(format!("query #{} has no 'query' text", i))
                        })?;
                    PlannedQuery {
                        query: query.to_string(),
                        intent: obj.get("intent").and_then(Value::as_str).map(String::from),
                        category: obj.get("category").and_then(Value::as_str).map(String::from),
                    }
                }
                _ => {
                    return Err(PayloadError::InvalidQueries(format!(
                        "query #{} is neither text nor an object",
                        i
                    )));
                }
            };
            queries.push(planned);
        }

        Ok(Self { output, queries })
    }
}

impl IntegrateResult {
    pub fn from_output(content: &str, expected_fields: &[String]) -> Result<Self, PayloadError> {
        let output = parse_json_object(content)?;
        require_fields(&output, expected_fields)?;
        Ok(Self { output })
    }
}

impl ExecuteResult {
    pub fn is_empty(&self) -> bool {
        self.searches.is_empty()
    }

    /// Render the gathered evidence as plain text for an INTEGRATE prompt.
    pub fn as_evidence(&self) -> String {
        let mut text = String::new();
        for (i, s) in self.searches.iter().enumerate() {
            text.push_str(&format!("## Search {}: {}\n{}\n", i + 1, s.query, s.content.trim()));
            if !s.citations.is_empty() {
                text.push_str("Sources:\n");
                for c in &s.citations {
                    text.push_str(&format!("- {}\n", c.url));
                }
            }
            text.push('\n');
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_plain_object() {
        let obj = parse_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(obj["a"], 1);
    }

    #[test]
    fn test_parse_fenced_object() {
        let obj = parse_json_object("```json\n{\"topics\": []}\n```").unwrap();
        assert!(obj.contains_key("topics"));
    }

    #[test]
    fn test_parse_object_embedded_in_prose() {
        let obj = parse_json_object("Here you go: {\"ok\": true} hope it helps").unwrap();
        assert_eq!(obj["ok"], true);
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert_eq!(parse_json_object("[1,2]"), Err(PayloadError::NotAnObject));
        assert!(matches!(parse_json_object("not json"), Err(PayloadError::NotJson(_))));
    }

    #[test]
    fn test_require_fields_treats_null_as_missing() {
        let obj = parse_json_object(r#"{"a": null, "b": 2}"#).unwrap();
        assert_eq!(
            require_fields(&obj, &fields(&["b", "a"])),
            Err(PayloadError::MissingField("a".to_string()))
        );
    }

    #[test]
    fn test_think_result_accepts_text_and_object_queries() {
        let content = r#"{"approach": "x", "queries": ["ai news", {"query": "rust 2024", "intent": "trend"}]}"#;
        let think = ThinkResult::from_output(content, &fields(&["approach"])).unwrap();
        assert_eq!(think.queries.len(), 2);
        assert_eq!(think.queries[0].query, "ai news");
        assert_eq!(think.queries[1].intent.as_deref(), Some("trend"));
    }

    #[test]
    fn test_think_result_requires_queries() {
        let err = ThinkResult::from_output(r#"{"approach": "x"}"#, &[]).unwrap_err();
        assert_eq!(err, PayloadError::MissingField("queries".to_string()));
    }

    #[test]
    fn test_think_result_rejects_query_without_text() {
        let err = ThinkResult::from_output(r#"{"queries": [{"intent": "x"}]}"#, &[]).unwrap_err();
        assert!(matches!(err, PayloadError::InvalidQueries(_)));
    }

    #[test]
    fn test_integrate_result_checks_expected_fields() {
        let err = IntegrateResult::from_output(r#"{"summary": "s"}"#, &fields(&["topics"])).unwrap_err();
        assert_eq!(err, PayloadError::MissingField("topics".to_string()));
    }

    #[test]
    fn test_task_request_is_tagged_by_type() {
        let req = TaskRequest::Search(SearchRequest {
            query: "q".into(),
            recency: Recency::Day,
            context: None,
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "search");
        assert_eq!(json["recency"], "day");
        let back: TaskRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.task_type(), TaskType::Search);
    }

    #[test]
    fn test_step_result_is_tagged_by_step() {
        let json = serde_json::to_value(StepResult::Execute(ExecuteResult::default())).unwrap();
        assert_eq!(json["step"], "execute");
    }

    #[test]
    fn test_evidence_lists_sources() {
        let result = ExecuteResult {
            searches: vec![SearchOutcome {
                query: "q".into(),
                content: "body".into(),
                citations: vec![Citation { url: "https://a.example".into(), title: None }],
                task_id: None,
            }],
        };
        let text = result.as_evidence();
        assert!(text.contains("Search 1: q"));
        assert!(text.contains("https://a.example"));
    }
}
