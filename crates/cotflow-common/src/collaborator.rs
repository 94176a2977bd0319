use std::time::Duration;

use async_trait::async_trait;

use crate::payload::{ReasoningRequest, ReasoningResponse, SearchRequest, SearchResponse};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Request timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Malformed reply: {0}")]
    Malformed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Collaborator not configured: {0}")]
    NotConfigured(String),
}

impl CollaboratorError {
    /// Retrying the same request cannot succeed.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::PayloadTooLarge(_) | Self::NotConfigured(_))
    }

    /// Map an HTTP status and body to an error, recognising the shapes the
    /// chat-completions providers use for rate and size limits.
    pub fn from_status(code: u16, body: String, retry_after: Option<Duration>) -> Self {
        let lower = body.to_lowercase();
        match code {
            429 => Self::RateLimited {
                retry_after,
                message: body,
            },
            413 => Self::PayloadTooLarge(body),
            400 if lower.contains("context length") || lower.contains("maximum context") => {
                Self::PayloadTooLarge(body)
            }
            _ => Self::Status { code, body },
        }
    }
}

/// Text-generation service.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn reason(&self, request: &ReasoningRequest)
    -> Result<ReasoningResponse, CollaboratorError>;
}

/// Web-search service.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_429_is_rate_limited() {
        let err = CollaboratorError::from_status(429, "slow down".into(), Some(Duration::from_secs(7)));
        assert_eq!(
            err,
            CollaboratorError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
                message: "slow down".into()
            }
        );
    }

    #[test]
    fn test_context_length_400_is_structural() {
        let err = CollaboratorError::from_status(
            400,
            "This model's maximum context length is 8192 tokens".into(),
            None,
        );
        assert!(err.is_structural());
        assert!(!CollaboratorError::from_status(500, "boom".into(), None).is_structural());
    }

    #[test]
    fn test_timeout_message_names_seconds() {
        let err = CollaboratorError::Timeout {
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "Request timed out after 30s");
    }
}
