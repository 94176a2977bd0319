//! Continuation signal: how a finished task re-enters its session.
//!
//! The queue calls `resume` after every task that will not run again.
//! In-process delivery pushes the session id into the scheduler's channel;
//! webhook delivery POSTs to an external resumption endpoint. Both are
//! fire-and-forget: a lost signal is covered by the scheduler's sweep.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[async_trait]
pub trait Continuation: Send + Sync {
    async fn resume(&self, session_id: &str);
}

/// Sends session ids to the local scheduler.
#[derive(Clone)]
pub struct InProcessContinuation {
    tx: mpsc::UnboundedSender<String>,
}

impl InProcessContinuation {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// A continuation and the receiving end the scheduler drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Continuation for InProcessContinuation {
    async fn resume(&self, session_id: &str) {
        if self.tx.send(session_id.to_string()).is_err() {
            debug!(session_id, "Scheduler is gone, continuation dropped");
        }
    }
}

/// POSTs `{endpoint}/sessions/{id}/continue` without waiting for the answer.
#[derive(Clone)]
pub struct WebhookContinuation {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookContinuation {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build webhook client: {}", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/continue", self.endpoint, session_id)
    }
}

#[async_trait]
impl Continuation for WebhookContinuation {
    async fn resume(&self, session_id: &str) {
        let url = self.url_for(session_id);
        let request = self
            .client
            .post(&url)
            .header("User-Agent", "cotflow")
            .json(&serde_json::json!({ "session_id": session_id }));
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => debug!(%session_id, "Continuation delivered"),
                Err(e) => warn!(%session_id, error = %e, "Continuation webhook failed"),
            }
        });
    }
}
