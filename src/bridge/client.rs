//! HTTP client for an agent's off-chain inference service.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest<'a> {
    question: &'a str,
    requester_address: &'a str,
}

/// One element of the agent's reply.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

impl AgentClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }

    /// Ask the agent at `endpoint` and return its textual answer.
    pub async fn ask(&self, endpoint: &str, question: &str, requester: &str) -> Result<String> {
        let url = format!("{}/message", endpoint.trim_end_matches('/'));
        debug!("Asking agent at {url}");

        let resp = self
            .http
            .post(&url)
            .json(&MessageRequest {
                question,
                requester_address: requester,
            })
            .send()
            .await
            .with_context(|| format!("Inference request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Inference failed ({}): {}", status, body);
        }

        let messages: Vec<AgentMessage> = resp
            .json()
            .await
            .context("Failed to parse inference response")?;

        let text = messages
            .iter()
            .map(|m| m.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if text.is_empty() {
            bail!("Inference response contained no text");
        }
        Ok(text)
    }
}
