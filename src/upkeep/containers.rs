//! Client for the external container lifecycle manager.

use crate::identity::{verify_signature, Intent, Wallet};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Signed proof that the fee collector asked for an agent to stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAuthorization {
    pub message: String,
    pub signature: String,
    #[serde(rename = "signerAddress")]
    pub address: String,
}

impl StopAuthorization {
    pub fn sign(agent_id: &str, signer: &Wallet) -> Result<Self> {
        let message = format!("deactivate:{agent_id}:{}", Utc::now().timestamp());
        let signature = signer.sign_message(message.as_bytes())?;
        Ok(Self {
            message,
            signature,
            address: signer.address.clone(),
        })
    }

    /// Check the signature covers `message` and comes from `address`.
    pub fn verify(&self) -> Result<()> {
        let signer = verify_signature(Intent::PersonalMessage, self.message.as_bytes(), &self.signature)?;
        if !signer.eq_ignore_ascii_case(&self.address) {
            bail!("Stop authorization signed by {signer}, claims {}", self.address);
        }
        Ok(())
    }
}

#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn start(&self, agent_id: &str) -> Result<()>;
    async fn stop(&self, agent_id: &str, auth: &StopAuthorization) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpContainerManager {
    base_url: String,
    http: reqwest::Client,
}

impl HttpContainerManager {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, url: String, body: Option<&StopAuthorization>) -> Result<()> {
        debug!("POST {url}");
        let mut req = self.http.post(&url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("Container manager request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Container manager refused ({}): {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerManager for HttpContainerManager {
    async fn start(&self, agent_id: &str) -> Result<()> {
        self.post(format!("{}/agents/{agent_id}/start", self.base_url), None)
            .await
    }

    async fn stop(&self, agent_id: &str, auth: &StopAuthorization) -> Result<()> {
        self.post(format!("{}/agents/{agent_id}/stop", self.base_url), Some(auth))
            .await
    }
}
