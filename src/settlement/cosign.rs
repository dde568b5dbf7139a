//! Gas-payer signature sources.

use crate::identity::Wallet;
use crate::settlement::PresignedTransaction;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A party able to co-sign a pre-signed transaction as gas payer.
///
/// Implementations may cross a process boundary and take arbitrarily long;
/// callers bound the wait and abandon the transaction on timeout.
#[async_trait]
pub trait CoSigner: Send + Sync {
    /// Address that will appear as `gas_owner`.
    fn address(&self) -> &str;

    /// Return a serialized signature over `tx.tx_bytes`.
    async fn co_sign(&self, tx: &PresignedTransaction) -> Result<String>;
}

/// A locally held key sponsors directly.
#[async_trait]
impl CoSigner for Wallet {
    fn address(&self) -> &str {
        &self.address
    }

    async fn co_sign(&self, tx: &PresignedTransaction) -> Result<String> {
        self.sign_transaction(&tx.tx_bytes)
    }
}

/// Remote sponsor service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSponsor {
    base_url: String,
    address: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SponsorRequest<'a> {
    tx_bytes: String,
    sender: &'a str,
    sender_signature: &'a str,
}

#[derive(Debug, Deserialize)]
struct SponsorResponse {
    signature: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

impl HttpSponsor {
    pub fn new(base_url: &str, address: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            address: address.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Ask the sponsor which address it pays gas from.
    pub async fn discover(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        let resp = reqwest::Client::new()
            .get(format!("{base_url}/v1/address"))
            .send()
            .await
            .context("Sponsor address request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Sponsor address lookup failed ({}): {}", status, body);
        }

        let body: AddressResponse = resp
            .json()
            .await
            .context("Failed to parse sponsor address")?;
        Ok(Self::new(base_url, &body.address))
    }
}

#[async_trait]
impl CoSigner for HttpSponsor {
    fn address(&self) -> &str {
        &self.address
    }

    async fn co_sign(&self, tx: &PresignedTransaction) -> Result<String> {
        debug!("Requesting sponsorship for {}", tx.digest());

        let resp = self
            .http
            .post(format!("{}/v1/sponsor", self.base_url))
            .json(&SponsorRequest {
                tx_bytes: tx.tx_bytes_base64(),
                sender: &tx.data.sender,
                sender_signature: &tx.sender_signature,
            })
            .send()
            .await
            .context("Sponsor request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Sponsor refused ({}): {}", status, body);
        }

        let body: SponsorResponse = resp
            .json()
            .await
            .context("Failed to parse sponsor response")?;

        match (body.signature, body.error) {
            (_, Some(err)) => bail!("Sponsor refused: {err}"),
            (Some(sig), None) => Ok(sig),
            (None, None) => bail!("Sponsor response missing signature"),
        }
    }
}
