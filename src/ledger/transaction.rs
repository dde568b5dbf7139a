//! Transaction data model shared by the settlement protocol and ledgers.
//!
//! A transaction names two roles: the `sender`, whose identity the domain
//! operation is attributed to, and the `gas_owner`, who pays the network
//! fee. Both must sign the exact same serialized bytes.

use crate::identity::{normalize_address, verify_signature, Intent};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeSet;

/// Reference to a specific version of an on-ledger object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_id: String,
    pub version: u64,
}

/// A call into an arbitrary `package::module::function` entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveCall {
    pub package: String,
    pub module: String,
    pub function: String,
    pub arguments: Vec<serde_json::Value>,
}

/// The single domain operation carried by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Extract `amount` from the account balance and transfer it to `recipient`.
    Withdraw {
        account: ObjectRef,
        admin_cap: String,
        amount: u64,
        recipient: String,
    },
    /// Add `amount` from the sender to the account balance.
    Deposit { account: ObjectRef, amount: u64 },
    /// Overwrite the configuration blob (hex encoded).
    UpdateConfiguration {
        account: ObjectRef,
        admin_cap: String,
        configuration: String,
    },
    /// Overwrite the memory pointer.
    UpdateMemoryPointer {
        account: ObjectRef,
        admin_cap: String,
        memory_pointer: Option<String>,
    },
    /// Write a response into a prompt object's answer field.
    PopulateAnswer {
        prompt: String,
        requester: String,
        response: String,
    },
    /// Caller-named entry point.
    Call(MoveCall),
}

impl Operation {
    /// `module::function` this operation lowers to.
    pub fn entry_point(&self) -> String {
        match self {
            Self::Withdraw { .. } => "agent::withdraw".into(),
            Self::Deposit { .. } => "agent::deposit".into(),
            Self::UpdateConfiguration { .. } => "agent::update_configuration".into(),
            Self::UpdateMemoryPointer { .. } => "agent::update_memory_pointer".into(),
            Self::PopulateAnswer { .. } => "prompt::populate".into(),
            Self::Call(call) => format!("{}::{}", call.module, call.function),
        }
    }

    /// Agent Account touched by this operation, if any.
    pub fn account(&self) -> Option<&ObjectRef> {
        match self {
            Self::Withdraw { account, .. }
            | Self::Deposit { account, .. }
            | Self::UpdateConfiguration { account, .. }
            | Self::UpdateMemoryPointer { account, .. } => Some(account),
            Self::PopulateAnswer { .. } | Self::Call(_) => None,
        }
    }
}

/// Unsigned transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    pub package: String,
    pub sender: String,
    pub gas_owner: String,
    pub gas_budget: u64,
    pub operation: Operation,
}

impl TransactionData {
    /// Canonical serialized bytes. These are what every party signs.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize transaction data")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to decode transaction bytes")
    }

    /// Distinct addresses that must sign.
    pub fn required_signers(&self) -> BTreeSet<String> {
        [&self.sender, &self.gas_owner]
            .into_iter()
            .map(|a| normalize_address(a))
            .collect()
    }

    pub fn is_sponsored(&self) -> bool {
        self.required_signers().len() > 1
    }
}

/// Digest identifying a transaction by its bytes.
pub fn transaction_digest(tx_bytes: &[u8]) -> String {
    hex::encode(Keccak256::digest(tx_bytes))
}

/// Transaction bytes plus every collected signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx_bytes: Vec<u8>,
    pub signatures: Vec<String>,
}

impl SignedTransaction {
    pub fn tx_bytes_base64(&self) -> String {
        BASE64.encode(&self.tx_bytes)
    }

    pub fn from_base64(tx_bytes: &str, signatures: Vec<String>) -> Result<Self> {
        let tx_bytes = BASE64
            .decode(tx_bytes.trim())
            .context("Transaction bytes are not valid base64")?;
        Ok(Self {
            tx_bytes,
            signatures,
        })
    }

    pub fn digest(&self) -> String {
        transaction_digest(&self.tx_bytes)
    }

    /// Decode the body and check that the signer set is exactly the set of
    /// required roles, every signature covering these same bytes.
    pub fn verify(&self) -> Result<TransactionData> {
        let data = TransactionData::from_bytes(&self.tx_bytes)?;
        let required = data.required_signers();

        let mut signers = BTreeSet::new();
        for sig in &self.signatures {
            let signer = verify_signature(Intent::Transaction, &self.tx_bytes, sig)?;
            signers.insert(normalize_address(&signer));
        }

        if signers != required {
            let missing: Vec<_> = required.difference(&signers).cloned().collect();
            let extra: Vec<_> = signers.difference(&required).cloned().collect();
            bail!("Signer set mismatch (missing: {missing:?}, unexpected: {extra:?})");
        }

        Ok(data)
    }
}
