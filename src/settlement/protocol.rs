//! The settlement protocol proper.

use crate::identity::{normalize_address, verify_signature, Intent, Wallet};
use crate::ledger::transaction::transaction_digest;
use crate::ledger::{
    AgentAccount, ExecutionStatus, Ledger, Operation, SignedTransaction, TransactionData,
};
use crate::settlement::{CoSigner, Role, SettlementError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A built transaction carrying the sender's signature, waiting for the
/// gas payer. Safe to hand to another process; dropping it has no effect.
#[derive(Debug, Clone)]
pub struct PresignedTransaction {
    pub data: TransactionData,
    pub tx_bytes: Vec<u8>,
    pub sender_signature: String,
}

impl PresignedTransaction {
    /// Serialize `data` and sign it as `sender`.
    pub fn sign(data: TransactionData, sender: &Wallet) -> Result<Self, SettlementError> {
        if normalize_address(&sender.address) != normalize_address(&data.sender) {
            return Err(SettlementError::SignerMismatch {
                role: Role::Sender,
                expected: data.sender.clone(),
                actual: sender.address.clone(),
            });
        }
        let tx_bytes = data
            .to_bytes()
            .map_err(|e| SettlementError::InvalidRequest(format!("{e:#}")))?;
        let sender_signature =
            sender
                .sign_transaction(&tx_bytes)
                .map_err(|e| SettlementError::SignatureUnavailable {
                    role: Role::Sender,
                    reason: format!("{e:#}"),
                })?;
        Ok(Self {
            data,
            tx_bytes,
            sender_signature,
        })
    }

    pub fn tx_bytes_base64(&self) -> String {
        BASE64.encode(&self.tx_bytes)
    }

    pub fn digest(&self) -> String {
        transaction_digest(&self.tx_bytes)
    }

    /// Attach the gas payer's signature after checking it covers these exact
    /// bytes and comes from `gas_owner`.
    pub fn attach_gas_signature(self, signature: String) -> Result<SignedTransaction, SettlementError> {
        let signer = verify_signature(Intent::Transaction, &self.tx_bytes, &signature).map_err(|e| {
            SettlementError::SignatureUnavailable {
                role: Role::GasPayer,
                reason: format!("invalid signature: {e:#}"),
            }
        })?;
        if normalize_address(&signer) != normalize_address(&self.data.gas_owner) {
            return Err(SettlementError::SignerMismatch {
                role: Role::GasPayer,
                expected: self.data.gas_owner.clone(),
                actual: signer,
            });
        }
        Ok(SignedTransaction {
            tx_bytes: self.tx_bytes,
            signatures: vec![self.sender_signature, signature],
        })
    }

    /// Sender and gas payer are the same principal.
    fn into_self_paid(self) -> SignedTransaction {
        SignedTransaction {
            tx_bytes: self.tx_bytes,
            signatures: vec![self.sender_signature],
        }
    }
}

/// Successful execution.
#[derive(Debug, Clone)]
pub struct SettlementReceipt {
    pub digest: String,
    pub events: Vec<serde_json::Value>,
}

/// A change to an Agent Account, resolved against its current version at
/// build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountAction {
    Withdraw { amount: u64, recipient: String },
    Deposit { amount: u64 },
    Configure { configuration: Vec<u8> },
    SetMemoryPointer { memory_pointer: Option<String> },
}

impl AccountAction {
    fn to_operation(&self, account: &AgentAccount) -> Result<Operation, SettlementError> {
        let admin_cap = || {
            account.admin_cap_id.clone().ok_or_else(|| {
                SettlementError::InvalidRequest(format!(
                    "account {} exposes no admin capability",
                    account.object_id
                ))
            })
        };

        Ok(match self {
            Self::Withdraw { amount, recipient } => {
                if *amount == 0 {
                    return Err(SettlementError::InvalidRequest(
                        "zero-value withdrawal".into(),
                    ));
                }
                if *amount > account.balance {
                    return Err(SettlementError::InsufficientBalance {
                        requested: *amount,
                        available: account.balance,
                    });
                }
                Operation::Withdraw {
                    account: account.object_ref(),
                    admin_cap: admin_cap()?,
                    amount: *amount,
                    recipient: recipient.clone(),
                }
            }
            Self::Deposit { amount } => Operation::Deposit {
                account: account.object_ref(),
                amount: *amount,
            },
            Self::Configure { configuration } => Operation::UpdateConfiguration {
                account: account.object_ref(),
                admin_cap: admin_cap()?,
                configuration: hex::encode(configuration),
            },
            Self::SetMemoryPointer { memory_pointer } => Operation::UpdateMemoryPointer {
                account: account.object_ref(),
                admin_cap: admin_cap()?,
                memory_pointer: memory_pointer.clone(),
            },
        })
    }
}

/// Builds, signs and submits transactions against one contract package.
pub struct SettlementProtocol {
    ledger: Arc<dyn Ledger>,
    package_id: String,
    gas_budget: u64,
    cosign_timeout: Duration,
    conflict_retries: u32,
}

impl SettlementProtocol {
    pub fn new(ledger: Arc<dyn Ledger>, package_id: &str, gas_budget: u64) -> Self {
        Self {
            ledger,
            package_id: package_id.to_string(),
            gas_budget,
            cosign_timeout: Duration::from_secs(30),
            conflict_retries: 3,
        }
    }

    pub fn with_cosign_timeout(mut self, timeout: Duration) -> Self {
        self.cosign_timeout = timeout;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    /// Unsigned transaction with the two roles filled in.
    pub fn build(&self, sender: &str, gas_owner: &str, operation: Operation) -> TransactionData {
        TransactionData {
            package: self.package_id.clone(),
            sender: sender.to_string(),
            gas_owner: gas_owner.to_string(),
            gas_budget: self.gas_budget,
            operation,
        }
    }

    /// Collect the gas payer's signature, bounded by the co-sign timeout.
    pub async fn cosign(
        &self,
        presigned: PresignedTransaction,
        gas_payer: &dyn CoSigner,
    ) -> Result<SignedTransaction, SettlementError> {
        if normalize_address(gas_payer.address()) != normalize_address(&presigned.data.gas_owner) {
            return Err(SettlementError::SignerMismatch {
                role: Role::GasPayer,
                expected: presigned.data.gas_owner.clone(),
                actual: gas_payer.address().to_string(),
            });
        }

        let signature = match tokio::time::timeout(self.cosign_timeout, gas_payer.co_sign(&presigned)).await {
            Ok(Ok(sig)) => sig,
            Ok(Err(e)) => {
                return Err(SettlementError::SignatureUnavailable {
                    role: Role::GasPayer,
                    reason: format!("{e:#}"),
                })
            }
            Err(_) => {
                return Err(SettlementError::SignatureUnavailable {
                    role: Role::GasPayer,
                    reason: format!("no response within {:?}", self.cosign_timeout),
                })
            }
        };

        presigned.attach_gas_signature(signature)
    }

    /// Submit a fully signed transaction. Success is read from the reported
    /// status, never inferred from the absence of an error.
    pub async fn submit(&self, tx: &SignedTransaction) -> Result<SettlementReceipt, SettlementError> {
        tx.verify()
            .map_err(|e| SettlementError::InvalidRequest(format!("{e:#}")))?;

        let result = self
            .ledger
            .execute(tx)
            .await
            .map_err(SettlementError::Ledger)?;

        match result.status {
            ExecutionStatus::Success => {
                debug!("Transaction {} succeeded", result.digest);
                Ok(SettlementReceipt {
                    digest: result.digest,
                    events: result.events,
                })
            }
            ExecutionStatus::Conflict { error } => Err(SettlementError::Conflict(error)),
            ExecutionStatus::Failure { error } => Err(SettlementError::ExecutionFailed {
                digest: result.digest,
                error,
            }),
        }
    }

    /// Run the whole protocol for one operation.
    pub async fn settle(
        &self,
        sender: &Wallet,
        gas_payer: &dyn CoSigner,
        operation: Operation,
    ) -> Result<SettlementReceipt, SettlementError> {
        let entry_point = operation.entry_point();
        let data = self.build(&sender.address, gas_payer.address(), operation);
        let presigned = PresignedTransaction::sign(data, sender)?;

        let signed = if presigned.data.is_sponsored() {
            self.cosign(presigned, gas_payer).await?
        } else {
            presigned.into_self_paid()
        };

        let receipt = self.submit(&signed).await?;
        info!("Settled {} ({})", entry_point, receipt.digest);
        Ok(receipt)
    }

    /// Single principal pays for its own operation.
    pub async fn execute_as(
        &self,
        signer: &Wallet,
        operation: Operation,
    ) -> Result<SettlementReceipt, SettlementError> {
        self.settle(signer, signer, operation).await
    }

    /// Build and pre-sign an account action for an external gas payer
    /// (e.g. an end-user wallet) to co-sign out of band.
    pub async fn prepare(
        &self,
        sender: &Wallet,
        account_id: &str,
        action: &AccountAction,
        gas_owner: &str,
    ) -> Result<PresignedTransaction, SettlementError> {
        let account = self
            .ledger
            .agent_account(account_id)
            .await
            .map_err(SettlementError::Ledger)?;
        let operation = action.to_operation(&account)?;
        PresignedTransaction::sign(self.build(&sender.address, gas_owner, operation), sender)
    }

    /// Apply an account action, rebuilding against the fresh object version
    /// when a concurrent writer got there first.
    pub async fn settle_account(
        &self,
        sender: &Wallet,
        account_id: &str,
        action: &AccountAction,
        gas_payer: &dyn CoSigner,
    ) -> Result<SettlementReceipt, SettlementError> {
        let mut attempt: u32 = 0;
        loop {
            let account = self
                .ledger
                .agent_account(account_id)
                .await
                .map_err(SettlementError::Ledger)?;
            let operation = action.to_operation(&account)?;

            match self.settle(sender, gas_payer, operation).await {
                Err(SettlementError::Conflict(error)) if attempt < self.conflict_retries => {
                    attempt += 1;
                    warn!(
                        "Conflict on {} (attempt {}/{}): {}",
                        account_id, attempt, self.conflict_retries, error
                    );
                }
                other => return other,
            }
        }
    }

    pub async fn withdraw(
        &self,
        agent: &Wallet,
        account_id: &str,
        amount: u64,
        recipient: &str,
        gas_payer: &dyn CoSigner,
    ) -> Result<SettlementReceipt, SettlementError> {
        let action = AccountAction::Withdraw {
            amount,
            recipient: recipient.to_string(),
        };
        self.settle_account(agent, account_id, &action, gas_payer).await
    }

    pub async fn deposit(
        &self,
        depositor: &Wallet,
        account_id: &str,
        amount: u64,
        gas_payer: &dyn CoSigner,
    ) -> Result<SettlementReceipt, SettlementError> {
        self.settle_account(depositor, account_id, &AccountAction::Deposit { amount }, gas_payer)
            .await
    }

    pub async fn update_configuration(
        &self,
        agent: &Wallet,
        account_id: &str,
        configuration: &[u8],
        gas_payer: &dyn CoSigner,
    ) -> Result<SettlementReceipt, SettlementError> {
        let action = AccountAction::Configure {
            configuration: configuration.to_vec(),
        };
        self.settle_account(agent, account_id, &action, gas_payer).await
    }

    pub async fn update_memory_pointer(
        &self,
        agent: &Wallet,
        account_id: &str,
        memory_pointer: Option<&str>,
        gas_payer: &dyn CoSigner,
    ) -> Result<SettlementReceipt, SettlementError> {
        let action = AccountAction::SetMemoryPointer {
            memory_pointer: memory_pointer.map(str::to_string),
        };
        self.settle_account(agent, account_id, &action, gas_payer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const ACCOUNT: &str = "0xacct";

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        protocol: SettlementProtocol,
        agent: Wallet,
        sponsor: Wallet,
    }

    fn fixture(balance: u64) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let agent = Wallet::generate();
        ledger.insert_account(
            AgentAccount {
                object_id: ACCOUNT.into(),
                version: 1,
                balance,
                configuration: vec![],
                memory_pointer: None,
                admin_cap_id: Some("0xcap".into()),
            },
            &agent.address,
        );
        let protocol = SettlementProtocol::new(ledger.clone(), "0xpkg", 1_000)
            .with_cosign_timeout(Duration::from_millis(200));
        Fixture {
            ledger,
            protocol,
            agent,
            sponsor: Wallet::generate(),
        }
    }

    fn balance(f: &Fixture) -> u64 {
        f.ledger.account(ACCOUNT).unwrap().balance
    }

    struct Unreachable(String);

    #[async_trait]
    impl CoSigner for Unreachable {
        fn address(&self) -> &str {
            &self.0
        }
        async fn co_sign(&self, _tx: &PresignedTransaction) -> anyhow::Result<String> {
            bail!("connection refused")
        }
    }

    struct Silent(String);

    #[async_trait]
    impl CoSigner for Silent {
        fn address(&self) -> &str {
            &self.0
        }
        async fn co_sign(&self, _tx: &PresignedTransaction) -> anyhow::Result<String> {
            std::future::pending().await
        }
    }

    /// Claims one address but signs with another key.
    struct Impostor {
        claimed: String,
        key: Wallet,
    }

    #[async_trait]
    impl CoSigner for Impostor {
        fn address(&self) -> &str {
            &self.claimed
        }
        async fn co_sign(&self, tx: &PresignedTransaction) -> anyhow::Result<String> {
            self.key.sign_transaction(&tx.tx_bytes)
        }
    }

    /// Lets a concurrent deposit land before signing the first request.
    struct Racing {
        key: Wallet,
        depositor: Wallet,
        ledger: Arc<InMemoryLedger>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl CoSigner for Racing {
        fn address(&self) -> &str {
            &self.key.address
        }
        async fn co_sign(&self, tx: &PresignedTransaction) -> anyhow::Result<String> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let account = self.ledger.account(ACCOUNT).unwrap();
                let data = TransactionData {
                    package: "0xpkg".into(),
                    sender: self.depositor.address.clone(),
                    gas_owner: self.depositor.address.clone(),
                    gas_budget: 1_000,
                    operation: Operation::Deposit {
                        account: account.object_ref(),
                        amount: 7,
                    },
                };
                let bytes = data.to_bytes()?;
                let deposit = SignedTransaction {
                    signatures: vec![self.depositor.sign_transaction(&bytes)?],
                    tx_bytes: bytes,
                };
                assert!(self.ledger.execute(&deposit).await?.is_success());
            }
            self.key.sign_transaction(&tx.tx_bytes)
        }
    }

    #[tokio::test]
    async fn sponsored_withdrawal_moves_funds() {
        let f = fixture(500_000);
        let receipt = f
            .protocol
            .withdraw(&f.agent, ACCOUNT, 200_000, "0xfee", &f.sponsor)
            .await
            .unwrap();

        assert!(!receipt.digest.is_empty());
        assert_eq!(balance(&f), 300_000);
        assert_eq!(f.ledger.received_by("0xfee"), 200_000);

        let applied = f.ledger.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].sender, f.agent.address);
        assert_eq!(applied[0].gas_owner, f.sponsor.address);
    }

    #[tokio::test]
    async fn overdraft_is_rejected_before_submission() {
        let f = fixture(500_000);
        let err = f
            .protocol
            .withdraw(&f.agent, ACCOUNT, 1_000_000, "0xfee", &f.sponsor)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::InsufficientBalance {
                requested: 1_000_000,
                available: 500_000
            }
        ));
        assert_eq!(balance(&f), 500_000);
        assert!(f.ledger.applied().is_empty());
    }

    #[tokio::test]
    async fn overdraft_that_reaches_the_ledger_reports_failure_status() {
        let f = fixture(500_000);
        let account = f.ledger.account(ACCOUNT).unwrap();
        let data = f.protocol.build(
            &f.agent.address,
            &f.sponsor.address,
            Operation::Withdraw {
                account: account.object_ref(),
                admin_cap: "0xcap".into(),
                amount: 1_000_000,
                recipient: "0xfee".into(),
            },
        );
        let presigned = PresignedTransaction::sign(data, &f.agent).unwrap();
        let signed = f.protocol.cosign(presigned, &f.sponsor).await.unwrap();

        let err = f.protocol.submit(&signed).await.unwrap_err();
        match err {
            SettlementError::ExecutionFailed { error, .. } => {
                assert!(error.contains("EInsufficientBalance"), "{error}")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(balance(&f), 500_000);
    }

    #[tokio::test]
    async fn unreachable_cosigner_leaves_balance_untouched() {
        let f = fixture(500_000);
        let before = f.ledger.account(ACCOUNT).unwrap();
        let sponsor = Unreachable("0xsponsor".into());

        let err = f
            .protocol
            .withdraw(&f.agent, ACCOUNT, 1_000, "0xfee", &sponsor)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::SignatureUnavailable {
                role: Role::GasPayer,
                ..
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(f.ledger.account(ACCOUNT).unwrap(), before);
    }

    #[tokio::test]
    async fn silent_cosigner_times_out() {
        let f = fixture(500_000);
        let err = f
            .protocol
            .withdraw(&f.agent, ACCOUNT, 1_000, "0xfee", &Silent("0xsponsor".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::SignatureUnavailable { .. }));
        assert_eq!(balance(&f), 500_000);
    }

    #[tokio::test]
    async fn cosignature_from_wrong_key_is_refused() {
        let f = fixture(500_000);
        let impostor = Impostor {
            claimed: f.sponsor.address.clone(),
            key: Wallet::generate(),
        };
        let err = f
            .protocol
            .withdraw(&f.agent, ACCOUNT, 1_000, "0xfee", &impostor)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SettlementError::SignerMismatch {
                role: Role::GasPayer,
                ..
            }
        ));
        assert_eq!(balance(&f), 500_000);
    }

    #[tokio::test]
    async fn only_the_cap_holder_can_withdraw() {
        let f = fixture(500_000);
        let stranger = Wallet::generate();
        let err = f
            .protocol
            .withdraw(&stranger, ACCOUNT, 1_000, "0xfee", &f.sponsor)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::ExecutionFailed { .. }));
        assert_eq!(balance(&f), 500_000);
    }

    #[tokio::test]
    async fn stale_version_is_rebuilt_and_retried() {
        let f = fixture(500_000);
        let racing = Racing {
            key: f.sponsor.clone(),
            depositor: Wallet::generate(),
            ledger: f.ledger.clone(),
            raced: AtomicBool::new(false),
        };

        f.protocol
            .withdraw(&f.agent, ACCOUNT, 100_000, "0xfee", &racing)
            .await
            .unwrap();

        assert_eq!(balance(&f), 400_007);
        assert_eq!(f.ledger.applied().len(), 2);
    }

    #[tokio::test]
    async fn conflict_surfaces_when_retries_are_exhausted() {
        let mut f = fixture(500_000);
        f.protocol = SettlementProtocol::new(f.ledger.clone(), "0xpkg", 1_000).with_conflict_retries(0);
        let racing = Racing {
            key: f.sponsor.clone(),
            depositor: Wallet::generate(),
            ledger: f.ledger.clone(),
            raced: AtomicBool::new(false),
        };

        let err = f
            .protocol
            .withdraw(&f.agent, ACCOUNT, 100_000, "0xfee", &racing)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Conflict(_)));
        assert_eq!(balance(&f), 500_007);
    }

    #[tokio::test]
    async fn configuration_and_memory_pointer_updates() {
        let f = fixture(0);
        f.protocol
            .update_configuration(&f.agent, ACCOUNT, b"{\"persona\":\"owl\"}", &f.sponsor)
            .await
            .unwrap();
        f.protocol
            .update_memory_pointer(&f.agent, ACCOUNT, Some("bafy123"), &f.sponsor)
            .await
            .unwrap();

        let account = f.ledger.account(ACCOUNT).unwrap();
        assert_eq!(account.configuration, b"{\"persona\":\"owl\"}".to_vec());
        assert_eq!(account.memory_pointer.as_deref(), Some("bafy123"));
        assert_eq!(account.version, 3);
    }

    #[tokio::test]
    async fn prepared_transaction_can_be_cosigned_out_of_band() {
        let f = fixture(0);
        let wallet_user = Wallet::generate();
        let presigned = f
            .protocol
            .prepare(
                &wallet_user,
                ACCOUNT,
                &AccountAction::Deposit { amount: 900 },
                &f.sponsor.address,
            )
            .await
            .unwrap();

        // The bytes travel to the sponsor and only a signature comes back.
        let wire = presigned.tx_bytes_base64();
        let sponsor_bytes = BASE64.decode(wire).unwrap();
        let sponsor_sig = f.sponsor.sign_transaction(&sponsor_bytes).unwrap();

        let signed = presigned.attach_gas_signature(sponsor_sig).unwrap();
        f.protocol.submit(&signed).await.unwrap();
        assert_eq!(balance(&f), 900);
    }

    #[tokio::test]
    async fn zero_withdrawal_is_refused() {
        let f = fixture(10);
        let err = f
            .protocol
            .withdraw(&f.agent, ACCOUNT, 0, "0xfee", &f.sponsor)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidRequest(_)));
    }
}
