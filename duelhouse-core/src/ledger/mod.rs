pub mod rollup;

pub use rollup::{HttpRollup, RollupClient};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::types::TxConfirmation;
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Wallet and escrow addresses are 64 lowercase hex characters.
pub fn is_valid_wallet_address(address: &str) -> bool {
    address.len() == 64
        && address
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Raw ledger node RPC. The gateway wraps this with polling and
/// address/transaction derivation.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Point-in-time view of a transaction; `exists == false` when the
    /// ledger has never seen it.
    async fn transaction_status(&self, tx_ref: &str) -> Result<TxConfirmation>;

    /// Submits the payout batch for a session and returns the settlement
    /// transaction reference. Idempotent per session on the ledger side.
    async fn submit_payouts(
        &self,
        session_id: Uuid,
        payouts: &HashMap<String, u64>,
    ) -> Result<String>;

    /// Returns a single deposit to its wallet.
    async fn refund(&self, session_id: Uuid, wallet: &str, amount: u64) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TxRefResponse {
    tx_ref: String,
}

/// JSON-over-HTTP ledger node client.
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LedgerRpc for HttpLedger {
    async fn transaction_status(&self, tx_ref: &str) -> Result<TxConfirmation> {
        let url = format!("{}/tx/{}", self.base_url, tx_ref);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoordinatorError::ledger(format!("Failed to reach ledger: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(TxConfirmation {
                exists: false,
                finalized: false,
                amount: 0,
                sender: String::new(),
            });
        }

        if !response.status().is_success() {
            return Err(CoordinatorError::ledger(format!(
                "Ledger returned {} for {}",
                response.status(),
                tx_ref
            )));
        }

        response
            .json::<TxConfirmation>()
            .await
            .map_err(|e| CoordinatorError::ledger(format!("Bad ledger response: {}", e)))
    }

    async fn submit_payouts(
        &self,
        session_id: Uuid,
        payouts: &HashMap<String, u64>,
    ) -> Result<String> {
        let url = format!("{}/settlements", self.base_url);
        let body = serde_json::json!({
            "session_id": session_id,
            "payouts": payouts,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoordinatorError::ledger(format!("Failed to reach ledger: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoordinatorError::ledger(format!(
                "Ledger rejected settlement for {}: {}",
                session_id,
                response.status()
            )));
        }

        let parsed: TxRefResponse = response
            .json()
            .await
            .map_err(|e| CoordinatorError::ledger(format!("Bad ledger response: {}", e)))?;
        Ok(parsed.tx_ref)
    }

    async fn refund(&self, session_id: Uuid, wallet: &str, amount: u64) -> Result<String> {
        let url = format!("{}/refunds", self.base_url);
        let body = serde_json::json!({
            "session_id": session_id,
            "wallet": wallet,
            "amount": amount,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoordinatorError::ledger(format!("Failed to reach ledger: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoordinatorError::ledger(format!(
                "Ledger rejected refund for {}: {}",
                wallet,
                response.status()
            )));
        }

        let parsed: TxRefResponse = response
            .json()
            .await
            .map_err(|e| CoordinatorError::ledger(format!("Bad ledger response: {}", e)))?;
        Ok(parsed.tx_ref)
    }
}

/// Escrow gateway: address and funding-transaction derivation are pure,
/// confirmation polls the node with a bounded budget.
pub struct LedgerGateway {
    rpc: Arc<dyn LedgerRpc>,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl LedgerGateway {
    pub fn new(rpc: Arc<dyn LedgerRpc>, config: &CoordinatorConfig) -> Self {
        Self {
            rpc,
            confirm_timeout: Duration::from_millis(config.confirm_timeout_ms),
            poll_interval: Duration::from_millis(config.confirm_poll_interval_ms),
        }
    }

    /// Escrow address for a session. Pure function of the id, no network.
    pub fn derive_escrow_address(session_id: Uuid) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"duelhouse/escrow");
        hasher.update(session_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Deterministic unsigned funding transaction descriptor. The client
    /// signs and broadcasts it, then hands back the broadcast reference.
    pub fn build_funding_transaction(
        &self,
        wallet: &str,
        amount: u64,
        escrow_address: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"duelhouse/fund");
        hasher.update(wallet.as_bytes());
        hasher.update(amount.to_le_bytes());
        hasher.update(escrow_address.as_bytes());
        format!("utx_{}", hex::encode(hasher.finalize()))
    }

    /// Polls the ledger until the transaction is finalized or the budget
    /// runs out. A transaction the ledger has seen but not finalized yet
    /// surfaces as a timeout so the caller can retry.
    pub async fn confirm_transaction(&self, tx_ref: &str) -> Result<TxConfirmation> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;
        let mut seen = false;

        loop {
            let status = self.rpc.transaction_status(tx_ref).await?;
            if status.exists && status.finalized {
                return Ok(status);
            }
            seen = seen || status.exists;

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        if seen {
            Err(CoordinatorError::timeout(format!(
                "Transaction {} not finalized within poll budget",
                tx_ref
            )))
        } else {
            Err(CoordinatorError::TransactionNotFound(tx_ref.to_string()))
        }
    }

    pub async fn submit_payouts(
        &self,
        session_id: Uuid,
        payouts: &HashMap<String, u64>,
    ) -> Result<String> {
        self.rpc.submit_payouts(session_id, payouts).await
    }

    pub async fn refund(&self, session_id: Uuid, wallet: &str, amount: u64) -> Result<String> {
        self.rpc.refund(session_id, wallet, amount).await
    }
}

#[cfg(test)]
pub struct MockLedger {
    txs: parking_lot::Mutex<HashMap<String, TxConfirmation>>,
    submitted: parking_lot::Mutex<Vec<(Uuid, HashMap<String, u64>)>>,
    refunded: parking_lot::Mutex<Vec<(Uuid, String, u64)>>,
    fail_payouts: parking_lot::Mutex<u32>,
    fail_refunds: parking_lot::Mutex<u32>,
}

#[cfg(test)]
impl MockLedger {
    pub fn new() -> Self {
        Self {
            txs: parking_lot::Mutex::new(HashMap::new()),
            submitted: parking_lot::Mutex::new(Vec::new()),
            refunded: parking_lot::Mutex::new(Vec::new()),
            fail_payouts: parking_lot::Mutex::new(0),
            fail_refunds: parking_lot::Mutex::new(0),
        }
    }

    /// Scripts a finalized deposit the coordinator can confirm.
    pub fn script_deposit(&self, tx_ref: &str, sender: &str, amount: u64) {
        self.script_status(
            tx_ref,
            TxConfirmation {
                exists: true,
                finalized: true,
                amount,
                sender: sender.to_string(),
            },
        );
    }

    pub fn script_status(&self, tx_ref: &str, status: TxConfirmation) {
        self.txs.lock().insert(tx_ref.to_string(), status);
    }

    /// The next `n` payout submissions will fail.
    pub fn fail_next_payouts(&self, n: u32) {
        *self.fail_payouts.lock() = n;
    }

    pub fn fail_next_refunds(&self, n: u32) {
        *self.fail_refunds.lock() = n;
    }

    pub fn payout_submissions(&self) -> Vec<(Uuid, HashMap<String, u64>)> {
        self.submitted.lock().clone()
    }

    pub fn refunds_issued(&self) -> Vec<(Uuid, String, u64)> {
        self.refunded.lock().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl LedgerRpc for MockLedger {
    async fn transaction_status(&self, tx_ref: &str) -> Result<TxConfirmation> {
        Ok(self.txs.lock().get(tx_ref).cloned().unwrap_or(TxConfirmation {
            exists: false,
            finalized: false,
            amount: 0,
            sender: String::new(),
        }))
    }

    async fn submit_payouts(
        &self,
        session_id: Uuid,
        payouts: &HashMap<String, u64>,
    ) -> Result<String> {
        {
            let mut remaining = self.fail_payouts.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CoordinatorError::ledger("Scripted payout failure"));
            }
        }
        self.submitted.lock().push((session_id, payouts.clone()));
        Ok(format!("settle_{}", session_id.simple()))
    }

    async fn refund(&self, session_id: Uuid, wallet: &str, amount: u64) -> Result<String> {
        {
            let mut remaining = self.fail_refunds.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CoordinatorError::ledger("Scripted refund failure"));
            }
        }
        self.refunded
            .lock()
            .push((session_id, wallet.to_string(), amount));
        Ok(format!("refund_{}_{}", session_id.simple(), wallet))
    }
}
