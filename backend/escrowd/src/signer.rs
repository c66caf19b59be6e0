//! Node-backed signing provider.
//!
//! Signing is delegated to the ledger node's `sign` RPC so key custody
//! stays with the node operator. Persistent funding accounts register
//! their secret at startup from configuration; ephemeral ones are created
//! on demand through the test-network faucet and registered for the
//! process lifetime. Either way the funding saga sees one capability.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use escrow_engine::errors::{EngineError, Result as EngineResult};
use escrow_engine::ledger::EscrowTx;
use escrow_engine::signing::{FundingAccount, FundingSource, SignedTx, SigningProvider};

// ─────────────────────────────────────────────────────────
// RPC / faucet response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct SignResult {
    tx_blob: Option<String>,
    tx_json: Option<SignedTxJson>,
    error: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignedTxJson {
    hash: Option<String>,
    #[serde(rename = "Sequence")]
    sequence: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FaucetResponse {
    account: FaucetAccount,
}

#[derive(Debug, Deserialize)]
struct FaucetAccount {
    #[serde(alias = "classicAddress", alias = "address")]
    classic_address: String,
    secret: String,
}

// ─────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────

pub struct NodeSigner {
    client: Client,
    rpc_url: String,
    faucet_url: String,
    /// address → signing secret, for every account this process may use.
    keys: Mutex<HashMap<String, String>>,
}

impl NodeSigner {
    pub fn new(client: Client, rpc_url: String, faucet_url: String) -> Self {
        Self {
            client,
            rpc_url,
            faucet_url,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Register a persistent account's secret (from configuration).
    pub fn register(&self, address: &str, secret: &str) {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.insert(address.to_string(), secret.to_string());
    }

    fn secret_for(&self, address: &str) -> EngineResult<String> {
        let keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.get(address).cloned().ok_or_else(|| {
            EngineError::Signing(format!("no signing key registered for {address}"))
        })
    }

    /// Create and fund a throwaway account via the faucet.
    async fn faucet_account(&self) -> EngineResult<FundingAccount> {
        let resp = self
            .client
            .post(&self.faucet_url)
            .json(&json!({}))
            .send()
            .await?;
        let body: FaucetResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Decode(format!("faucet response: {e}")))?;
        let address = body.account.classic_address;
        self.register(&address, &body.account.secret);
        info!(address, "ephemeral funding account created");
        Ok(FundingAccount { address })
    }
}

#[async_trait]
impl SigningProvider for NodeSigner {
    async fn acquire(&self, source: &FundingSource) -> EngineResult<FundingAccount> {
        match source {
            FundingSource::Persistent { address } => {
                // Fail fast if the key is missing; the saga has not
                // touched the ledger yet.
                self.secret_for(address)?;
                Ok(FundingAccount {
                    address: address.clone(),
                })
            }
            FundingSource::Ephemeral => self.faucet_account().await,
        }
    }

    async fn sign(&self, account: &str, tx: &EscrowTx) -> EngineResult<SignedTx> {
        let secret = self.secret_for(account)?;
        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "method": "sign",
                "params": [{
                    "tx_json": tx,
                    "secret": secret,
                    "offline": false,
                }],
            }))
            .send()
            .await?;
        let body: RpcResponse<SignResult> = resp.json().await?;
        let result = body.result;

        if let Some(err) = result.error {
            return Err(EngineError::Signing(format!(
                "{err}: {}",
                result.error_message.unwrap_or_default()
            )));
        }
        let tx_blob = result
            .tx_blob
            .ok_or_else(|| EngineError::Signing("sign response without tx_blob".into()))?;
        let tx_json = result
            .tx_json
            .ok_or_else(|| EngineError::Signing("sign response without tx_json".into()))?;
        let tx_hash = tx_json
            .hash
            .ok_or_else(|| EngineError::Signing("signed transaction without hash".into()))?;
        let sequence = tx_json
            .sequence
            .ok_or_else(|| EngineError::Signing("signed transaction without sequence".into()))?;

        Ok(SignedTx {
            tx_blob,
            tx_hash,
            sequence,
        })
    }
}
