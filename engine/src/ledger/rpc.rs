//! JSON-RPC ledger client — submits signed transactions and resolves their
//! final outcome.
//!
//! ## Outcome discipline
//!
//! * Preliminary codes that can never reach a validated ledger (`tem`/`tef`/
//!   `tej`) are surfaced immediately as [`EngineError::LedgerRejected`].
//! * Everything else is polled via `tx` until the transaction appears in a
//!   validated ledger or the submit timeout elapses, which yields
//!   [`EngineError::LedgerUnknown`] — the caller must resolve via
//!   [`LedgerRpc::lookup`] before retrying a non-idempotent operation.
//! * Transient transport errors during polling are retried silently with
//!   exponential back-off, bounded by the same timeout.
//!
//! Transaction metadata is decoded into typed structs; the created-escrow
//! sequence is an explicit optional field rather than a loosely-typed walk
//! over the metadata tree.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{LedgerRpc, TxConfirmation, TxLookup};
use crate::errors::{EngineError, Result};
use crate::signing::SignedTx;

const INITIAL_POLL_BACKOFF_MS: u64 = 250;
const MAX_POLL_BACKOFF_MS: u64 = 4_000;

/// Result code of a transaction accepted into a validated ledger with full
/// success.
const RESULT_SUCCESS: &str = "tesSUCCESS";

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    engine_result: Option<String>,
    engine_result_message: Option<String>,
    error: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TxStatusResult {
    error: Option<String>,
    #[serde(default)]
    validated: bool,
    meta: Option<TxMeta>,
}

#[derive(Debug, Deserialize)]
struct TxMeta {
    #[serde(rename = "TransactionResult")]
    transaction_result: String,
    #[serde(rename = "AffectedNodes", default)]
    affected_nodes: Vec<AffectedNode>,
}

#[derive(Debug, Default, Deserialize)]
struct AffectedNode {
    #[serde(rename = "CreatedNode")]
    created_node: Option<CreatedNode>,
}

#[derive(Debug, Deserialize)]
struct CreatedNode {
    #[serde(rename = "LedgerEntryType")]
    ledger_entry_type: String,
    #[serde(rename = "NewFields")]
    new_fields: Option<NewFields>,
}

#[derive(Debug, Deserialize)]
struct NewFields {
    #[serde(rename = "Sequence")]
    sequence: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LedgerEntryResult {
    error: Option<String>,
    node: Option<serde_json::Value>,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

/// Reqwest-backed [`LedgerRpc`] implementation.
pub struct JsonRpcLedger {
    client: Client,
    url: String,
    submit_timeout: Duration,
    poll_interval: Duration,
}

impl JsonRpcLedger {
    pub fn new(client: Client, url: String, submit_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            client,
            url,
            submit_timeout,
            poll_interval,
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "method": method, "params": [params] }))
            .send()
            .await?;
        let body: RpcResponse<T> = resp.json().await?;
        Ok(body.result)
    }
}

#[async_trait]
impl LedgerRpc for JsonRpcLedger {
    async fn submit_and_wait(&self, signed: &SignedTx) -> Result<TxConfirmation> {
        let submit: SubmitResult = match self
            .call("submit", json!({ "tx_blob": signed.tx_blob }))
            .await
        {
            Ok(r) => r,
            // The request may have reached the node before the connection
            // died; the transaction cannot be assumed unsubmitted.
            Err(e) => {
                warn!(tx_hash = %signed.tx_hash, "submit transport failure: {e}");
                return Err(EngineError::LedgerUnknown {
                    tx_hash: signed.tx_hash.clone(),
                    sequence: signed.sequence,
                });
            }
        };

        if let Some(err) = submit.error {
            return Err(EngineError::LedgerRejected {
                code: err,
                message: submit.error_message.unwrap_or_default(),
            });
        }
        let code = submit
            .engine_result
            .ok_or_else(|| EngineError::Decode("submit response without engine_result".into()))?;
        if is_preliminary_rejection(&code) {
            return Err(EngineError::LedgerRejected {
                code,
                message: submit.engine_result_message.unwrap_or_default(),
            });
        }
        debug!(tx_hash = %signed.tx_hash, code, "submitted, awaiting validation");

        // Poll until validated or the timeout elapses.
        let deadline = tokio::time::Instant::now() + self.submit_timeout;
        let mut backoff = INITIAL_POLL_BACKOFF_MS;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            match self.lookup(&signed.tx_hash).await {
                Ok(TxLookup::Validated(conf)) => return Ok(conf),
                Ok(TxLookup::Failed { code, message }) => {
                    return Err(EngineError::LedgerRejected { code, message })
                }
                Ok(TxLookup::NotFound) => {}
                Err(e) => {
                    warn!(tx_hash = %signed.tx_hash, "poll failed (will retry in {backoff}ms): {e}");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_POLL_BACKOFF_MS);
                }
            }
        }
        Err(EngineError::LedgerUnknown {
            tx_hash: signed.tx_hash.clone(),
            sequence: signed.sequence,
        })
    }

    async fn lookup(&self, tx_hash: &str) -> Result<TxLookup> {
        let status: TxStatusResult = self
            .call("tx", json!({ "transaction": tx_hash, "binary": false }))
            .await?;
        decode_tx_status(tx_hash, status)
    }

    async fn escrow_exists(&self, owner: &str, sequence: u32) -> Result<bool> {
        let entry: LedgerEntryResult = self
            .call(
                "ledger_entry",
                json!({
                    "escrow": { "owner": owner, "seq": sequence },
                    "ledger_index": "validated",
                }),
            )
            .await?;
        match entry.error.as_deref() {
            Some("entryNotFound") => Ok(false),
            Some(other) => Err(EngineError::Decode(format!(
                "ledger_entry error for {owner}/{sequence}: {other}"
            ))),
            None => Ok(entry.node.is_some()),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────

/// Preliminary codes that can never be included in a validated ledger.
fn is_preliminary_rejection(code: &str) -> bool {
    code.starts_with("tem") || code.starts_with("tef") || code.starts_with("tej")
}

fn decode_tx_status(tx_hash: &str, status: TxStatusResult) -> Result<TxLookup> {
    if let Some(err) = status.error {
        return if err == "txnNotFound" {
            Ok(TxLookup::NotFound)
        } else {
            Err(EngineError::Decode(format!(
                "tx lookup error for {tx_hash}: {err}"
            )))
        };
    }
    if !status.validated {
        return Ok(TxLookup::NotFound);
    }
    let meta = status
        .meta
        .ok_or_else(|| EngineError::Decode(format!("validated tx {tx_hash} without metadata")))?;
    if meta.transaction_result == RESULT_SUCCESS {
        let created_sequence = created_escrow_sequence(&meta);
        Ok(TxLookup::Validated(TxConfirmation {
            tx_hash: tx_hash.to_string(),
            result_code: meta.transaction_result,
            created_sequence,
        }))
    } else {
        Ok(TxLookup::Failed {
            code: meta.transaction_result,
            message: String::new(),
        })
    }
}

/// Sequence of the escrow object created by this transaction, if any.
fn created_escrow_sequence(meta: &TxMeta) -> Option<u32> {
    meta.affected_nodes
        .iter()
        .filter_map(|n| n.created_node.as_ref())
        .find(|c| c.ledger_entry_type == "Escrow")
        .and_then(|c| c.new_fields.as_ref())
        .and_then(|f| f.sequence)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
