//! Ledger wire types and the transport seam.
//!
//! The engine targets an XRPL-family ledger: escrow operations are
//! submitted as JSON transactions with PascalCase field names, amounts are
//! drop strings, and times are seconds since the ripple epoch
//! (2000-01-01T00:00:00Z).

mod gateway;
mod rpc;

pub use gateway::LedgerGateway;
pub use rpc::JsonRpcLedger;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::signing::SignedTx;

/// Seconds between the Unix epoch and the ripple epoch.
pub const RIPPLE_EPOCH_OFFSET: i64 = 946_684_800;

/// Fallback cancel-after horizon for milestones without a deadline.
pub const DEFAULT_CANCEL_AFTER_DAYS: i64 = 365;

/// Convert a wall-clock time to ripple-epoch seconds.
pub fn to_ripple_time(t: DateTime<Utc>) -> i64 {
    t.timestamp() - RIPPLE_EPOCH_OFFSET
}

/// Current ledger time (ripple epoch seconds).
pub fn ripple_now() -> i64 {
    to_ripple_time(Utc::now())
}

/// Cancel-after for a milestone: its deadline, or one year out.
pub fn cancel_after_for(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    to_ripple_time(deadline.unwrap_or(now + Duration::days(DEFAULT_CANCEL_AFTER_DAYS)))
}

// ─────────────────────────────────────────────────────────
// Transaction shapes
// ─────────────────────────────────────────────────────────

/// The three escrow operations, serialized in the ledger's native JSON
/// shape (`TransactionType` tag, PascalCase fields, drop-string amounts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "TransactionType")]
pub enum EscrowTx {
    #[serde(rename_all = "PascalCase")]
    EscrowCreate {
        account: String,
        /// Amount in drops, as a decimal string.
        amount: String,
        destination: String,
        cancel_after: i64,
        condition: String,
    },
    #[serde(rename_all = "PascalCase")]
    EscrowFinish {
        account: String,
        owner: String,
        offer_sequence: u32,
        condition: String,
        fulfillment: String,
    },
    #[serde(rename_all = "PascalCase")]
    EscrowCancel {
        account: String,
        owner: String,
        offer_sequence: u32,
    },
}

impl EscrowTx {
    /// The submitting account, which the gateway serializes on.
    pub fn account(&self) -> &str {
        match self {
            Self::EscrowCreate { account, .. }
            | Self::EscrowFinish { account, .. }
            | Self::EscrowCancel { account, .. } => account,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::EscrowCreate { .. } => "EscrowCreate",
            Self::EscrowFinish { .. } => "EscrowFinish",
            Self::EscrowCancel { .. } => "EscrowCancel",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────

/// A validated transaction.
///
/// `created_sequence` is the sequence of the escrow object a successful
/// create produced, decoded strictly from the transaction metadata. It is
/// `None` for finish/cancel and for any create whose metadata carried no
/// escrow node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxConfirmation {
    pub tx_hash: String,
    pub result_code: String,
    pub created_sequence: Option<u32>,
}

/// Outcome of a by-hash status query.
#[derive(Debug, Clone)]
pub enum TxLookup {
    /// The transaction is in a validated ledger and succeeded.
    Validated(TxConfirmation),
    /// The transaction is in a validated ledger and failed.
    Failed { code: String, message: String },
    /// The node has no record of the transaction.
    NotFound,
}

/// Transport seam to the ledger node.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Submit a signed transaction and block until it reaches a validated
    /// ledger, a definitive rejection, or the configured timeout
    /// (`LedgerUnknown`).
    async fn submit_and_wait(&self, signed: &SignedTx) -> Result<TxConfirmation>;

    /// Definitive status query by transaction hash.
    async fn lookup(&self, tx_hash: &str) -> Result<TxLookup>;

    /// Whether an escrow object exists for `owner` at `sequence`.
    async fn escrow_exists(&self, owner: &str, sequence: u32) -> Result<bool>;
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
