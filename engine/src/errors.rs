//! Engine-wide error types.
//!
//! The taxonomy follows the failure surfaces of the funding saga: local
//! validation, permanent ledger rejection, unresolved ledger timeout,
//! off-chain persistence, and the policy-level rejections that carry no
//! side effects (`AlreadyFunding`, `NotYetExpired`).

use thiserror::Error;

use crate::model::GoalId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input, rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The ledger definitively rejected the transaction. Permanent —
    /// surfaced verbatim and never retried automatically.
    #[error("ledger rejected transaction ({code}): {message}")]
    LedgerRejected { code: String, message: String },

    /// The submission timed out before the ledger reported a final
    /// outcome. A create in this state must be resolved through a status
    /// query before any retry; finish/cancel may be retried directly.
    /// Carries the signed transaction's account sequence so the outcome
    /// can also be resolved by owner + sequence.
    #[error("ledger outcome unknown for transaction {tx_hash}")]
    LedgerUnknown { tx_hash: String, sequence: u32 },

    /// The presented fulfillment does not hash to the stored condition.
    /// Raised locally, before submission.
    #[error("fulfillment does not match the escrow condition")]
    ConditionMismatch,

    /// An off-chain write failed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A funding saga is already in flight for this goal.
    #[error("goal {0} already has a funding run in flight")]
    AlreadyFunding(GoalId),

    /// The escrow's cancel-after time has not elapsed yet.
    #[error("escrow not cancellable until {cancel_after} (ledger time, now {now})")]
    NotYetExpired { cancel_after: i64, now: i64 },

    /// The acting party is not permitted to perform this operation.
    #[error("not authorized: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The signing provider could not produce a signed transaction.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The CSPRNG was unavailable. Fatal, non-retryable.
    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    /// Transport-level failure talking to the ledger node.
    #[error("ledger rpc error: {0}")]
    Rpc(#[from] reqwest::Error),

    /// The node returned a response the engine could not decode.
    #[error("malformed ledger response: {0}")]
    Decode(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
