//! Escrow coordinator — create, finish, and cancel operations with the
//! pre-checks and retry discipline each one admits.
//!
//! Create is **not** idempotent: the ledger treats every create as a new
//! escrow object, so a timed-out create is never retried blindly — the
//! caller resolves it through the reconciler first. Finish and cancel are
//! idempotent at the ledger level (a replay against a consumed escrow is
//! rejected harmlessly), so their timeouts are retried directly, a bounded
//! number of times.

use std::sync::Arc;

use tracing::warn;

use crate::condition::{self, Fulfillment};
use crate::errors::{EngineError, Result};
use crate::ledger::{ripple_now, EscrowTx, LedgerGateway, TxConfirmation};

/// Direct retries of a timed-out finish/cancel before giving up.
const IDEMPOTENT_ATTEMPTS: u32 = 3;

/// A ledger-confirmed escrow create.
#[derive(Debug, Clone)]
pub struct CreatedEscrow {
    /// Offer sequence identifying the escrow for finish/cancel.
    pub sequence: u32,
    pub tx_hash: String,
}

pub struct EscrowCoordinator {
    gateway: Arc<LedgerGateway>,
}

impl EscrowCoordinator {
    pub fn new(gateway: Arc<LedgerGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<LedgerGateway> {
        &self.gateway
    }

    /// Create a hash-locked escrow and block until the ledger validates it.
    ///
    /// A confirmed create whose metadata carries no escrow node is a hard
    /// decode error — the sequence is required, never guessed.
    pub async fn create_escrow(
        &self,
        funding_account: &str,
        destination: &str,
        amount_drops: i64,
        condition: &str,
        cancel_after: i64,
    ) -> Result<CreatedEscrow> {
        if amount_drops <= 0 {
            return Err(EngineError::Validation(format!(
                "escrow amount must be positive, got {amount_drops}"
            )));
        }
        if destination.is_empty() {
            return Err(EngineError::Validation("empty destination account".into()));
        }
        if condition.len() != 64 || !condition.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::Validation(
                "condition must be a 64-character hex digest".into(),
            ));
        }

        let tx = EscrowTx::EscrowCreate {
            account: funding_account.to_string(),
            amount: amount_drops.to_string(),
            destination: destination.to_string(),
            cancel_after,
            condition: condition.to_string(),
        };
        let conf = self.gateway.submit(&tx).await?;
        let sequence = conf.created_sequence.ok_or_else(|| {
            EngineError::Decode(format!(
                "escrow create {} validated without a created escrow node",
                conf.tx_hash
            ))
        })?;
        Ok(CreatedEscrow {
            sequence,
            tx_hash: conf.tx_hash,
        })
    }

    /// Finish an escrow by presenting its fulfillment.
    ///
    /// The fulfillment is checked against the condition locally first; a
    /// mismatch is rejected without any network call.
    pub async fn finish_escrow(
        &self,
        executor_account: &str,
        owner_account: &str,
        sequence: u32,
        condition: &str,
        fulfillment: &Fulfillment,
    ) -> Result<TxConfirmation> {
        if !condition::verify(condition, fulfillment) {
            return Err(EngineError::ConditionMismatch);
        }
        let tx = EscrowTx::EscrowFinish {
            account: executor_account.to_string(),
            owner: owner_account.to_string(),
            offer_sequence: sequence,
            condition: condition.to_string(),
            fulfillment: fulfillment.to_hex(),
        };
        self.submit_idempotent(&tx, owner_account, sequence).await
    }

    /// Cancel an escrow once its cancel-after time has elapsed.
    ///
    /// The ledger enforces the timing authoritatively; the local pre-check
    /// avoids a round trip that would be rejected anyway.
    pub async fn cancel_escrow(
        &self,
        executor_account: &str,
        owner_account: &str,
        sequence: u32,
        cancel_after: i64,
    ) -> Result<TxConfirmation> {
        let now = ripple_now();
        if now < cancel_after {
            return Err(EngineError::NotYetExpired { cancel_after, now });
        }
        let tx = EscrowTx::EscrowCancel {
            account: executor_account.to_string(),
            owner: owner_account.to_string(),
            offer_sequence: sequence,
        };
        self.submit_idempotent(&tx, owner_account, sequence).await
    }

    /// Submit with direct retry on timeout — only sound for operations the
    /// ledger treats idempotently.
    ///
    /// A retry is a fresh transaction, so when an earlier attempt timed
    /// out and actually landed, the retry bounces off the consumed escrow
    /// with `tecNO_TARGET`. That rejection is resolved by checking whether
    /// the escrow object is gone: gone means an attempt succeeded.
    async fn submit_idempotent(
        &self,
        tx: &EscrowTx,
        owner: &str,
        sequence: u32,
    ) -> Result<TxConfirmation> {
        let mut attempt = 1;
        let mut last_unknown: Option<String> = None;
        loop {
            match self.gateway.submit(tx).await {
                Err(EngineError::LedgerUnknown { tx_hash, .. })
                    if attempt < IDEMPOTENT_ATTEMPTS =>
                {
                    warn!(
                        kind = tx.kind(),
                        tx_hash,
                        attempt, "timed out, retrying idempotent submission"
                    );
                    last_unknown = Some(tx_hash);
                    attempt += 1;
                }
                Err(EngineError::LedgerRejected { code, message }) => {
                    let consumed = code == "tecNO_TARGET"
                        && last_unknown.is_some()
                        && !self.gateway.rpc().escrow_exists(owner, sequence).await?;
                    if consumed {
                        let tx_hash = last_unknown.take().unwrap_or_default();
                        return Ok(TxConfirmation {
                            tx_hash,
                            result_code: code,
                            created_sequence: None,
                        });
                    }
                    return Err(EngineError::LedgerRejected { code, message });
                }
                other => return other,
            }
        }
    }
}
