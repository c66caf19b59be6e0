//! Per-account serialized submission.
//!
//! The ledger requires strictly increasing, gap-free sequence numbers per
//! submitting account. Every submission for an account therefore passes
//! through that account's async lock, held across sign + submit + wait, so
//! no two transactions for the same account are ever in flight together
//! and the signing capability has exactly one user at a time. Submissions
//! for different accounts proceed concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{EscrowTx, LedgerRpc, TxConfirmation};
use crate::errors::Result;
use crate::signing::SigningProvider;

/// Owned connection/session object for issuing escrow operations.
///
/// Constructed explicitly by the host (`main`, tests) and shared by
/// reference — there is no process-wide singleton.
pub struct LedgerGateway {
    rpc: Arc<dyn LedgerRpc>,
    signer: Arc<dyn SigningProvider>,
    account_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LedgerGateway {
    pub fn new(rpc: Arc<dyn LedgerRpc>, signer: Arc<dyn SigningProvider>) -> Self {
        Self {
            rpc,
            signer,
            account_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Sign and submit `tx`, serialized with every other submission from
    /// the same account, and wait for its final outcome.
    pub async fn submit(&self, tx: &EscrowTx) -> Result<TxConfirmation> {
        let account = tx.account().to_string();
        let lock = self.lock_for(&account);
        let _guard = lock.lock().await;

        debug!(account, kind = tx.kind(), "draining submission queue slot");
        let signed = self.signer.sign(&account, tx).await?;
        let confirmation = self.rpc.submit_and_wait(&signed).await?;
        info!(
            account,
            kind = tx.kind(),
            tx_hash = %confirmation.tx_hash,
            code = %confirmation.result_code,
            "transaction validated"
        );
        Ok(confirmation)
    }

    /// The transport, for status queries that need no sequencing.
    pub fn rpc(&self) -> &Arc<dyn LedgerRpc> {
        &self.rpc
    }

    pub fn signer(&self) -> &Arc<dyn SigningProvider> {
        &self.signer
    }

    fn lock_for(&self, account: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .account_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
