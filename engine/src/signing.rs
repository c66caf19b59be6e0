//! Signing capability and funding-account acquisition.
//!
//! Key custody is external: the engine hands a transaction to a
//! [`SigningProvider`] and gets back a signed blob. The same provider
//! resolves a [`FundingSource`] into a concrete account, so the funding
//! saga is identical whether the sponsor uses a long-lived account or a
//! throwaway test-network one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::ledger::EscrowTx;

/// Where the saga's funding account comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingSource {
    /// A long-lived sponsor account whose signing key the provider already
    /// holds.
    Persistent { address: String },
    /// A throwaway account created and funded on demand (test networks).
    /// The provider registers the generated key for the process lifetime.
    Ephemeral,
}

/// A funding account ready to own escrows.
#[derive(Debug, Clone)]
pub struct FundingAccount {
    pub address: String,
}

/// A transaction signed and ready for submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTx {
    /// Hex-encoded signed transaction blob.
    pub tx_blob: String,
    /// Transaction hash, known before submission.
    pub tx_hash: String,
    /// The autofilled account sequence. For an escrow create this is the
    /// offer sequence the finish/cancel operations will reference.
    pub sequence: u32,
}

/// External signing capability.
///
/// A given account's key is used by at most one submission at a time; the
/// gateway guarantees this by holding the account's submission lock across
/// `sign` and the subsequent submit.
#[async_trait]
pub trait SigningProvider: Send + Sync {
    /// Resolve a funding source into a concrete, funded account.
    async fn acquire(&self, source: &FundingSource) -> Result<FundingAccount>;

    /// Sign `tx` for `account`, autofilling sequence and fee.
    async fn sign(&self, account: &str, tx: &EscrowTx) -> Result<SignedTx>;
}
