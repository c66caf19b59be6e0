//! Condition/fulfillment generation for hash-locked escrows.
//!
//! A fulfillment is 32 cryptographically random bytes; its condition is the
//! uppercase-hex SHA-256 digest of those raw bytes. Presenting the
//! fulfillment to the ledger releases the escrow.
//!
//! The digest is transmitted as-is rather than wrapped in a
//! crypto-conditions (PREIMAGE-SHA-256) envelope. Ledgers that require the
//! envelope need a different encoding here — this function is the single
//! seam for that change.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::errors::{EngineError, Result};

/// Byte length of the secret preimage.
pub const FULFILLMENT_LEN: usize = 32;

/// The secret preimage that unlocks an escrow.
///
/// Holds the raw bytes. `Debug` is redacted so the secret cannot leak
/// through logging; serialization (hex) is reserved for the datastore and
/// the finish submission itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Fulfillment([u8; FULFILLMENT_LEN]);

impl Fulfillment {
    pub fn from_bytes(bytes: [u8; FULFILLMENT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| EngineError::Validation(format!("invalid fulfillment hex: {e}")))?;
        let bytes: [u8; FULFILLMENT_LEN] = raw.try_into().map_err(|_| {
            EngineError::Validation(format!("fulfillment must be {FULFILLMENT_LEN} bytes"))
        })?;
        Ok(Self(bytes))
    }

    /// Lowercase hex of the raw secret, as submitted in a finish transaction.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The condition committing to this secret.
    pub fn condition(&self) -> String {
        digest_hex(&self.0)
    }
}

impl std::fmt::Debug for Fulfillment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fulfillment(..)")
    }
}

impl Serialize for Fulfillment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fulfillment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fulfillment::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A freshly generated condition/fulfillment pair.
#[derive(Debug, Clone)]
pub struct ConditionPair {
    /// Uppercase-hex SHA-256 digest of the fulfillment bytes.
    pub condition: String,
    pub fulfillment: Fulfillment,
}

/// Generate a new pair from the OS CSPRNG.
///
/// Fails only if the entropy source is unavailable; that error is fatal and
/// must not be retried.
pub fn generate() -> Result<ConditionPair> {
    let mut secret = [0u8; FULFILLMENT_LEN];
    OsRng
        .try_fill_bytes(&mut secret)
        .map_err(|e| EngineError::Entropy(e.to_string()))?;
    let fulfillment = Fulfillment(secret);
    Ok(ConditionPair {
        condition: fulfillment.condition(),
        fulfillment,
    })
}

/// Uppercase-hex SHA-256 of arbitrary bytes.
pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(bytes))
}

/// Check `condition == H(fulfillment)` locally, before any submission.
pub fn verify(condition: &str, fulfillment: &Fulfillment) -> bool {
    fulfillment.condition().eq_ignore_ascii_case(condition)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
