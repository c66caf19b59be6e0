//! Actor identity, as resolved by the host application.
//!
//! Authentication and role lookup are external collaborators; the engine
//! only consumes a resolved [`Actor`] and applies row-level policy
//! (creator-only edits, sponsor-only refunds) against it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Platform role of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creates goals and completes milestones.
    Developer,
    /// Funds goals and may reclaim expired escrows.
    Sponsor,
}

/// The authenticated party performing an operation.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: Role,
    /// Ledger address this actor signs with.
    pub wallet_address: String,
}

/// Supplies the current actor for a request context.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_actor(&self) -> Result<Actor>;
}
