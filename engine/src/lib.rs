//! # Milestone escrow funding engine
//!
//! Funds project milestones through hash-locked escrows on an XRPL-family
//! ledger while keeping an off-chain record of goal/milestone/escrow
//! state. The engine covers the full funding lifecycle:
//!
//! | Phase        | Component                                   |
//! |--------------|---------------------------------------------|
//! | Commitment   | [`condition`] — secret/hash pair per milestone |
//! | Submission   | [`ledger`] — per-account serialized sign/submit/wait |
//! | Operations   | [`escrow::EscrowCoordinator`] — create/finish/cancel |
//! | Saga         | [`funding::GoalRegistry`] — goal state + funding runs |
//! | Repair       | [`reconcile::Reconciler`] — ledger/off-chain divergence |
//! | Expiry       | [`expiry::ExpiryMonitor`] — lapsed milestones, refunds |
//!
//! ## Architecture
//!
//! The engine owns no I/O beyond the ledger transport: persistence,
//! signing/custody, and identity are collaborator traits ([`store::Datastore`],
//! [`signing::SigningProvider`], [`auth::AuthProvider`]) implemented by the
//! host service. Everything here is driven through explicit owned objects —
//! there is no global connection or ambient state.

pub mod auth;
pub mod condition;
pub mod errors;
pub mod escrow;
pub mod expiry;
pub mod funding;
pub mod ledger;
pub mod model;
pub mod reconcile;
pub mod signing;
pub mod store;

pub use errors::{EngineError, Result};
pub use model::{EscrowRecord, Goal, GoalStatus, Milestone, MilestoneStatus};
