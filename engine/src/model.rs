//! # Model
//!
//! Off-chain record types for goals, milestones, and their escrows.
//!
//! ## Status as a Finite-State Machine
//!
//! Both lifecycles are strict forward-only machines:
//!
//! ```text
//! Goal:      Active ──► Seeded ──► Completed
//!                │          └────► Expired
//!                └────► Cancelled
//!
//! Milestone: Todo ──► Active ──► PendingReview ──► Approved ──► Completed
//!                        │             └─────────► Rejected ──► PendingReview
//!                        ├──► Completed        (simple path)
//!                        └──► Refunded         (expiry path, also from Todo)
//! ```
//!
//! Backward transitions and transitions out of terminal states are rejected
//! by [`GoalStatus::validate_transition`] / [`MilestoneStatus::validate_transition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Fulfillment;
use crate::errors::{EngineError, Result};

pub type GoalId = i64;
pub type MilestoneId = i64;

// ─────────────────────────────────────────────────────────
// Goal lifecycle
// ─────────────────────────────────────────────────────────

/// Lifecycle status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    /// Accepting edits; not yet funded.
    Active,
    /// Every milestone holds a confirmed escrow.
    Seeded,
    /// All milestones completed; funds released.
    Completed,
    /// Deadline passed while seeded; remaining escrows refunded.
    Expired,
    /// Withdrawn by the creator before funding.
    Cancelled,
}

const GOAL_TRANSITIONS: &[(GoalStatus, GoalStatus)] = &[
    (GoalStatus::Active, GoalStatus::Seeded),
    (GoalStatus::Active, GoalStatus::Cancelled),
    (GoalStatus::Seeded, GoalStatus::Completed),
    (GoalStatus::Seeded, GoalStatus::Expired),
];

impl GoalStatus {
    /// Parse the storage identifier back into a status.
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "seeded" => Ok(Self::Seeded),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EngineError::Decode(format!("unknown goal status: {other}"))),
        }
    }

    /// Short identifier string suitable for storage in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Seeded => "seeded",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Cancelled)
    }

    pub fn validate_transition(from: GoalStatus, to: GoalStatus) -> Result<()> {
        if from == to || GOAL_TRANSITIONS.contains(&(from, to)) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "invalid goal transition {} -> {}",
                from.as_str(),
                to.as_str()
            )))
        }
    }
}

// ─────────────────────────────────────────────────────────
// Milestone lifecycle
// ─────────────────────────────────────────────────────────

/// Lifecycle status of a milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Todo,
    Active,
    PendingReview,
    Rejected,
    Approved,
    /// Escrow finished on the ledger; reward released.
    Completed,
    /// Escrow cancelled after expiry; reward returned to the sponsor.
    Refunded,
}

const MILESTONE_TRANSITIONS: &[(MilestoneStatus, MilestoneStatus)] = &[
    (MilestoneStatus::Todo, MilestoneStatus::Active),
    (MilestoneStatus::Active, MilestoneStatus::PendingReview),
    (MilestoneStatus::PendingReview, MilestoneStatus::Approved),
    (MilestoneStatus::PendingReview, MilestoneStatus::Rejected),
    (MilestoneStatus::Rejected, MilestoneStatus::PendingReview),
    (MilestoneStatus::Approved, MilestoneStatus::Completed),
    // Simple path: active straight to completed.
    (MilestoneStatus::Active, MilestoneStatus::Completed),
    (MilestoneStatus::Todo, MilestoneStatus::Completed),
    // Expiry path.
    (MilestoneStatus::Todo, MilestoneStatus::Refunded),
    (MilestoneStatus::Active, MilestoneStatus::Refunded),
    (MilestoneStatus::PendingReview, MilestoneStatus::Refunded),
    (MilestoneStatus::Rejected, MilestoneStatus::Refunded),
];

impl MilestoneStatus {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "todo" => Ok(Self::Todo),
            "active" => Ok(Self::Active),
            "pending_review" => Ok(Self::PendingReview),
            "rejected" => Ok(Self::Rejected),
            "approved" => Ok(Self::Approved),
            "completed" => Ok(Self::Completed),
            "refunded" => Ok(Self::Refunded),
            other => Err(EngineError::Decode(format!(
                "unknown milestone status: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Active => "active",
            Self::PendingReview => "pending_review",
            Self::Rejected => "rejected",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded)
    }

    pub fn validate_transition(from: MilestoneStatus, to: MilestoneStatus) -> Result<()> {
        if from == to || MILESTONE_TRANSITIONS.contains(&(from, to)) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "invalid milestone transition {} -> {}",
                from.as_str(),
                to.as_str()
            )))
        }
    }
}

// ─────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────

/// A funding goal and its budget.
///
/// `total_budget` equals the sum of milestone rewards at all times; the
/// registry enforces this at creation and on every repricing edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
    /// Total budget in drops.
    pub total_budget: i64,
    pub status: GoalStatus,
    pub creator_id: String,
    /// Ledger address the escrows pay out to.
    pub creator_wallet: String,
    pub sponsor_id: Option<String>,
    /// The sponsor-side account that owns the escrows once funded.
    pub funding_account: Option<String>,
}

/// A single milestone within a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub goal_id: GoalId,
    pub title: String,
    pub description: Option<String>,
    /// Reward in drops; strictly positive.
    pub reward_amount: i64,
    pub deadline: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,
}

/// The off-chain record of a confirmed on-ledger escrow.
///
/// Written exactly once per milestone, at create confirmation. The
/// fulfillment is the unlock secret — it is stored here so the finish step
/// can present it, and must never appear in any listing read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub milestone_id: MilestoneId,
    /// Account that created (and owns) the escrow on the ledger.
    pub owner: String,
    /// Sequence number identifying the escrow object on the ledger.
    pub sequence: u32,
    /// Uppercase-hex SHA-256 commitment.
    pub condition: String,
    pub fulfillment: Fulfillment,
    /// Ledger time (ripple epoch seconds) after which the escrow is cancellable.
    pub cancel_after: i64,
    pub created_at: DateTime<Utc>,
}

/// Terminal status a seeded goal should take once every milestone is
/// terminal: completed when everything completed, expired when any reward
/// went back to the sponsor. `None` while anything is still live.
pub fn derive_goal_outcome(milestones: &[Milestone]) -> Option<GoalStatus> {
    if milestones.is_empty() || !milestones.iter().all(|m| m.status.is_terminal()) {
        return None;
    }
    if milestones
        .iter()
        .all(|m| m.status == MilestoneStatus::Completed)
    {
        Some(GoalStatus::Completed)
    } else {
        Some(GoalStatus::Expired)
    }
}

/// Check the budget invariant: `goal.total_budget == sum(milestone rewards)`.
pub fn check_budget(total_budget: i64, milestones: &[Milestone]) -> Result<()> {
    let sum: i64 = milestones.iter().map(|m| m.reward_amount).sum();
    if sum == total_budget {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "budget {total_budget} does not equal milestone reward sum {sum}"
        )))
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
