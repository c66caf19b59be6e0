//! Datastore seam — off-chain persistence for goals, milestones, escrow
//! records, and the reconciliation repair queue.
//!
//! The engine only depends on this trait; the service crate provides the
//! SQLite implementation. Row-level authorization for edits is part of the
//! contract: guarded updates take the expected creator id and affect zero
//! rows on a mismatch, which the engine reports as not-found.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    EscrowRecord, Goal, GoalId, GoalStatus, Milestone, MilestoneId, MilestoneStatus,
};
use crate::errors::Result;

/// Input for an atomic goal + milestones insert.
#[derive(Debug, Clone)]
pub struct NewGoal {
    pub title: String,
    pub description: String,
    pub total_budget: i64,
    pub creator_id: String,
    pub creator_wallet: String,
    pub milestones: Vec<NewMilestone>,
}

#[derive(Debug, Clone)]
pub struct NewMilestone {
    pub title: String,
    pub description: Option<String>,
    pub reward_amount: i64,
    pub deadline: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────
// Repair queue
// ─────────────────────────────────────────────────────────

/// A divergence between ledger truth and the off-chain records, queued for
/// background reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairTask {
    /// The ledger create was confirmed but the escrow row could not be
    /// persisted. Carries the full record, including the secret, so the
    /// row can be rebuilt — losing it would strand the funds.
    OrphanedEscrow {
        goal_id: GoalId,
        sponsor_id: String,
        record: EscrowRecord,
    },
    /// A create submission timed out. Must be resolved against the ledger
    /// (by hash, then by owner + sequence) before the saga may retry.
    UnknownCreate {
        goal_id: GoalId,
        sponsor_id: String,
        record: EscrowRecord,
        tx_hash: String,
    },
    /// The finish was ledger-confirmed but the status flip failed. The
    /// secret is now public; an operator must review.
    ManualReview {
        milestone_id: MilestoneId,
        reason: String,
    },
}

impl RepairTask {
    /// Storage discriminant; manual-review rows are excluded from the
    /// worker's `due_repairs` feed.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrphanedEscrow { .. } => "orphaned_escrow",
            Self::UnknownCreate { .. } => "unknown_create",
            Self::ManualReview { .. } => "manual_review",
        }
    }

    /// The goal whose funding state this repair blocks, if any.
    pub fn goal_id(&self) -> Option<GoalId> {
        match self {
            Self::OrphanedEscrow { goal_id, .. } | Self::UnknownCreate { goal_id, .. } => {
                Some(*goal_id)
            }
            Self::ManualReview { .. } => None,
        }
    }
}

/// A queued repair as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredRepair {
    pub id: i64,
    pub attempts: i64,
    pub task: RepairTask,
}

// ─────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait Datastore: Send + Sync {
    // Goals ------------------------------------------------------------

    /// Insert a goal and its milestones atomically; returns the stored goal.
    async fn insert_goal(&self, goal: NewGoal) -> Result<Goal>;

    async fn goal(&self, id: GoalId) -> Result<Option<Goal>>;

    /// Milestones of a goal, ordered by id ascending.
    async fn milestones(&self, goal_id: GoalId) -> Result<Vec<Milestone>>;

    async fn milestone(&self, id: MilestoneId) -> Result<Option<Milestone>>;

    /// Goals currently in the given status.
    async fn goals_with_status(&self, status: GoalStatus) -> Result<Vec<Goal>>;

    /// Update title/description iff `creator_id` matches the stored row.
    /// Returns `false` when no row matched.
    async fn update_goal_meta(
        &self,
        id: GoalId,
        creator_id: &str,
        title: &str,
        description: &str,
    ) -> Result<bool>;

    /// Update one milestone's reward and the goal's recomputed budget in a
    /// single atomic step.
    async fn reprice_milestone(
        &self,
        goal_id: GoalId,
        milestone_id: MilestoneId,
        new_reward: i64,
        new_budget: i64,
    ) -> Result<()>;

    /// Delete a goal (and its milestones) iff `creator_id` matches.
    /// Returns `false` when no row matched.
    async fn delete_goal(&self, id: GoalId, creator_id: &str) -> Result<bool>;

    async fn set_goal_status(&self, id: GoalId, status: GoalStatus) -> Result<()>;

    /// Link the sponsor and the escrow-owning account on funding.
    async fn set_goal_sponsor(
        &self,
        id: GoalId,
        sponsor_id: &str,
        funding_account: &str,
    ) -> Result<()>;

    // Milestones -------------------------------------------------------

    async fn set_milestone_status(&self, id: MilestoneId, status: MilestoneStatus) -> Result<()>;

    // Escrow records ---------------------------------------------------

    /// Insert the escrow record for a milestone. At most one record may
    /// ever exist per milestone; a second insert is an error.
    async fn insert_escrow(&self, record: &EscrowRecord) -> Result<()>;

    async fn escrow_for_milestone(&self, milestone_id: MilestoneId)
        -> Result<Option<EscrowRecord>>;

    // Repair queue -----------------------------------------------------

    /// Durably enqueue a repair task; returns its queue id.
    async fn enqueue_repair(&self, task: &RepairTask) -> Result<i64>;

    /// Unresolved repairs that block further funding runs on this goal.
    async fn pending_repairs_for_goal(&self, goal_id: GoalId) -> Result<u32>;

    /// Oldest unresolved repairs eligible for automatic processing
    /// (manual-review rows are never returned).
    async fn due_repairs(&self, limit: u32) -> Result<Vec<StoredRepair>>;

    /// Record one more processing attempt.
    async fn bump_repair(&self, id: i64) -> Result<()>;

    /// Remove a resolved repair from the queue.
    async fn resolve_repair(&self, id: i64) -> Result<()>;
}
