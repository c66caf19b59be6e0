//! Consistency reconciler — repairs divergence between ledger truth and
//! the off-chain records after partial failures.
//!
//! Two independent writes happen per funding step (the ledger transaction
//! and the off-chain row), and either can fail alone:
//!
//! * Ledger confirmed, row failed: the write is retried with bounded
//!   exponential back-off, then durably queued. The saga never reports
//!   plain success until the row landed or the queue accepted it — an
//!   unqueued loss would strand the unlock secret while funds stay locked.
//! * Create timed out: the true outcome is resolved against the ledger
//!   (transaction hash first, owner + sequence as fallback) before any
//!   retry is allowed, because a blind retry would create a duplicate
//!   escrow.
//! * Finish confirmed, status flip failed: the secret is already public on
//!   the ledger, so the record is flagged for manual review and left for
//!   an operator.
//!
//! A background worker drains the queue on an interval.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{EngineError, Result};
use crate::ledger::{LedgerRpc, TxLookup};
use crate::model::{EscrowRecord, GoalId, GoalStatus, MilestoneId};
use crate::store::{Datastore, RepairTask, StoredRepair};

const PERSIST_ATTEMPTS: u32 = 4;
const INITIAL_PERSIST_BACKOFF_MS: u64 = 100;
const MAX_PERSIST_BACKOFF_MS: u64 = 2_000;

/// Unresolved unknown-creates are treated as definitively failed after
/// this many worker passes without a ledger answer.
const UNRESOLVED_GIVE_UP_ATTEMPTS: i64 = 10;

const REPAIR_BATCH: u32 = 32;

/// How a just-confirmed escrow record reached durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The row is in the datastore.
    Stored,
    /// The row write kept failing; the record sits in the repair queue.
    Queued,
}

/// Resolution of a timed-out create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownResolution {
    /// The create made it into a validated ledger; the record was stored.
    Confirmed,
    /// The create definitively failed; the milestone has no escrow.
    Failed,
    /// The ledger has no answer yet.
    Unresolved,
}

pub struct Reconciler {
    store: Arc<dyn Datastore>,
    rpc: Arc<dyn LedgerRpc>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Datastore>, rpc: Arc<dyn LedgerRpc>) -> Self {
        Self { store, rpc }
    }

    // ─────────────────────────────────────────────────────
    // Saga-facing entry points
    // ─────────────────────────────────────────────────────

    /// Durably persist a ledger-confirmed escrow record.
    ///
    /// Retries the row write with bounded back-off, then falls back to the
    /// durable repair queue. Only when *both* fail does this return an
    /// error — at that point the unlock secret exists nowhere durable and
    /// the failure is surfaced as loudly as possible.
    pub async fn persist_escrow_record(
        &self,
        goal_id: GoalId,
        sponsor_id: &str,
        record: &EscrowRecord,
    ) -> Result<PersistOutcome> {
        let mut backoff = INITIAL_PERSIST_BACKOFF_MS;
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.store.insert_escrow(record).await {
                Ok(()) => return Ok(PersistOutcome::Stored),
                Err(e) => {
                    warn!(
                        milestone_id = record.milestone_id,
                        attempt, "escrow record write failed (retry in {backoff}ms): {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_PERSIST_BACKOFF_MS);
                }
            }
        }

        let task = RepairTask::OrphanedEscrow {
            goal_id,
            sponsor_id: sponsor_id.to_string(),
            record: record.clone(),
        };
        match self.store.enqueue_repair(&task).await {
            Ok(id) => {
                warn!(
                    milestone_id = record.milestone_id,
                    repair_id = id,
                    "escrow record queued for background reconciliation"
                );
                Ok(PersistOutcome::Queued)
            }
            Err(e) => {
                error!(
                    milestone_id = record.milestone_id,
                    "escrow record could not be stored or queued; unlock secret at risk: {e}"
                );
                Err(EngineError::Persistence(format!(
                    "escrow record for milestone {} not durable; funds locked on-ledger",
                    record.milestone_id
                )))
            }
        }
    }

    /// Queue a timed-out create for definitive resolution.
    pub async fn queue_unknown_create(
        &self,
        goal_id: GoalId,
        sponsor_id: &str,
        record: EscrowRecord,
        tx_hash: String,
    ) -> Result<i64> {
        let milestone_id = record.milestone_id;
        let id = self
            .store
            .enqueue_repair(&RepairTask::UnknownCreate {
                goal_id,
                sponsor_id: sponsor_id.to_string(),
                record,
                tx_hash,
            })
            .await?;
        warn!(milestone_id, repair_id = id, "unknown create queued for resolution");
        Ok(id)
    }

    /// Flag a finish whose off-chain flip failed. The secret is public;
    /// only an operator can close this out.
    pub async fn flag_manual_review(&self, milestone_id: MilestoneId, reason: String) -> Result<i64> {
        error!(milestone_id, reason, "manual review required");
        self.store
            .enqueue_repair(&RepairTask::ManualReview { milestone_id, reason })
            .await
    }

    // ─────────────────────────────────────────────────────
    // Resolution
    // ─────────────────────────────────────────────────────

    /// Re-derive the true state of a timed-out create from the ledger and
    /// repair the off-chain row if it succeeded.
    pub async fn resolve_unknown_create(
        &self,
        record: &EscrowRecord,
        tx_hash: &str,
    ) -> Result<UnknownResolution> {
        match self.rpc.lookup(tx_hash).await? {
            TxLookup::Validated(conf) => {
                let sequence = conf.created_sequence.ok_or_else(|| {
                    EngineError::Decode(format!(
                        "resolved create {tx_hash} without a created escrow node"
                    ))
                })?;
                let mut repaired = record.clone();
                repaired.sequence = sequence;
                self.insert_if_absent(&repaired).await?;
                Ok(UnknownResolution::Confirmed)
            }
            TxLookup::Failed { code, .. } => {
                info!(tx_hash, code, "timed-out create definitively failed");
                Ok(UnknownResolution::Failed)
            }
            TxLookup::NotFound => {
                // The node may have pruned the transaction; the escrow
                // object itself is the authoritative fallback.
                if self.rpc.escrow_exists(&record.owner, record.sequence).await? {
                    self.insert_if_absent(record).await?;
                    Ok(UnknownResolution::Confirmed)
                } else {
                    Ok(UnknownResolution::Unresolved)
                }
            }
        }
    }

    async fn insert_if_absent(&self, record: &EscrowRecord) -> Result<()> {
        if self
            .store
            .escrow_for_milestone(record.milestone_id)
            .await?
            .is_none()
        {
            self.store.insert_escrow(record).await?;
        }
        Ok(())
    }

    /// Once a repaired record lands, seed the goal if it is now fully
    /// escrowed (the saga itself could not, because the row was missing).
    async fn seed_if_complete(&self, goal_id: GoalId, sponsor_id: &str, owner: &str) -> Result<()> {
        let Some(goal) = self.store.goal(goal_id).await? else {
            return Ok(());
        };
        if goal.status != GoalStatus::Active {
            return Ok(());
        }
        for m in self.store.milestones(goal_id).await? {
            if m.status.is_terminal() {
                continue;
            }
            if self.store.escrow_for_milestone(m.id).await?.is_none() {
                return Ok(());
            }
        }
        self.store.set_goal_sponsor(goal_id, sponsor_id, owner).await?;
        self.store.set_goal_status(goal_id, GoalStatus::Seeded).await?;
        info!(goal_id, "goal seeded after background repair");
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Background worker
    // ─────────────────────────────────────────────────────

    /// Drain one batch of due repairs. Returns how many were resolved.
    pub async fn drain_once(&self) -> Result<usize> {
        let due = self.store.due_repairs(REPAIR_BATCH).await?;
        let mut resolved = 0;
        for repair in due {
            self.store.bump_repair(repair.id).await?;
            if self.process(&repair).await? {
                self.store.resolve_repair(repair.id).await?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Returns `true` when the repair is finished and may leave the queue.
    async fn process(&self, repair: &StoredRepair) -> Result<bool> {
        match &repair.task {
            RepairTask::OrphanedEscrow {
                goal_id,
                sponsor_id,
                record,
            } => match self.insert_if_absent(record).await {
                Ok(()) => {
                    info!(
                        milestone_id = record.milestone_id,
                        "orphaned escrow record repaired"
                    );
                    self.seed_if_complete(*goal_id, sponsor_id, &record.owner).await?;
                    Ok(true)
                }
                Err(e) => {
                    warn!(
                        milestone_id = record.milestone_id,
                        "orphaned escrow record still failing: {e}"
                    );
                    Ok(false)
                }
            },
            RepairTask::UnknownCreate {
                goal_id,
                sponsor_id,
                record,
                tx_hash,
            } => match self.resolve_unknown_create(record, tx_hash).await {
                Ok(UnknownResolution::Confirmed) => {
                    info!(tx_hash, "unknown create resolved as confirmed");
                    self.seed_if_complete(*goal_id, sponsor_id, &record.owner).await?;
                    Ok(true)
                }
                Ok(UnknownResolution::Failed) => Ok(true),
                Ok(UnknownResolution::Unresolved) => {
                    if repair.attempts + 1 >= UNRESOLVED_GIVE_UP_ATTEMPTS {
                        warn!(
                            tx_hash,
                            attempts = repair.attempts,
                            "unknown create never surfaced on the ledger; treating as failed"
                        );
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                Err(e) => {
                    warn!(tx_hash, "unknown-create resolution failed: {e}");
                    Ok(false)
                }
            },
            // Never auto-resolved; surfaced to operators out of band.
            RepairTask::ManualReview { .. } => Ok(false),
        }
    }

    /// Spawnable worker loop.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!("reconciliation worker starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reconciliation worker stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            match self.drain_once().await {
                Ok(0) => {}
                Ok(n) => info!("reconciliation pass resolved {n} repairs"),
                Err(e) => error!("reconciliation pass failed: {e}"),
            }
        }
    }
}
