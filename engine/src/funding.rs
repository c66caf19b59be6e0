//! # Goal registry and funding state machine
//!
//! Owns goal/milestone/escrow-record state transitions and drives the
//! funding saga.
//!
//! ## The funding saga
//!
//! Funding a goal escrows every milestone's reward under a per-goal lock:
//!
//! 1. `try_lock` the goal — a second concurrent attempt gets
//!    [`EngineError::AlreadyFunding`], never a queue slot.
//! 2. Acquire the funding account through the [`FundingSource`] capability.
//! 3. For each not-yet-escrowed milestone, in id order: generate a
//!    condition/fulfillment pair, create the escrow, and durably persist
//!    the [`EscrowRecord`] before touching the next milestone.
//! 4. When every milestone holds a record, the goal flips to seeded.
//!
//! A mid-sequence failure stops the saga and leaves prior records intact —
//! ledger cancels only work after cancel-after, so there is no immediate
//! compensating action. Re-running the saga skips milestones that already
//! hold a record, so a resume never creates a duplicate escrow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::auth::{Actor, Role};
use crate::condition;
use crate::errors::{EngineError, Result};
use crate::escrow::EscrowCoordinator;
use crate::ledger::cancel_after_for;
use crate::model::{
    check_budget, derive_goal_outcome, EscrowRecord, Goal, GoalId, GoalStatus, Milestone,
    MilestoneId, MilestoneStatus,
};
use crate::reconcile::{PersistOutcome, Reconciler};
use crate::signing::FundingSource;
use crate::store::{Datastore, NewGoal, NewMilestone};

/// Caller-supplied goal definition.
#[derive(Debug, Clone)]
pub struct GoalDraft {
    pub title: String,
    pub description: String,
    pub milestones: Vec<NewMilestone>,
}

/// Result of a funding run.
#[derive(Debug, Clone)]
pub struct FundingOutcome {
    /// Escrows created by this run (resumes count only the new ones).
    pub escrows_created: usize,
    /// `true` when at least one record reached only the repair queue; the
    /// goal seeds once background reconciliation lands it.
    pub pending_reconciliation: bool,
    pub goal_status: GoalStatus,
}

/// Result of a milestone completion.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub milestone_status: MilestoneStatus,
    pub goal_status: GoalStatus,
    /// `true` when the ledger finish succeeded but the off-chain flip is
    /// pending manual review.
    pub pending_reconciliation: bool,
}

pub struct GoalRegistry {
    store: Arc<dyn Datastore>,
    coordinator: Arc<EscrowCoordinator>,
    reconciler: Arc<Reconciler>,
    funding_locks: StdMutex<HashMap<GoalId, Arc<Mutex<()>>>>,
}

impl GoalRegistry {
    pub fn new(
        store: Arc<dyn Datastore>,
        coordinator: Arc<EscrowCoordinator>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            store,
            coordinator,
            reconciler,
            funding_locks: StdMutex::new(HashMap::new()),
        }
    }

    // ─────────────────────────────────────────────────────
    // Goal CRUD
    // ─────────────────────────────────────────────────────

    /// Create a goal with its milestones. The budget is the sum of the
    /// milestone rewards; it is not an independent input.
    pub async fn create_goal(&self, actor: &Actor, draft: GoalDraft) -> Result<Goal> {
        if draft.title.trim().is_empty() {
            return Err(EngineError::Validation("goal title must not be empty".into()));
        }
        if draft.milestones.is_empty() {
            return Err(EngineError::Validation(
                "a goal needs at least one milestone".into(),
            ));
        }
        for m in &draft.milestones {
            if m.title.trim().is_empty() {
                return Err(EngineError::Validation("milestone title must not be empty".into()));
            }
            if m.reward_amount <= 0 {
                return Err(EngineError::Validation(format!(
                    "milestone reward must be positive, got {}",
                    m.reward_amount
                )));
            }
        }
        let total_budget = draft.milestones.iter().map(|m| m.reward_amount).sum();

        let goal = self
            .store
            .insert_goal(NewGoal {
                title: draft.title,
                description: draft.description,
                total_budget,
                creator_id: actor.id.clone(),
                creator_wallet: actor.wallet_address.clone(),
                milestones: draft.milestones,
            })
            .await?;
        info!(goal_id = goal.id, total_budget, "goal created");

        let milestones = self.store.milestones(goal.id).await?;
        check_budget(goal.total_budget, &milestones)?;
        Ok(goal)
    }

    /// Edit title/description. Creator-only, enforced row-level.
    pub async fn update_goal(
        &self,
        actor: &Actor,
        goal_id: GoalId,
        title: &str,
        description: &str,
    ) -> Result<()> {
        if title.trim().is_empty() {
            return Err(EngineError::Validation("goal title must not be empty".into()));
        }
        let updated = self
            .store
            .update_goal_meta(goal_id, &actor.id, title, description)
            .await?;
        if updated {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!(
                "goal {goal_id} not found for this creator"
            )))
        }
    }

    /// Change a milestone's reward, recomputing the goal budget so the
    /// budget invariant keeps holding. Rejected once any escrow exists —
    /// on-ledger amounts cannot follow.
    pub async fn reprice_milestone(
        &self,
        actor: &Actor,
        goal_id: GoalId,
        milestone_id: MilestoneId,
        new_reward: i64,
    ) -> Result<()> {
        if new_reward <= 0 {
            return Err(EngineError::Validation(format!(
                "milestone reward must be positive, got {new_reward}"
            )));
        }
        let goal = self.require_goal(goal_id).await?;
        if goal.creator_id != actor.id {
            return Err(EngineError::Forbidden(
                "only the goal creator may reprice milestones".into(),
            ));
        }
        if goal.status != GoalStatus::Active {
            return Err(EngineError::Validation(
                "milestones can only be repriced before funding".into(),
            ));
        }
        let milestones = self.store.milestones(goal_id).await?;
        let milestone = milestones
            .iter()
            .find(|m| m.id == milestone_id)
            .ok_or_else(|| EngineError::NotFound(format!("milestone {milestone_id}")))?;
        for m in &milestones {
            if self.store.escrow_for_milestone(m.id).await?.is_some() {
                return Err(EngineError::Validation(
                    "budget is frozen once any escrow exists".into(),
                ));
            }
        }
        let new_budget = goal.total_budget - milestone.reward_amount + new_reward;
        self.store
            .reprice_milestone(goal_id, milestone_id, new_reward, new_budget)
            .await?;

        let milestones = self.store.milestones(goal_id).await?;
        check_budget(new_budget, &milestones)?;
        Ok(())
    }

    /// Delete a goal. Creator-only, and only before any funding happened.
    pub async fn delete_goal(&self, actor: &Actor, goal_id: GoalId) -> Result<()> {
        let goal = self.require_goal(goal_id).await?;
        if goal.status != GoalStatus::Active {
            return Err(EngineError::Validation(
                "only unfunded goals can be deleted".into(),
            ));
        }
        for m in self.store.milestones(goal_id).await? {
            if self.store.escrow_for_milestone(m.id).await?.is_some() {
                return Err(EngineError::Validation(
                    "goal has live escrows and cannot be deleted".into(),
                ));
            }
        }
        let deleted = self.store.delete_goal(goal_id, &actor.id).await?;
        if deleted {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!(
                "goal {goal_id} not found for this creator"
            )))
        }
    }

    // ─────────────────────────────────────────────────────
    // Milestone review flow
    // ─────────────────────────────────────────────────────

    /// Creator starts work on a milestone (`todo → active`).
    pub async fn start_milestone(&self, actor: &Actor, milestone_id: MilestoneId) -> Result<()> {
        self.advance_milestone(actor, milestone_id, MilestoneStatus::Active, |goal, actor| {
            goal.creator_id == actor.id
        })
        .await
    }

    /// Creator submits a milestone for review (`active → pending_review`,
    /// or back out of a rejection).
    pub async fn submit_for_review(&self, actor: &Actor, milestone_id: MilestoneId) -> Result<()> {
        self.advance_milestone(
            actor,
            milestone_id,
            MilestoneStatus::PendingReview,
            |goal, actor| goal.creator_id == actor.id,
        )
        .await
    }

    /// Sponsor reviews a submitted milestone.
    pub async fn review_milestone(
        &self,
        actor: &Actor,
        milestone_id: MilestoneId,
        approve: bool,
    ) -> Result<()> {
        let to = if approve {
            MilestoneStatus::Approved
        } else {
            MilestoneStatus::Rejected
        };
        self.advance_milestone(actor, milestone_id, to, |goal, actor| {
            goal.sponsor_id.as_deref() == Some(actor.id.as_str())
        })
        .await
    }

    async fn advance_milestone(
        &self,
        actor: &Actor,
        milestone_id: MilestoneId,
        to: MilestoneStatus,
        permitted: impl Fn(&Goal, &Actor) -> bool,
    ) -> Result<()> {
        let milestone = self.require_milestone(milestone_id).await?;
        let goal = self.require_goal(milestone.goal_id).await?;
        if !permitted(&goal, actor) {
            return Err(EngineError::Forbidden(format!(
                "actor {} may not move milestone {milestone_id}",
                actor.id
            )));
        }
        MilestoneStatus::validate_transition(milestone.status, to)?;
        self.store.set_milestone_status(milestone_id, to).await
    }

    // ─────────────────────────────────────────────────────
    // Funding saga
    // ─────────────────────────────────────────────────────

    pub async fn fund_goal(
        &self,
        actor: &Actor,
        goal_id: GoalId,
        source: &FundingSource,
    ) -> Result<FundingOutcome> {
        if actor.role != Role::Sponsor {
            return Err(EngineError::Forbidden("only sponsors may fund goals".into()));
        }

        // At most one funding saga per goal; concurrent attempts are
        // rejected, not queued.
        let lock = self.funding_lock(goal_id);
        let _guard = lock
            .try_lock()
            .map_err(|_| EngineError::AlreadyFunding(goal_id))?;

        let goal = self.require_goal(goal_id).await?;
        match goal.status {
            GoalStatus::Active => {}
            GoalStatus::Seeded => {
                return Err(EngineError::Validation(format!(
                    "goal {goal_id} is already fully funded"
                )))
            }
            other => {
                return Err(EngineError::Validation(format!(
                    "goal {goal_id} is {} and cannot be funded",
                    other.as_str()
                )))
            }
        }

        // A queued repair means some escrow's true state is still being
        // reconciled; running the saga now could double-fund a milestone.
        if self.store.pending_repairs_for_goal(goal_id).await? > 0 {
            return Err(EngineError::Validation(format!(
                "goal {goal_id} has funding repairs in progress; retry once reconciled"
            )));
        }

        let account = self
            .coordinator
            .gateway()
            .signer()
            .acquire(source)
            .await?;
        info!(goal_id, funding_account = %account.address, "funding saga starting");

        let milestones = self.store.milestones(goal_id).await?;
        let now = Utc::now();
        let mut created = 0usize;
        let mut pending = false;

        for milestone in &milestones {
            if milestone.status.is_terminal() {
                continue;
            }
            // Resume support: milestones that already hold a record were
            // escrowed by an earlier run.
            if self
                .store
                .escrow_for_milestone(milestone.id)
                .await?
                .is_some()
            {
                continue;
            }

            let pair = condition::generate()?;
            let cancel_after = cancel_after_for(milestone.deadline, now);

            match self
                .coordinator
                .create_escrow(
                    &account.address,
                    &goal.creator_wallet,
                    milestone.reward_amount,
                    &pair.condition,
                    cancel_after,
                )
                .await
            {
                Ok(escrow) => {
                    let record = EscrowRecord {
                        milestone_id: milestone.id,
                        owner: account.address.clone(),
                        sequence: escrow.sequence,
                        condition: pair.condition,
                        fulfillment: pair.fulfillment,
                        cancel_after,
                        created_at: Utc::now(),
                    };
                    match self
                        .reconciler
                        .persist_escrow_record(goal_id, &actor.id, &record)
                        .await?
                    {
                        PersistOutcome::Stored => {}
                        PersistOutcome::Queued => pending = true,
                    }
                    created += 1;
                }
                Err(EngineError::LedgerUnknown { tx_hash, sequence }) => {
                    // The create may or may not exist on the ledger. Stop
                    // here; the reconciler resolves it before any retry.
                    let record = EscrowRecord {
                        milestone_id: milestone.id,
                        owner: account.address.clone(),
                        sequence,
                        condition: pair.condition,
                        fulfillment: pair.fulfillment,
                        cancel_after,
                        created_at: Utc::now(),
                    };
                    self.reconciler
                        .queue_unknown_create(goal_id, &actor.id, record, tx_hash.clone())
                        .await?;
                    warn!(goal_id, milestone_id = milestone.id, "funding paused on unknown create");
                    return Err(EngineError::LedgerUnknown { tx_hash, sequence });
                }
                Err(e) => {
                    // Partial funding is resumable; nothing is rolled back.
                    warn!(
                        goal_id,
                        milestone_id = milestone.id,
                        escrows_created = created,
                        "funding stopped: {e}"
                    );
                    return Err(e);
                }
            }
        }

        let goal_status = if pending {
            // Seeding waits for the queued record(s) to land.
            GoalStatus::Active
        } else {
            self.store
                .set_goal_sponsor(goal_id, &actor.id, &account.address)
                .await?;
            self.store
                .set_goal_status(goal_id, GoalStatus::Seeded)
                .await?;
            info!(goal_id, "goal seeded");
            GoalStatus::Seeded
        };

        Ok(FundingOutcome {
            escrows_created: created,
            pending_reconciliation: pending,
            goal_status,
        })
    }

    // ─────────────────────────────────────────────────────
    // Completion path
    // ─────────────────────────────────────────────────────

    /// Finish a milestone's escrow with its stored fulfillment and flip
    /// the milestone to completed.
    ///
    /// The off-chain flip happens only after ledger confirmation. If the
    /// flip itself fails, the milestone is flagged for manual review and
    /// the call still reports success — the on-chain release already
    /// happened and the secret is public.
    pub async fn complete_milestone(
        &self,
        actor: &Actor,
        milestone_id: MilestoneId,
    ) -> Result<CompletionOutcome> {
        let milestone = self.require_milestone(milestone_id).await?;
        let goal = self.require_goal(milestone.goal_id).await?;
        if goal.creator_id != actor.id {
            return Err(EngineError::Forbidden(
                "only the goal creator may complete milestones".into(),
            ));
        }
        if milestone.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "milestone {milestone_id} is already {}",
                milestone.status.as_str()
            )));
        }
        MilestoneStatus::validate_transition(milestone.status, MilestoneStatus::Completed)?;
        let record = self
            .store
            .escrow_for_milestone(milestone_id)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "milestone {milestone_id} has no confirmed escrow"
                ))
            })?;

        let conf = self
            .coordinator
            .finish_escrow(
                &actor.wallet_address,
                &record.owner,
                record.sequence,
                &record.condition,
                &record.fulfillment,
            )
            .await?;

        let mut pending = false;
        if let Err(e) = self
            .store
            .set_milestone_status(milestone_id, MilestoneStatus::Completed)
            .await
        {
            self.reconciler
                .flag_manual_review(
                    milestone_id,
                    format!("finish {} confirmed but status flip failed: {e}", conf.tx_hash),
                )
                .await?;
            pending = true;
        }

        let mut goal_status = goal.status;
        if !pending {
            let milestones = self.store.milestones(goal.id).await?;
            if let Some(outcome) = derive_goal_outcome(&milestones) {
                self.store.set_goal_status(goal.id, outcome).await?;
                goal_status = outcome;
                info!(goal_id = goal.id, status = outcome.as_str(), "goal settled");
            }
        }

        Ok(CompletionOutcome {
            milestone_status: if pending {
                milestone.status
            } else {
                MilestoneStatus::Completed
            },
            goal_status,
            pending_reconciliation: pending,
        })
    }

    // ─────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────

    async fn require_goal(&self, goal_id: GoalId) -> Result<Goal> {
        self.store
            .goal(goal_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("goal {goal_id}")))
    }

    async fn require_milestone(&self, milestone_id: MilestoneId) -> Result<Milestone> {
        self.store
            .milestone(milestone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("milestone {milestone_id}")))
    }

    fn funding_lock(&self, goal_id: GoalId) -> Arc<Mutex<()>> {
        let mut locks = self
            .funding_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(goal_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
