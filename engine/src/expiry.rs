//! Expiry monitor — derives which milestones have lapsed and reclaims
//! their escrows once the ledger allows it.
//!
//! "Expired" is a derived view, not stored state: a milestone counts as
//! expired when its deadline has passed while its goal is seeded and the
//! milestone never completed. Reclaiming the locked funds additionally
//! requires the escrow's cancel-after time to have elapsed — the ledger
//! enforces that authoritatively, the engine just avoids doomed attempts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::Actor;
use crate::errors::{EngineError, Result};
use crate::escrow::EscrowCoordinator;
use crate::ledger::{to_ripple_time, TxConfirmation};
use crate::model::{derive_goal_outcome, Goal, GoalId, GoalStatus, MilestoneId, MilestoneStatus};
use crate::store::Datastore;

/// A milestone whose deadline lapsed while its goal was seeded.
#[derive(Debug, Clone)]
pub struct ExpiredMilestone {
    pub goal_id: GoalId,
    pub milestone_id: MilestoneId,
    pub deadline: DateTime<Utc>,
    /// Ledger time after which the escrow can be cancelled.
    pub cancel_after: i64,
    /// Whether a refund would be accepted right now.
    pub refund_eligible: bool,
}

pub struct ExpiryMonitor {
    store: Arc<dyn Datastore>,
    coordinator: Arc<EscrowCoordinator>,
}

impl ExpiryMonitor {
    pub fn new(store: Arc<dyn Datastore>, coordinator: Arc<EscrowCoordinator>) -> Self {
        Self { store, coordinator }
    }

    /// Derive the expired milestones as of `now`. Mutates nothing.
    pub async fn expired_view(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredMilestone>> {
        let now_ripple = to_ripple_time(now);
        let mut expired = Vec::new();
        for goal in self.store.goals_with_status(GoalStatus::Seeded).await? {
            for milestone in self.store.milestones(goal.id).await? {
                if milestone.status.is_terminal() {
                    continue;
                }
                let Some(deadline) = milestone.deadline else {
                    continue;
                };
                if deadline >= now {
                    continue;
                }
                let Some(record) = self.store.escrow_for_milestone(milestone.id).await? else {
                    continue;
                };
                expired.push(ExpiredMilestone {
                    goal_id: goal.id,
                    milestone_id: milestone.id,
                    deadline,
                    cancel_after: record.cancel_after,
                    refund_eligible: now_ripple >= record.cancel_after,
                });
            }
        }
        Ok(expired)
    }

    /// Reclaim one expired milestone's escrow. Sponsor-only; fails with
    /// [`EngineError::NotYetExpired`] before the escrow's cancel-after
    /// time, and succeeds at most once (the milestone goes terminal).
    pub async fn refund(
        &self,
        actor: &Actor,
        goal_id: GoalId,
        milestone_id: MilestoneId,
    ) -> Result<TxConfirmation> {
        let goal = self
            .store
            .goal(goal_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("goal {goal_id}")))?;
        if goal.sponsor_id.as_deref() != Some(actor.id.as_str()) {
            return Err(EngineError::Forbidden(
                "only the sponsor may reclaim an escrow".into(),
            ));
        }
        self.refund_inner(&goal, milestone_id).await
    }

    async fn refund_inner(&self, goal: &Goal, milestone_id: MilestoneId) -> Result<TxConfirmation> {
        if !matches!(goal.status, GoalStatus::Seeded | GoalStatus::Expired) {
            return Err(EngineError::Validation(format!(
                "goal {} is {} and holds nothing to refund",
                goal.id,
                goal.status.as_str()
            )));
        }
        let milestone = self
            .store
            .milestone(milestone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("milestone {milestone_id}")))?;
        if milestone.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "milestone {milestone_id} is already {}",
                milestone.status.as_str()
            )));
        }
        let record = self
            .store
            .escrow_for_milestone(milestone_id)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!("milestone {milestone_id} has no escrow"))
            })?;

        // The owner reclaims its own escrow; the coordinator re-checks the
        // cancel-after timing before submitting.
        let conf = self
            .coordinator
            .cancel_escrow(&record.owner, &record.owner, record.sequence, record.cancel_after)
            .await?;

        self.store
            .set_milestone_status(milestone_id, MilestoneStatus::Refunded)
            .await?;
        info!(goal_id = goal.id, milestone_id, "escrow refunded");

        // Once nothing is live anymore the goal itself is spent.
        if goal.status == GoalStatus::Seeded {
            let milestones = self.store.milestones(goal.id).await?;
            if let Some(outcome) = derive_goal_outcome(&milestones) {
                self.store.set_goal_status(goal.id, outcome).await?;
                info!(goal_id = goal.id, status = outcome.as_str(), "goal settled");
            }
        }
        Ok(conf)
    }

    /// One sweep: refund every milestone that is expired *and* past its
    /// cancel-after time. Returns how many refunds were issued.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut refunded = 0usize;
        for expired in self.expired_view(now).await? {
            if !expired.refund_eligible {
                continue;
            }
            let Some(goal) = self.store.goal(expired.goal_id).await? else {
                continue;
            };
            match self.refund_inner(&goal, expired.milestone_id).await {
                Ok(_) => refunded += 1,
                Err(e) => warn!(
                    goal_id = expired.goal_id,
                    milestone_id = expired.milestone_id,
                    "automatic refund failed: {e}"
                ),
            }
        }
        Ok(refunded)
    }

    /// Spawnable sweep loop.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!("expiry monitor starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("expiry monitor stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            match self.sweep_once(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!("expiry sweep issued {n} refunds"),
                Err(e) => error!("expiry sweep failed: {e}"),
            }
        }
    }
}
