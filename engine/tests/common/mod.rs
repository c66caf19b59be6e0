//! Shared test fixtures: an in-memory datastore, a scriptable mock ledger,
//! and a deterministic signer, wired into the real gateway, coordinator,
//! registry, reconciler, and expiry monitor.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use escrow_engine::auth::{Actor, AuthProvider, Role};
use escrow_engine::condition::Fulfillment;
use escrow_engine::errors::{EngineError, Result};
use escrow_engine::escrow::EscrowCoordinator;
use escrow_engine::expiry::ExpiryMonitor;
use escrow_engine::funding::{GoalDraft, GoalRegistry};
use escrow_engine::ledger::{
    ripple_now, EscrowTx, LedgerGateway, LedgerRpc, TxConfirmation, TxLookup,
};
use escrow_engine::model::{
    EscrowRecord, Goal, GoalId, GoalStatus, Milestone, MilestoneId, MilestoneStatus,
};
use escrow_engine::reconcile::Reconciler;
use escrow_engine::signing::{FundingAccount, FundingSource, SignedTx, SigningProvider};
use escrow_engine::store::{Datastore, NewGoal, NewMilestone, RepairTask, StoredRepair};

// ─────────────────────────────────────────────────────────
// In-memory datastore
// ─────────────────────────────────────────────────────────

#[derive(Default)]
struct StoreInner {
    goals: BTreeMap<GoalId, Goal>,
    milestones: BTreeMap<MilestoneId, Milestone>,
    escrows: BTreeMap<MilestoneId, EscrowRecord>,
    repairs: BTreeMap<i64, (RepairTask, i64)>,
    next_goal: GoalId,
    next_milestone: MilestoneId,
    next_repair: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    /// Fail the next N escrow-record inserts.
    pub fail_escrow_inserts: AtomicU32,
    /// Fail the next N milestone status flips.
    pub fail_status_flips: AtomicU32,
    /// Refuse repair enqueues entirely.
    pub fail_repair_enqueue: AtomicBool,
}

impl MemoryStore {
    pub fn repair_count(&self) -> usize {
        self.inner.lock().unwrap().repairs.len()
    }

    pub fn repair_tasks(&self) -> Vec<RepairTask> {
        self.inner
            .lock()
            .unwrap()
            .repairs
            .values()
            .map(|(t, _)| t.clone())
            .collect()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn insert_goal(&self, goal: NewGoal) -> Result<Goal> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_goal += 1;
        let id = inner.next_goal;
        let stored = Goal {
            id,
            created_at: Utc::now(),
            title: goal.title,
            description: goal.description,
            total_budget: goal.total_budget,
            status: GoalStatus::Active,
            creator_id: goal.creator_id,
            creator_wallet: goal.creator_wallet,
            sponsor_id: None,
            funding_account: None,
        };
        inner.goals.insert(id, stored.clone());
        for m in goal.milestones {
            inner.next_milestone += 1;
            let mid = inner.next_milestone;
            inner.milestones.insert(
                mid,
                Milestone {
                    id: mid,
                    goal_id: id,
                    title: m.title,
                    description: m.description,
                    reward_amount: m.reward_amount,
                    deadline: m.deadline,
                    status: MilestoneStatus::Todo,
                },
            );
        }
        Ok(stored)
    }

    async fn goal(&self, id: GoalId) -> Result<Option<Goal>> {
        Ok(self.inner.lock().unwrap().goals.get(&id).cloned())
    }

    async fn milestones(&self, goal_id: GoalId) -> Result<Vec<Milestone>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .milestones
            .values()
            .filter(|m| m.goal_id == goal_id)
            .cloned()
            .collect())
    }

    async fn milestone(&self, id: MilestoneId) -> Result<Option<Milestone>> {
        Ok(self.inner.lock().unwrap().milestones.get(&id).cloned())
    }

    async fn goals_with_status(&self, status: GoalStatus) -> Result<Vec<Goal>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .goals
            .values()
            .filter(|g| g.status == status)
            .cloned()
            .collect())
    }

    async fn update_goal_meta(
        &self,
        id: GoalId,
        creator_id: &str,
        title: &str,
        description: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.goals.get_mut(&id) {
            Some(g) if g.creator_id == creator_id => {
                g.title = title.to_string();
                g.description = description.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reprice_milestone(
        &self,
        goal_id: GoalId,
        milestone_id: MilestoneId,
        new_reward: i64,
        new_budget: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.milestones.get_mut(&milestone_id) {
            if m.goal_id == goal_id {
                m.reward_amount = new_reward;
            }
        }
        if let Some(g) = inner.goals.get_mut(&goal_id) {
            g.total_budget = new_budget;
        }
        Ok(())
    }

    async fn delete_goal(&self, id: GoalId, creator_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.goals.get(&id) {
            Some(g) if g.creator_id == creator_id => {
                inner.goals.remove(&id);
                inner.milestones.retain(|_, m| m.goal_id != id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_goal_status(&self, id: GoalId, status: GoalStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(g) = inner.goals.get_mut(&id) {
            g.status = status;
        }
        Ok(())
    }

    async fn set_goal_sponsor(
        &self,
        id: GoalId,
        sponsor_id: &str,
        funding_account: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(g) = inner.goals.get_mut(&id) {
            g.sponsor_id = Some(sponsor_id.to_string());
            g.funding_account = Some(funding_account.to_string());
        }
        Ok(())
    }

    async fn set_milestone_status(&self, id: MilestoneId, status: MilestoneStatus) -> Result<()> {
        if Self::take_failure(&self.fail_status_flips) {
            return Err(EngineError::Persistence("injected status flip failure".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.milestones.get_mut(&id) {
            m.status = status;
        }
        Ok(())
    }

    async fn insert_escrow(&self, record: &EscrowRecord) -> Result<()> {
        if Self::take_failure(&self.fail_escrow_inserts) {
            return Err(EngineError::Persistence("injected insert failure".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.escrows.contains_key(&record.milestone_id) {
            return Err(EngineError::Persistence(format!(
                "milestone {} already has an escrow record",
                record.milestone_id
            )));
        }
        inner.escrows.insert(record.milestone_id, record.clone());
        Ok(())
    }

    async fn escrow_for_milestone(&self, milestone_id: MilestoneId) -> Result<Option<EscrowRecord>> {
        Ok(self.inner.lock().unwrap().escrows.get(&milestone_id).cloned())
    }

    async fn enqueue_repair(&self, task: &RepairTask) -> Result<i64> {
        if self.fail_repair_enqueue.load(Ordering::SeqCst) {
            return Err(EngineError::Persistence("injected enqueue failure".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.next_repair += 1;
        let id = inner.next_repair;
        inner.repairs.insert(id, (task.clone(), 0));
        Ok(id)
    }

    async fn pending_repairs_for_goal(&self, goal_id: GoalId) -> Result<u32> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .repairs
            .values()
            .filter(|(t, _)| t.goal_id() == Some(goal_id))
            .count() as u32)
    }

    async fn due_repairs(&self, limit: u32) -> Result<Vec<StoredRepair>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .repairs
            .iter()
            .filter(|(_, (t, _))| !matches!(t, RepairTask::ManualReview { .. }))
            .take(limit as usize)
            .map(|(id, (task, attempts))| StoredRepair {
                id: *id,
                attempts: *attempts,
                task: task.clone(),
            })
            .collect())
    }

    async fn bump_repair(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, attempts)) = inner.repairs.get_mut(&id) {
            *attempts += 1;
        }
        Ok(())
    }

    async fn resolve_repair(&self, id: i64) -> Result<()> {
        self.inner.lock().unwrap().repairs.remove(&id);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Mock ledger
// ─────────────────────────────────────────────────────────

/// Scripted outcome for the next escrow create submission.
#[derive(Debug, Clone)]
pub enum Planned {
    /// Explicit success (placeholder when scripting a later failure).
    Succeed,
    /// Definitive rejection with the given code.
    Reject(&'static str),
    /// Timeout, but the transaction actually landed.
    UnknownLanded,
    /// Timeout, and the transaction never made it.
    UnknownLost,
}

struct LedgerEscrow {
    condition: String,
    cancel_after: i64,
}

#[derive(Default)]
struct LedgerInner {
    escrows: HashMap<(String, u32), LedgerEscrow>,
    planned_creates: VecDeque<Planned>,
    planned_finishes: VecDeque<Planned>,
    outcomes: HashMap<String, TxLookup>,
    submissions: Vec<(String, &'static str)>,
    in_flight: HashSet<String>,
    overlap_detected: bool,
}

/// In-process ledger double. Applies the real acceptance rules (hash
/// check on finish, cancel-after on cancel) so the engine's pre-checks
/// are backed by the same semantics they guard against.
#[derive(Default)]
pub struct MockLedger {
    inner: Mutex<LedgerInner>,
    /// Artificial validation latency, to widen race windows.
    pub submit_delay_ms: u64,
}

impl MockLedger {
    pub fn with_delay(ms: u64) -> Self {
        Self {
            submit_delay_ms: ms,
            ..Self::default()
        }
    }

    pub fn plan_create(&self, outcome: Planned) {
        self.inner.lock().unwrap().planned_creates.push_back(outcome);
    }

    pub fn plan_finish(&self, outcome: Planned) {
        self.inner.lock().unwrap().planned_finishes.push_back(outcome);
    }

    pub fn submissions(&self) -> Vec<(String, &'static str)> {
        self.inner.lock().unwrap().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.inner.lock().unwrap().submissions.len()
    }

    pub fn escrow_count(&self) -> usize {
        self.inner.lock().unwrap().escrows.len()
    }

    /// True if two submissions for one account ever overlapped.
    pub fn overlap_detected(&self) -> bool {
        self.inner.lock().unwrap().overlap_detected
    }

    fn confirm(tx_hash: &str, created: Option<u32>) -> TxConfirmation {
        TxConfirmation {
            tx_hash: tx_hash.to_string(),
            result_code: "tesSUCCESS".to_string(),
            created_sequence: created,
        }
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn submit_and_wait(&self, signed: &SignedTx) -> Result<TxConfirmation> {
        let tx: EscrowTx = serde_json::from_str(&signed.tx_blob)?;
        let account = tx.account().to_string();

        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.in_flight.insert(account.clone()) {
                inner.overlap_detected = true;
            }
            inner.submissions.push((account.clone(), tx.kind()));
        }
        if self.submit_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.submit_delay_ms)).await;
        }

        let result = self.apply(&tx, signed);
        self.inner.lock().unwrap().in_flight.remove(&account);
        result
    }

    async fn lookup(&self, tx_hash: &str) -> Result<TxLookup> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .outcomes
            .get(tx_hash)
            .cloned()
            .unwrap_or(TxLookup::NotFound))
    }

    async fn escrow_exists(&self, owner: &str, sequence: u32) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .escrows
            .contains_key(&(owner.to_string(), sequence)))
    }
}

impl MockLedger {
    fn apply(&self, tx: &EscrowTx, signed: &SignedTx) -> Result<TxConfirmation> {
        let mut inner = self.inner.lock().unwrap();
        match tx {
            EscrowTx::EscrowCreate {
                account,
                condition,
                cancel_after,
                ..
            } => {
                let planned = inner.planned_creates.pop_front();
                match planned {
                    Some(Planned::Reject(code)) => {
                        inner.outcomes.insert(
                            signed.tx_hash.clone(),
                            TxLookup::Failed {
                                code: code.to_string(),
                                message: "planned".to_string(),
                            },
                        );
                        Err(EngineError::LedgerRejected {
                            code: code.to_string(),
                            message: "planned".to_string(),
                        })
                    }
                    Some(Planned::UnknownLanded) => {
                        inner.escrows.insert(
                            (account.clone(), signed.sequence),
                            LedgerEscrow {
                                condition: condition.clone(),
                                cancel_after: *cancel_after,
                            },
                        );
                        inner.outcomes.insert(
                            signed.tx_hash.clone(),
                            TxLookup::Validated(Self::confirm(
                                &signed.tx_hash,
                                Some(signed.sequence),
                            )),
                        );
                        Err(EngineError::LedgerUnknown {
                            tx_hash: signed.tx_hash.clone(),
                            sequence: signed.sequence,
                        })
                    }
                    Some(Planned::UnknownLost) => Err(EngineError::LedgerUnknown {
                        tx_hash: signed.tx_hash.clone(),
                        sequence: signed.sequence,
                    }),
                    Some(Planned::Succeed) | None => {
                        inner.escrows.insert(
                            (account.clone(), signed.sequence),
                            LedgerEscrow {
                                condition: condition.clone(),
                                cancel_after: *cancel_after,
                            },
                        );
                        let conf = Self::confirm(&signed.tx_hash, Some(signed.sequence));
                        inner
                            .outcomes
                            .insert(signed.tx_hash.clone(), TxLookup::Validated(conf.clone()));
                        Ok(conf)
                    }
                }
            }
            EscrowTx::EscrowFinish {
                owner,
                offer_sequence,
                fulfillment,
                ..
            } => {
                let key = (owner.clone(), *offer_sequence);
                let planned = inner.planned_finishes.pop_front();
                match planned {
                    Some(Planned::UnknownLanded) => {
                        inner.escrows.remove(&key);
                        Err(EngineError::LedgerUnknown {
                            tx_hash: signed.tx_hash.clone(),
                            sequence: signed.sequence,
                        })
                    }
                    Some(Planned::UnknownLost) => Err(EngineError::LedgerUnknown {
                        tx_hash: signed.tx_hash.clone(),
                        sequence: signed.sequence,
                    }),
                    Some(Planned::Reject(code)) => Err(EngineError::LedgerRejected {
                        code: code.to_string(),
                        message: "planned".to_string(),
                    }),
                    Some(Planned::Succeed) | None => {
                        let Some(escrow) = inner.escrows.get(&key) else {
                            return Err(EngineError::LedgerRejected {
                                code: "tecNO_TARGET".to_string(),
                                message: "no such escrow".to_string(),
                            });
                        };
                        // The ledger itself verifies the preimage.
                        let presented = Fulfillment::from_hex(fulfillment)?;
                        if !presented.condition().eq_ignore_ascii_case(&escrow.condition) {
                            return Err(EngineError::LedgerRejected {
                                code: "tecCRYPTOCONDITION".to_string(),
                                message: "fulfillment does not satisfy condition".to_string(),
                            });
                        }
                        inner.escrows.remove(&key);
                        Ok(Self::confirm(&signed.tx_hash, None))
                    }
                }
            }
            EscrowTx::EscrowCancel {
                owner,
                offer_sequence,
                ..
            } => {
                let key = (owner.clone(), *offer_sequence);
                let Some(escrow) = inner.escrows.get(&key) else {
                    return Err(EngineError::LedgerRejected {
                        code: "tecNO_TARGET".to_string(),
                        message: "no such escrow".to_string(),
                    });
                };
                if ripple_now() < escrow.cancel_after {
                    return Err(EngineError::LedgerRejected {
                        code: "tecNO_PERMISSION".to_string(),
                        message: "cancel before CancelAfter".to_string(),
                    });
                }
                inner.escrows.remove(&key);
                Ok(Self::confirm(&signed.tx_hash, None))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Deterministic signer + static auth
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct StaticSigner {
    sequences: Mutex<HashMap<String, u32>>,
    tx_counter: AtomicU32,
}

#[async_trait]
impl SigningProvider for StaticSigner {
    async fn acquire(&self, source: &FundingSource) -> Result<FundingAccount> {
        match source {
            FundingSource::Persistent { address } => Ok(FundingAccount {
                address: address.clone(),
            }),
            FundingSource::Ephemeral => Ok(FundingAccount {
                address: "rFAUCET1".to_string(),
            }),
        }
    }

    async fn sign(&self, account: &str, tx: &EscrowTx) -> Result<SignedTx> {
        let sequence = {
            let mut sequences = self.sequences.lock().unwrap();
            let next = sequences.entry(account.to_string()).or_insert(100);
            let current = *next;
            *next += 1;
            current
        };
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SignedTx {
            tx_blob: serde_json::to_string(tx)?,
            tx_hash: format!("TX-{n:04}"),
            sequence,
        })
    }
}

pub struct StaticAuth {
    pub actor: Actor,
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_actor(&self) -> Result<Actor> {
        Ok(self.actor.clone())
    }
}

// ─────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MockLedger>,
    pub coordinator: Arc<EscrowCoordinator>,
    pub reconciler: Arc<Reconciler>,
    pub registry: GoalRegistry,
    pub monitor: ExpiryMonitor,
}

pub fn harness() -> Harness {
    harness_with_ledger(MockLedger::default())
}

pub fn harness_with_ledger(ledger: MockLedger) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let ledger = Arc::new(ledger);
    let rpc: Arc<dyn LedgerRpc> = ledger.clone();
    let signer: Arc<dyn SigningProvider> = Arc::new(StaticSigner::default());
    let gateway = Arc::new(LedgerGateway::new(rpc.clone(), signer));
    let coordinator = Arc::new(EscrowCoordinator::new(gateway));
    let reconciler = Arc::new(Reconciler::new(store.clone(), rpc));
    let registry = GoalRegistry::new(store.clone(), coordinator.clone(), reconciler.clone());
    let monitor = ExpiryMonitor::new(store.clone(), coordinator.clone());
    Harness {
        store,
        ledger,
        coordinator,
        reconciler,
        registry,
        monitor,
    }
}

pub fn developer() -> Actor {
    Actor {
        id: "dev-1".to_string(),
        role: Role::Developer,
        wallet_address: "rDEV".to_string(),
    }
}

pub fn sponsor() -> Actor {
    Actor {
        id: "sponsor-1".to_string(),
        role: Role::Sponsor,
        wallet_address: "rSPONSOR".to_string(),
    }
}

pub fn sponsor_source() -> FundingSource {
    FundingSource::Persistent {
        address: "rSPONSOR-FUND".to_string(),
    }
}

pub fn draft(milestones: Vec<(i64, Option<DateTime<Utc>>)>) -> GoalDraft {
    GoalDraft {
        title: "Ship the parser".to_string(),
        description: "milestone-funded work".to_string(),
        milestones: milestones
            .into_iter()
            .enumerate()
            .map(|(i, (reward, deadline))| NewMilestone {
                title: format!("milestone {}", i + 1),
                description: None,
                reward_amount: reward,
                deadline,
            })
            .collect(),
    }
}

pub fn hours_from_now(h: i64) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::hours(h)
}
