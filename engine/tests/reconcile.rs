//! Reconciliation tests: durable queueing of orphaned records, definitive
//! resolution of timed-out creates, and the secret-at-risk hard failure.

mod common;

use std::sync::atomic::Ordering;

use common::*;
use escrow_engine::errors::EngineError;
use escrow_engine::model::GoalStatus;
use escrow_engine::ledger::LedgerRpc;
use escrow_engine::store::{Datastore, RepairTask};

#[tokio::test]
async fn orphaned_record_is_queued_then_repaired() {
    let h = harness();
    let goal = h
        .registry
        .create_goal(&developer(), draft(vec![(100, None)]))
        .await
        .unwrap();
    let milestone_id = h.store.milestones(goal.id).await.unwrap()[0].id;

    // Every direct insert attempt fails; the record must end up queued.
    h.store.fail_escrow_inserts.store(4, Ordering::SeqCst);
    let outcome = h
        .registry
        .fund_goal(&sponsor(), goal.id, &sponsor_source())
        .await
        .unwrap();
    assert_eq!(outcome.escrows_created, 1);
    assert!(outcome.pending_reconciliation);
    // Not seeded yet: the record is durable but not yet a row.
    assert_eq!(outcome.goal_status, GoalStatus::Active);
    assert!(h
        .store
        .escrow_for_milestone(milestone_id)
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        h.store.repair_tasks()[0],
        RepairTask::OrphanedEscrow { .. }
    ));

    // The worker lands the row and seeds the goal.
    assert_eq!(h.reconciler.drain_once().await.unwrap(), 1);
    let record = h
        .store
        .escrow_for_milestone(milestone_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.ledger.escrow_count(), 1);
    let goal_after = h.store.goal(goal.id).await.unwrap().unwrap();
    assert_eq!(goal_after.status, GoalStatus::Seeded);
    assert_eq!(goal_after.sponsor_id.as_deref(), Some("sponsor-1"));
    assert_eq!(goal_after.funding_account.as_deref(), Some(&record.owner[..]));
    assert_eq!(h.store.repair_count(), 0);
}

#[tokio::test]
async fn unknown_create_that_landed_is_confirmed() {
    let h = harness();
    let goal = h
        .registry
        .create_goal(&developer(), draft(vec![(100, None)]))
        .await
        .unwrap();
    let milestone_id = h.store.milestones(goal.id).await.unwrap()[0].id;

    h.ledger.plan_create(Planned::UnknownLanded);
    let err = h
        .registry
        .fund_goal(&sponsor(), goal.id, &sponsor_source())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LedgerUnknown { .. }));
    assert!(matches!(
        h.store.repair_tasks()[0],
        RepairTask::UnknownCreate { .. }
    ));

    // Resolution finds the validated transaction and rebuilds the row.
    assert_eq!(h.reconciler.drain_once().await.unwrap(), 1);
    let record = h
        .store
        .escrow_for_milestone(milestone_id)
        .await
        .unwrap()
        .unwrap();
    assert!(h
        .ledger
        .escrow_exists(&record.owner, record.sequence)
        .await
        .unwrap());
    assert_eq!(
        h.store.goal(goal.id).await.unwrap().unwrap().status,
        GoalStatus::Seeded
    );

    // No blind retry ever happened: one create submission total.
    let creates = h
        .ledger
        .submissions()
        .iter()
        .filter(|(_, kind)| *kind == "EscrowCreate")
        .count();
    assert_eq!(creates, 1);
    assert_eq!(h.ledger.escrow_count(), 1);
}

#[tokio::test]
async fn unknown_create_that_never_landed_clears_after_give_up() {
    let h = harness();
    let goal = h
        .registry
        .create_goal(&developer(), draft(vec![(100, None)]))
        .await
        .unwrap();
    let milestone_id = h.store.milestones(goal.id).await.unwrap()[0].id;

    h.ledger.plan_create(Planned::UnknownLost);
    h.registry
        .fund_goal(&sponsor(), goal.id, &sponsor_source())
        .await
        .unwrap_err();

    // While the outcome is unresolved, a saga retry is refused — a blind
    // retry could double-fund the milestone.
    let err = h
        .registry
        .fund_goal(&sponsor(), goal.id, &sponsor_source())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // The ledger keeps answering "never saw it": the repair stays queued…
    assert_eq!(h.reconciler.drain_once().await.unwrap(), 0);
    assert_eq!(h.store.repair_count(), 1);

    // …until the give-up threshold, after which the create counts as
    // definitively failed and the saga may run again.
    for _ in 0..10 {
        h.reconciler.drain_once().await.unwrap();
    }
    assert_eq!(h.store.repair_count(), 0);
    assert!(h
        .store
        .escrow_for_milestone(milestone_id)
        .await
        .unwrap()
        .is_none());

    let outcome = h
        .registry
        .fund_goal(&sponsor(), goal.id, &sponsor_source())
        .await
        .unwrap();
    assert_eq!(outcome.goal_status, GoalStatus::Seeded);
    assert_eq!(h.ledger.escrow_count(), 1);
}

#[tokio::test]
async fn record_that_cannot_be_stored_or_queued_fails_loudly() {
    let h = harness();
    let goal = h
        .registry
        .create_goal(&developer(), draft(vec![(100, None)]))
        .await
        .unwrap();

    h.store.fail_escrow_inserts.store(4, Ordering::SeqCst);
    h.store.fail_repair_enqueue.store(true, Ordering::SeqCst);
    let err = h
        .registry
        .fund_goal(&sponsor(), goal.id, &sponsor_source())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    // Never a silent success: the goal did not seed.
    assert_eq!(
        h.store.goal(goal.id).await.unwrap().unwrap().status,
        GoalStatus::Active
    );
}

#[tokio::test]
async fn same_account_submissions_never_overlap() {
    let h = harness_with_ledger(MockLedger::with_delay(30));
    let goal = h
        .registry
        .create_goal(
            &developer(),
            draft(vec![(100, None), (200, None), (300, None)]),
        )
        .await
        .unwrap();
    h.registry
        .fund_goal(&sponsor(), goal.id, &sponsor_source())
        .await
        .unwrap();

    // Also race two direct submissions on the shared funding account.
    let cond_a = escrow_engine::condition::generate().unwrap().condition;
    let cond_b = escrow_engine::condition::generate().unwrap().condition;
    let (a, b) = tokio::join!(
        h.coordinator.create_escrow(
            "rSPONSOR-FUND",
            "rDEV",
            50,
            &cond_a,
            9_999_999_999,
        ),
        h.coordinator.create_escrow(
            "rSPONSOR-FUND",
            "rDEV",
            60,
            &cond_b,
            9_999_999_999,
        ),
    );
    a.unwrap();
    b.unwrap();

    assert!(
        !h.ledger.overlap_detected(),
        "submissions for one account must be strictly serialized"
    );
    // Strictly increasing, gap-free sequences for the account.
    let milestones = h.store.milestones(goal.id).await.unwrap();
    let mut sequences = Vec::new();
    for m in &milestones {
        sequences.push(
            h.store
                .escrow_for_milestone(m.id)
                .await
                .unwrap()
                .unwrap()
                .sequence,
        );
    }
    assert_eq!(sequences, vec![100, 101, 102]);
}
