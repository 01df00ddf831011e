mod common;

use std::{sync::Arc, time::Duration};

use common::{approx, harness, harness_with, owner, settlement_config, FailingAttachRepository, SubmitBehavior, NOW};
use meter_client::domain::{
    datetime_from_millis, millis_from_datetime, MeterOwner, NewSettlement, SettlementStatus, SettlementTrigger,
};
use meter_service::{
    commands::MeterCommand,
    ledger::TxReceipt,
    persistence::{MeterRegistry, RepositoryError, SettlementRepository},
    settlement::{PowerSample, SettlementError, SettlementOutcome},
};

#[tokio::test]
async fn export_surplus_is_minted_and_meter_reset() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 1200.0).await;
    h.buffer
        .push(
            "m-1",
            PowerSample {
                timestamp: NOW,
                power_kw: 1.0,
            },
        )
        .await;

    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    let SettlementOutcome::Submitted(record) = outcome else {
        panic!("expected submission, got {outcome:?}");
    };

    assert_eq!(record.status, SettlementStatus::Pending);
    assert_eq!(record.raw_export_wh, 5000.0);
    assert_eq!(record.raw_import_wh, 1200.0);
    assert_eq!(record.net_wh_from_grid, 3800.0);
    assert!(approx(record.etk_amount_credited, 3.8));
    assert_eq!(record.owner_id, "u-1");
    assert_eq!(record.settlement_trigger, SettlementTrigger::Periodic);
    assert_eq!(record.blockchain_tx_hash.as_deref(), Some(format!("0xtx_{}", record.settlement_id).as_str()));
    assert!(record.settlement_id.starts_with(&format!("settlement_{}_", record.id)));
    assert_eq!(record.period_end_time, datetime_from_millis(NOW));
    assert_eq!(record.period_start_time, datetime_from_millis(NOW - 5 * 60_000));

    let subs = h.ledger.submissions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].net_wh, 3800);
    assert_eq!(subs[0].settlement_id, record.settlement_id);
    assert_eq!(subs[0].user_address, "0xowner_u-1");

    assert_eq!(h.commands.sent(), vec![("m-1".to_string(), MeterCommand::reset_settlement())]);
    assert_eq!(h.buffer.len("m-1").await, 0);
}

#[tokio::test]
async fn net_below_minimum_creates_no_record() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 50.0, 40.0).await;

    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    assert_eq!(
        outcome,
        SettlementOutcome::BelowMinimum {
            net_wh: 10.0,
            min_wh: 100.0
        }
    );
    assert!(h.settlements.all().await.is_empty());
    assert!(h.ledger.submissions().is_empty());
    assert!(h.commands.sent().is_empty());
}

#[tokio::test]
async fn ledger_failure_leaves_failed_record_and_no_command() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 1200.0).await;
    h.ledger.set_submit(SubmitBehavior::Fail);

    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    let SettlementOutcome::Failed(record) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };

    assert_eq!(record.status, SettlementStatus::Failed);
    assert_eq!(record.confirmed_at_on_chain, Some(datetime_from_millis(NOW)));
    assert!(record.failure_reason.as_deref().unwrap_or_default().contains("execution reverted"));
    assert!(record.blockchain_tx_hash.is_none());
    assert!(h.commands.sent().is_empty());

    let stored = h.settlements.all().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, SettlementStatus::Failed);
}

#[tokio::test]
async fn ledger_timeout_is_a_failed_submission() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 0.0).await;
    h.ledger.set_submit(SubmitBehavior::Hang);

    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    let SettlementOutcome::Failed(record) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(record.failure_reason.as_deref().unwrap_or_default().contains("timed out"));
    assert!(h.commands.sent().is_empty());
}

#[tokio::test]
async fn net_import_burns_with_negative_tokens() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 200.0, 1700.0).await;

    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    let SettlementOutcome::Submitted(record) = outcome else {
        panic!("expected submission, got {outcome:?}");
    };
    assert_eq!(record.net_wh_from_grid, -1500.0);
    assert!(approx(record.etk_amount_credited, -1.5));
    assert_eq!(h.ledger.submissions()[0].net_wh, -1500);
}

#[tokio::test]
async fn ledger_receives_net_truncated_toward_zero() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 0.0, 250.75).await;

    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    let SettlementOutcome::Submitted(record) = outcome else {
        panic!("expected submission, got {outcome:?}");
    };
    assert_eq!(record.net_wh_from_grid, -250.75);
    assert_eq!(h.ledger.submissions()[0].net_wh, -250);
}

#[tokio::test]
async fn missing_counters_default_to_zero() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    let mut payload = common::counters(4000.0, 0.0);
    payload.import = None;
    h.publish("m-1", payload).await;

    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    let SettlementOutcome::Submitted(record) = outcome else {
        panic!("expected submission, got {outcome:?}");
    };
    assert_eq!(record.raw_import_wh, 0.0);
    assert_eq!(record.net_wh_from_grid, 4000.0);
}

#[tokio::test]
async fn meter_is_not_settled_again_until_a_newer_reading_arrives() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 1200.0).await;

    let first = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    let SettlementOutcome::Submitted(first) = first else {
        panic!("expected submission");
    };

    // Device has not reported since; the latest slot still holds the old counters.
    h.clock.advance_ms(5 * 60_000);
    let again = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    assert_eq!(again, SettlementOutcome::StaleReading);
    assert_eq!(h.ledger.submissions().len(), 1);

    h.clock.advance_ms(1_000);
    h.publish_counters("m-1", 700.0, 100.0).await;
    let next = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    let SettlementOutcome::Submitted(next) = next else {
        panic!("expected second submission");
    };
    assert_eq!(next.net_wh_from_grid, 600.0);
    assert_eq!(next.period_start_time, first.period_end_time);
    assert_eq!(millis_from_datetime(next.period_end_time), NOW + 5 * 60_000 + 1_000);
}

#[tokio::test]
async fn failed_settlement_does_not_block_the_next_cycle() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 0.0).await;
    h.ledger.set_submit(SubmitBehavior::Fail);
    h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();

    h.ledger.set_submit(SubmitBehavior::Succeed);
    h.clock.advance_ms(5 * 60_000);
    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    assert!(matches!(outcome, SettlementOutcome::Submitted(_)));
}

#[tokio::test]
async fn missing_owner_or_address_fails_closed() {
    let h = harness();
    h.publish_counters("m-1", 5000.0, 0.0).await;
    assert_eq!(
        h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap(),
        SettlementOutcome::NoOwner
    );

    h.registry
        .register(MeterOwner {
            owner_address: None,
            ..owner("m-1", "u-1")
        })
        .await;
    assert_eq!(
        h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap(),
        SettlementOutcome::NoOwner
    );
    assert!(h.settlements.all().await.is_empty());
}

#[tokio::test]
async fn unauthorized_meter_gets_one_authorization_attempt() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 0.0).await;

    h.ledger.set_authorized(false, false);
    assert_eq!(
        h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap(),
        SettlementOutcome::NotAuthorized
    );
    assert_eq!(h.ledger.authorize_calls(), 1);
    assert!(h.settlements.all().await.is_empty());

    h.ledger.set_authorized(false, true);
    let outcome = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    assert!(matches!(outcome, SettlementOutcome::Submitted(_)));
    assert_eq!(h.ledger.authorize_calls(), 2);
}

#[tokio::test]
async fn manual_settlement_checks_ownership() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 0.0).await;

    let err = h.orchestrator.settle_meter_manual("m-1", "intruder").await.unwrap_err();
    assert!(matches!(err, SettlementError::Forbidden { .. }));
    let err = h.orchestrator.settle_meter_manual("m-404", "u-1").await.unwrap_err();
    assert!(matches!(err, SettlementError::UnknownMeter(_)));
    assert!(h.ledger.submissions().is_empty());

    let outcome = h.orchestrator.settle_meter_manual("m-1", "u-1").await.unwrap();
    let SettlementOutcome::Submitted(record) = outcome else {
        panic!("expected submission");
    };
    assert_eq!(record.settlement_trigger, SettlementTrigger::Manual);
}

#[tokio::test]
async fn concurrent_settlement_of_one_meter_is_refused() {
    let settings = meter_service::config::SettlementConfig {
        ledger_timeout_ms: 300,
        ..settlement_config()
    };
    let h = harness_with(settings);
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 0.0).await;
    h.ledger.set_submit(SubmitBehavior::Hang);

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h.orchestrator.settle_meter("m-1", SettlementTrigger::Manual).await.unwrap();
    assert_eq!(second, SettlementOutcome::InFlight);

    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, SettlementOutcome::Failed(_)));
    assert_eq!(h.ledger.submissions().len(), 1);
}

#[tokio::test]
async fn confirmation_is_final() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 200.0, 1700.0).await;
    let SettlementOutcome::Submitted(record) =
        h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap()
    else {
        panic!("expected submission");
    };

    h.clock.advance_ms(30_000);
    let tx = record.blockchain_tx_hash.clone().unwrap();
    // A positive amount reported for a burn is stored with the burn's sign.
    let confirmed = h
        .orchestrator
        .confirm_settlement(&record.settlement_id, &tx, true, Some(1.5))
        .await
        .unwrap();
    assert_eq!(confirmed.status, SettlementStatus::Success);
    assert_eq!(confirmed.etk_amount_credited, -1.5);
    assert_eq!(confirmed.confirmed_at_on_chain, Some(datetime_from_millis(NOW + 30_000)));

    let err = h
        .orchestrator
        .confirm_settlement(&record.settlement_id, &tx, false, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SettlementError::Repository(RepositoryError::AlreadyFinal { .. })
    ));
    let stored = h.settlements.get(&record.settlement_id).await.unwrap().unwrap();
    assert_eq!(stored, confirmed);

    let err = h
        .orchestrator
        .confirm_settlement("settlement_99_0", "0x0", true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::NotFound(_)));
}

fn pending(meter_id: &str, created_ms: i64) -> NewSettlement {
    NewSettlement {
        meter_id: meter_id.to_string(),
        owner_id: "u-1".to_string(),
        period_start_time: datetime_from_millis(created_ms - 300_000),
        period_end_time: datetime_from_millis(created_ms),
        raw_export_wh: 1000.0,
        raw_import_wh: 0.0,
        net_wh_from_grid: 1000.0,
        etk_amount_credited: 1.0,
        settlement_trigger: SettlementTrigger::Periodic,
        created_at_backend: datetime_from_millis(created_ms),
    }
}

#[tokio::test]
async fn reconciliation_resolves_stale_pending_records() {
    let h = harness();
    let never = h.settlements.create_pending(pending("m-1", NOW)).await.unwrap();
    let confirmed = h.settlements.create_pending(pending("m-2", NOW)).await.unwrap();
    let reverted = h.settlements.create_pending(pending("m-3", NOW)).await.unwrap();
    let unknown = h.settlements.create_pending(pending("m-4", NOW)).await.unwrap();
    for (rec, hash) in [(&confirmed, "0xc"), (&reverted, "0xr"), (&unknown, "0xu")] {
        h.settlements.attach_tx_hash(&rec.settlement_id, hash).await.unwrap();
    }
    h.ledger.set_receipt("0xc", TxReceipt::Confirmed);
    h.ledger.set_receipt("0xr", TxReceipt::Reverted);

    // Still inside the pending timeout.
    h.clock.advance_ms(10 * 60_000);
    let report = h.orchestrator.reconcile_pending().await.unwrap();
    assert_eq!(report.examined, 0);

    h.clock.advance_ms(25 * 60_000);
    let report = h.orchestrator.reconcile_pending().await.unwrap();
    assert_eq!(report.examined, 4);
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.unresolved, 1);

    let status = |id: String| {
        let repo = h.settlements.clone();
        async move { repo.get(&id).await.unwrap().unwrap().status }
    };
    assert_eq!(status(never.settlement_id).await, SettlementStatus::Failed);
    assert_eq!(status(confirmed.settlement_id).await, SettlementStatus::Success);
    assert_eq!(status(reverted.settlement_id).await, SettlementStatus::Failed);
    assert_eq!(status(unknown.settlement_id).await, SettlementStatus::Pending);
}

#[tokio::test]
async fn cycle_settles_each_meter_independently() {
    let h = harness();
    for (meter, user) in [("m-a", "u-a"), ("m-b", "u-b"), ("m-c", "u-c")] {
        h.registry.register(owner(meter, user)).await;
    }
    h.publish_counters("m-a", 5000.0, 0.0).await;
    h.publish_counters("m-b", 10.0, 0.0).await;
    h.publish_counters("m-c", 0.0, 900.0).await;

    let report = h.orchestrator.settle_all().await;
    assert_eq!(report.meters, 3);
    assert_eq!(report.submitted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.errors, 0);

    let records = h.settlements.all().await;
    assert_eq!(records.len(), 2);
    for r in &records {
        assert_eq!(r.net_wh_from_grid, r.raw_export_wh - r.raw_import_wh);
        assert_eq!(r.etk_amount_credited.signum(), r.net_wh_from_grid.signum());
    }
    assert!(h.registry.owner_of("m-b").await.unwrap().is_some());
}

#[tokio::test]
async fn disabled_periodic_settlement_does_nothing() {
    let settings = meter_service::config::SettlementConfig {
        enabled: false,
        ..settlement_config()
    };
    let h = harness_with(settings);
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 0.0).await;

    let report = h.orchestrator.settle_all().await;
    assert_eq!(report.meters, 0);
    assert!(h.ledger.submissions().is_empty());

    // Manual settlement still works.
    let outcome = h.orchestrator.settle_meter_manual("m-1", "u-1").await.unwrap();
    assert!(matches!(outcome, SettlementOutcome::Submitted(_)));
}

#[tokio::test]
async fn unrecorded_tx_hash_still_resets_meter_and_reconciles() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 1200.0).await;
    let orchestrator = h.orchestrator_with(Arc::new(FailingAttachRepository::new(h.settlements.clone(), 1)));

    let SettlementOutcome::Submitted(record) =
        orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap()
    else {
        panic!("expected submission");
    };
    let tx = format!("0xtx_{}", record.settlement_id);
    assert_eq!(record.blockchain_tx_hash.as_deref(), Some(tx.as_str()));
    assert_eq!(h.commands.sent(), vec![("m-1".to_string(), MeterCommand::reset_settlement())]);

    let stored = h.settlements.get(&record.settlement_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SettlementStatus::Pending);
    assert_eq!(stored.blockchain_tx_hash, None);

    h.ledger.set_receipt(&tx, TxReceipt::Confirmed);
    h.clock.advance_ms(31 * 60_000);

    let report = orchestrator.reconcile_pending().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.failed, 0);
    let stored = h.settlements.get(&record.settlement_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SettlementStatus::Success);
    assert_eq!(stored.blockchain_tx_hash.as_deref(), Some(tx.as_str()));
    assert_eq!(h.ledger.submissions().len(), 1);
}

#[tokio::test]
async fn undelivered_reset_settles_only_new_energy() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 1200.0).await;
    h.commands.set_failing(true);

    let first = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    assert!(matches!(first, SettlementOutcome::Submitted(_)));
    assert!(h.commands.sent().is_empty());

    // Counters unchanged since the settlement: nothing new to mint.
    h.clock.advance_ms(60_000);
    h.publish_counters("m-1", 5000.0, 1200.0).await;
    let second = h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();
    assert!(matches!(second, SettlementOutcome::BelowMinimum { net_wh, .. } if net_wh == 0.0));

    h.clock.advance_ms(60_000);
    h.publish_counters("m-1", 5600.0, 1250.0).await;
    h.commands.set_failing(false);
    let SettlementOutcome::Submitted(third) =
        h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap()
    else {
        panic!("expected submission");
    };
    assert_eq!(third.raw_export_wh, 600.0);
    assert_eq!(third.raw_import_wh, 50.0);
    assert_eq!(third.net_wh_from_grid, 550.0);
    assert_eq!(h.commands.sent().len(), 1);

    // Reset delivered: the device counts from zero again.
    h.clock.advance_ms(60_000);
    h.publish_counters("m-1", 300.0, 0.0).await;
    h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap();

    let minted: Vec<i64> = h.ledger.submissions().iter().map(|s| s.net_wh).collect();
    assert_eq!(minted, vec![3800, 550, 300]);
}

#[tokio::test]
async fn confirmation_requires_the_submitted_tx_hash() {
    let h = harness();
    h.registry.register(owner("m-1", "u-1")).await;
    h.publish_counters("m-1", 5000.0, 1200.0).await;
    let SettlementOutcome::Submitted(record) =
        h.orchestrator.settle_meter("m-1", SettlementTrigger::Periodic).await.unwrap()
    else {
        panic!("expected submission");
    };

    let err = h
        .orchestrator
        .confirm_settlement(&record.settlement_id, "0xsomething_else", true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::TxHashMismatch { .. }));
    let stored = h.settlements.get(&record.settlement_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SettlementStatus::Pending);
    assert_eq!(stored.blockchain_tx_hash, record.blockchain_tx_hash);

    let unsubmitted = h.settlements.create_pending(pending("m-2", NOW)).await.unwrap();
    let err = h
        .orchestrator
        .confirm_settlement(&unsubmitted.settlement_id, "0xabc", true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::NotSubmitted(_)));
    let stored = h.settlements.get(&unsubmitted.settlement_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SettlementStatus::Pending);
}
