//! Verification sweep tests: retry-forever, denial, local mode.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::harness::{
    assert_no_event, fast_config, ids, next_outcome, receipt_for, txn_for, wait_for_event,
    wait_until, FlakyReceiptStore, TestHarness, VerifyScript,
};
use paydesk::{PurchaseEvent, PurchaseOutcome, ReceiptStore, TransactionState};
use std::sync::Arc;
use std::time::Duration;

/// Test that retry-later answers keep the record pending and the sweep
/// keeps trying until the authority finally grants.
#[tokio::test]
async fn test_retry_later_is_retried_until_granted() {
    let mut harness = TestHarness::setup().await;
    harness.verifier.set_script(VerifyScript::RetryThenGrant(3));
    harness.queue.script(
        "coin_100",
        vec![TransactionState::Purchased {
            receipt: receipt_for("coin_100"),
        }],
    );

    let mut purchase = harness
        .manager
        .buy(&ids(&["coin_100"]))
        .await
        .expect("buy should be accepted");
    assert!(matches!(
        next_outcome(&mut purchase).await,
        PurchaseOutcome::Completed { .. }
    ));

    wait_for_event(&mut harness.events, "eventual grant", |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    assert!(harness.verifier.attempt_count() >= 4);
    assert!(harness.pending().await.is_empty());

    // Once resolved, the sweep goes quiet.
    let settled = harness.verifier.attempt_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.verifier.attempt_count(), settled);
}

/// Test that a denial purges the record and surfaces the refusal, and that
/// no grant is ever emitted for it.
#[tokio::test]
async fn test_denied_receipt_is_purged_and_reported() {
    let mut harness = TestHarness::setup().await;
    harness
        .verifier
        .set_script(VerifyScript::Deny("verification status 21003".to_string()));
    harness.queue.script(
        "coin_100",
        vec![TransactionState::Purchased {
            receipt: receipt_for("coin_100"),
        }],
    );

    let mut purchase = harness
        .manager
        .buy(&ids(&["coin_100"]))
        .await
        .expect("buy should be accepted");
    assert!(matches!(
        next_outcome(&mut purchase).await,
        PurchaseOutcome::Completed { .. }
    ));

    let event = wait_for_event(&mut harness.events, "denial", |event| {
        matches!(event, PurchaseEvent::VerificationDenied { .. })
    })
    .await;
    match event {
        PurchaseEvent::VerificationDenied {
            transaction_id,
            reason,
            ..
        } => {
            assert_eq!(transaction_id, txn_for("coin_100"));
            assert!(reason.contains("21003"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert!(harness.pending().await.is_empty());
    assert_no_event(&mut harness.events, Duration::from_millis(300), |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
}

/// Test that a denied transaction never blocks later purchases of the same
/// product.
#[tokio::test]
async fn test_denial_does_not_poison_future_purchases() {
    let mut harness = TestHarness::setup().await;
    harness
        .verifier
        .set_script(VerifyScript::Deny("bad receipt".to_string()));
    harness.queue.script(
        "coin_100",
        vec![TransactionState::Purchased {
            receipt: receipt_for("coin_100"),
        }],
    );

    let mut first = harness
        .manager
        .buy(&ids(&["coin_100"]))
        .await
        .expect("buy should be accepted");
    assert!(matches!(
        next_outcome(&mut first).await,
        PurchaseOutcome::Completed { .. }
    ));
    wait_for_event(&mut harness.events, "denial", |event| {
        matches!(event, PurchaseEvent::VerificationDenied { .. })
    })
    .await;

    // A fresh transaction for the same product verifies cleanly. Delivered
    // directly so it gets a distinct transaction id.
    harness.verifier.set_script(VerifyScript::Grant);
    harness
        .queue
        .deliver_update(
            "txn-coin_100-second",
            "coin_100",
            TransactionState::Purchased {
                receipt: receipt_for("coin_100-second"),
            },
        )
        .await;
    wait_for_event(&mut harness.events, "grant for second transaction", |event| {
        matches!(
            event,
            PurchaseEvent::EntitlementGranted { transaction_id, .. }
                if transaction_id == "txn-coin_100-second"
        )
    })
    .await;
    assert!(harness.pending().await.is_empty());
}

/// Test local verification: the durable record is the grant, no authority
/// is consulted.
#[tokio::test]
async fn test_local_verification_grants_without_authority() {
    let mut harness = TestHarness::setup_local_verify().await;
    harness.queue.script(
        "coin_100",
        vec![TransactionState::Purchased {
            receipt: receipt_for("coin_100"),
        }],
    );

    let mut purchase = harness
        .manager
        .buy(&ids(&["coin_100"]))
        .await
        .expect("buy should be accepted");
    assert!(matches!(
        next_outcome(&mut purchase).await,
        PurchaseOutcome::Completed { .. }
    ));

    wait_for_event(&mut harness.events, "local grant", |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    assert_eq!(harness.verifier.attempt_count(), 0);
    assert_eq!(harness.queue.finished(), vec![txn_for("coin_100")]);
    assert!(harness.pending().await.is_empty());
}

/// Test that a failed purge in local mode defers the grant to the sweep
/// instead of granting twice.
#[tokio::test]
async fn test_local_mode_purge_failure_defers_to_sweep() {
    let store = Arc::new(FlakyReceiptStore::new());
    store.fail_next_deletes(1);
    let mut config = fast_config();
    config.in_app_verify = true;
    let mut harness =
        TestHarness::setup_with(config, Arc::clone(&store) as Arc<dyn ReceiptStore>).await;
    harness.queue.script(
        "coin_100",
        vec![TransactionState::Purchased {
            receipt: receipt_for("coin_100"),
        }],
    );

    let mut purchase = harness
        .manager
        .buy(&ids(&["coin_100"]))
        .await
        .expect("buy should be accepted");
    assert!(matches!(
        next_outcome(&mut purchase).await,
        PurchaseOutcome::Completed { .. }
    ));

    wait_for_event(&mut harness.events, "deferred grant", |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    // Exactly one grant in total.
    assert_no_event(&mut harness.events, Duration::from_millis(300), |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    assert!(harness.pending().await.is_empty());
    assert_eq!(harness.verifier.attempt_count(), 0);
}

/// Test that verification failures stall the pipeline for the affected
/// record only; fresh records are still attempted promptly.
#[tokio::test]
async fn test_stuck_record_does_not_block_fresh_records() {
    let mut harness = TestHarness::setup().await;
    harness.verifier.set_script(VerifyScript::RetryForever);

    harness
        .queue
        .deliver_update(
            "txn-stuck",
            "coin_100",
            TransactionState::Purchased {
                receipt: receipt_for("coin_100"),
            },
        )
        .await;
    wait_until("stuck record is attempted", || async {
        harness.verifier.attempt_count() >= 1
    })
    .await;

    // A new purchase arrives while the stuck record is backing off; once
    // the authority recovers, both resolve.
    harness.verifier.set_script(VerifyScript::Grant);
    harness
        .queue
        .deliver_update(
            "txn-fresh",
            "coin_500",
            TransactionState::Purchased {
                receipt: receipt_for("coin_500"),
            },
        )
        .await;

    for _ in 0..2 {
        wait_for_event(&mut harness.events, "grants for both records", |event| {
            matches!(event, PurchaseEvent::EntitlementGranted { .. })
        })
        .await;
    }
    assert!(harness.pending().await.is_empty());
}
