//! Durability and crash-recovery tests: the record-then-acknowledge
//! protocol, redelivery idempotence and restart re-verification.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::harness::{
    assert_no_event, assert_no_outcome, fast_config, ids, next_outcome, receipt_for, txn_for,
    wait_for_event, FlakyReceiptStore, TestHarness, VerifyScript,
};
use paydesk::{
    FsReceiptStore, PendingReceipt, PurchaseEvent, PurchaseOutcome, ReceiptStore, TransactionState,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// Test that a failed durable write blocks the acknowledgment, and that
/// redelivery retries the whole step. A store failure is never a purchase
/// failure.
#[tokio::test]
async fn test_write_failure_blocks_acknowledgment() {
    let store = Arc::new(FlakyReceiptStore::new());
    store.fail_next_puts(1);
    let harness =
        TestHarness::setup_with(fast_config(), Arc::clone(&store) as Arc<dyn ReceiptStore>).await;
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

    // The write failed, so nothing was acknowledged and no outcome fired.
    assert_no_outcome(&mut purchase, Duration::from_millis(200)).await;
    assert!(harness.queue.finished().is_empty());
    assert_eq!(store.put_count(), 0);

    // The provider redelivers; this time the write lands and the
    // acknowledgment follows.
    harness
        .queue
        .deliver_update(
            &txn_for("coin_100"),
            "coin_100",
            TransactionState::Purchased {
                receipt: receipt_for("coin_100"),
            },
        )
        .await;
    assert!(matches!(
        next_outcome(&mut purchase).await,
        PurchaseOutcome::Completed { .. }
    ));
    // One write for the record body, one for the acknowledgment mark.
    assert_eq!(store.put_count(), 2);
    assert_eq!(harness.queue.finished(), vec![txn_for("coin_100")]);
}

/// Test that a failed acknowledgment keeps the record out of the sweep:
/// no verification and no grant until the provider's redelivery finishes
/// the transaction, and then exactly one grant.
#[tokio::test]
async fn test_failed_acknowledgment_blocks_grant_until_redelivery() {
    let store = Arc::new(FlakyReceiptStore::new());
    let mut harness =
        TestHarness::setup_with(fast_config(), Arc::clone(&store) as Arc<dyn ReceiptStore>).await;
    harness.queue.set_fail_finishes(true);

    // An observed purchase with no caller attached still persists.
    harness
        .queue
        .deliver_update(
            &txn_for("coin_100"),
            "coin_100",
            TransactionState::Purchased {
                receipt: receipt_for("coin_100"),
            },
        )
        .await;
    super::harness::wait_until("record is written", || async {
        store.put_count() == 1
    })
    .await;
    assert!(harness.queue.finished().is_empty());

    // The record is durable but unacknowledged; the sweep must leave it
    // alone across several backoff rounds, because the transaction is
    // still in the provider's queue.
    assert_no_event(&mut harness.events, Duration::from_millis(300), |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    assert_eq!(harness.verifier.attempt_count(), 0);
    assert_eq!(harness.pending().await.len(), 1);
    assert!(harness.queue.finished().is_empty());

    // Redelivery after the provider recovers: the existing record is
    // reused, the acknowledgment lands, and the grant follows once.
    harness.queue.set_fail_finishes(false);
    harness
        .queue
        .deliver_update(
            &txn_for("coin_100"),
            "coin_100",
            TransactionState::Purchased {
                receipt: receipt_for("coin_100"),
            },
        )
        .await;

    wait_for_event(&mut harness.events, "grant after recovery", |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    assert_no_event(&mut harness.events, Duration::from_millis(200), |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    // One write for the record body, one for the acknowledgment mark.
    assert_eq!(store.put_count(), 2);
    assert_eq!(harness.queue.finished(), vec![txn_for("coin_100")]);
    assert!(harness.pending().await.is_empty());
}

/// Test that a record left unacknowledged by a crash is skipped by the
/// startup sweep and resolved only by the provider's redelivery.
#[tokio::test]
async fn test_unacknowledged_record_waits_for_redelivery_across_restart() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let store = Arc::new(FsReceiptStore::open(dir.path()).expect("should open store"));

    // A previous launch wrote the record but crashed before the provider
    // acknowledged the transaction.
    store
        .put(&PendingReceipt::new(
            txn_for("coin_100"),
            "coin_100",
            receipt_for("coin_100").to_vec(),
        ))
        .await
        .expect("should persist");

    let mut harness = TestHarness::setup_with(fast_config(), store).await;

    // The startup sweep leaves the record for the redelivery to complete.
    assert_no_event(&mut harness.events, Duration::from_millis(300), |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    assert_eq!(harness.verifier.attempt_count(), 0);
    assert_eq!(harness.pending().await.len(), 1);

    // The provider still holds the transaction and redelivers it.
    harness
        .queue
        .deliver_update(
            &txn_for("coin_100"),
            "coin_100",
            TransactionState::Purchased {
                receipt: receipt_for("coin_100"),
            },
        )
        .await;
    wait_for_event(&mut harness.events, "grant after redelivery", |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    assert_eq!(harness.queue.finished(), vec![txn_for("coin_100")]);
    assert!(harness.pending().await.is_empty());
}

/// Test that a redelivered transaction after acknowledgment is a no-op:
/// no second write, no second acknowledgment, no second grant.
#[tokio::test]
async fn test_redelivery_after_acknowledgment_is_noop() {
    let mut harness = TestHarness::setup().await;
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
    wait_for_event(&mut harness.events, "first grant", |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    let attempts_after_grant = harness.verifier.attempt_count();

    // The provider delivers the same transaction again.
    harness
        .queue
        .deliver_update(
            &txn_for("coin_100"),
            "coin_100",
            TransactionState::Purchased {
                receipt: receipt_for("coin_100"),
            },
        )
        .await;

    assert_no_event(&mut harness.events, Duration::from_millis(300), |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    assert_eq!(harness.queue.finished().len(), 1);
    assert_eq!(harness.verifier.attempt_count(), attempts_after_grant);
    assert!(harness.pending().await.is_empty());
}

/// Test restart recovery: a record acknowledged but never resolved in one
/// process is verified and granted by the next.
#[tokio::test]
async fn test_restart_resolves_leftover_record() {
    let dir = tempfile::tempdir().expect("should create temp dir");

    // First launch: the purchase is recorded and acknowledged, but the
    // authority keeps answering retry-later, then the process goes away.
    {
        let store = Arc::new(FsReceiptStore::open(dir.path()).expect("should open store"));
        let harness = TestHarness::setup_with(fast_config(), store).await;
        harness
            .verifier
            .set_script(VerifyScript::RetryForever);
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
        assert_eq!(harness.pending().await.len(), 1);
        harness.manager.shutdown();
    }

    // Second launch over the same directory: the startup sweep finds the
    // record and resolves it without any new provider traffic.
    let store = Arc::new(FsReceiptStore::open(dir.path()).expect("should reopen store"));
    let mut harness = TestHarness::setup_with(fast_config(), store).await;

    let event = wait_for_event(&mut harness.events, "grant on restart", |event| {
        matches!(event, PurchaseEvent::EntitlementGranted { .. })
    })
    .await;
    match event {
        PurchaseEvent::EntitlementGranted {
            transaction_id,
            product_id,
        } => {
            assert_eq!(transaction_id, txn_for("coin_100"));
            assert_eq!(product_id, "coin_100");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(harness.pending().await.is_empty());
    assert!(harness.queue.submitted().is_empty());
}

fn redelivery_states() -> impl Strategy<Value = Vec<u8>> {
    // Extra observations interleaved around the guaranteed purchase:
    // 0 = purchasing, 1 = deferred, 2 = duplicate purchased.
    prop::collection::vec(0u8..3, 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// However the provider duplicates and interleaves observations for one
    /// transaction, the entitlement is granted exactly once and the
    /// transaction is acknowledged exactly once.
    #[test]
    fn prop_redelivery_storm_grants_exactly_once(extras in redelivery_states()) {
        let runtime = tokio::runtime::Runtime::new().expect("should build runtime");
        runtime.block_on(async move {
            let mut harness = TestHarness::setup().await;
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
            let outcome = next_outcome(&mut purchase).await;
            let completed = matches!(outcome, PurchaseOutcome::Completed { .. });
            prop_assert!(completed, "expected completion, got {:?}", outcome);

            for extra in extras {
                let state = match extra {
                    0 => TransactionState::Purchasing,
                    1 => TransactionState::Deferred,
                    _ => TransactionState::Purchased {
                        receipt: receipt_for("coin_100"),
                    },
                };
                harness
                    .queue
                    .deliver_update(&txn_for("coin_100"), "coin_100", state)
                    .await;
            }

            wait_for_event(&mut harness.events, "grant", |event| {
                matches!(event, PurchaseEvent::EntitlementGranted { .. })
            })
            .await;
            assert_no_event(&mut harness.events, Duration::from_millis(200), |event| {
                matches!(event, PurchaseEvent::EntitlementGranted { .. })
            })
            .await;

            prop_assert_eq!(harness.queue.finished().len(), 1);
            prop_assert!(harness.pending().await.is_empty());
            Ok(())
        })?;
    }
}
