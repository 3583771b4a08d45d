//! LedgerStore interface tests.
//!
//! These tests verify the contract of the LedgerStore trait and the
//! exactly-once properties the billing services build on it. Each test uses
//! its own user IDs so they can share one database.

use std::sync::Arc;

use rust_decimal::Decimal;

use vpn_billing::interfaces::{LedgerStore, StorageError};
use vpn_billing::model::{
    IntentDraft, Origin, PaymentStatus, ReferralBonus, SubscriptionState, Track, User, UserId,
};
use vpn_billing::validation::limits::MAX_AMOUNT;
use vpn_billing::{BalancePurchase, BillingService, Config, ErrorKind, Outcome, WebhookPayment};

/// Insert a user with an opening balance and commit.
pub async fn seed_user(store: &Arc<dyn LedgerStore>, id: i64, balance: i64) {
    let mut tx = store.begin().await.expect("begin should succeed");
    assert!(tx
        .insert_user(&User::new(UserId(id)))
        .await
        .expect("insert should succeed"));
    if balance != 0 {
        tx.adjust_balance(UserId(id), Decimal::from(balance))
            .await
            .expect("credit should succeed");
    }
    tx.commit().await.expect("commit should succeed");
}

fn service(store: &Arc<dyn LedgerStore>) -> BillingService {
    BillingService::new(Arc::clone(store), &Config::for_test())
}

async fn balance(store: &Arc<dyn LedgerStore>, id: i64) -> Decimal {
    store
        .get_user(UserId(id))
        .await
        .expect("get should succeed")
        .expect("user should exist")
        .balance
}

fn webhook(payment_id: &str, user_id: i64, amount: i64, track: &str, period: i64) -> WebhookPayment {
    WebhookPayment {
        payment_id: payment_id.to_string(),
        user_id,
        amount: Decimal::from(amount),
        period,
        track: track.to_string(),
        origin: Origin::CardWebhook,
        status: "succeeded".to_string(),
    }
}

fn draft(payment_id: &str, user_id: i64) -> IntentDraft {
    IntentDraft {
        payment_id: payment_id.to_string(),
        user_id: UserId(user_id),
        amount: Decimal::new(12_550, 2),
        period: 30,
        track: Track::Combo,
        origin: Origin::CryptoWebhook,
    }
}

// =============================================================================
// Unit-of-work tests
// =============================================================================

pub async fn test_user_roundtrip(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 101, 0).await;

    let user = store
        .get_user(UserId(101))
        .await
        .expect("get should succeed")
        .expect("user should exist");
    assert_eq!(user.balance, Decimal::ZERO);
    assert_eq!(user.subscription, SubscriptionState::default());

    let mut tx = store.begin().await.expect("begin should succeed");
    let inserted = tx
        .insert_user(&User::new(UserId(101)))
        .await
        .expect("insert should succeed");
    assert!(!inserted, "duplicate user must not be inserted");
    tx.rollback().await.expect("rollback should succeed");

    assert!(store
        .get_user(UserId(199))
        .await
        .expect("get should succeed")
        .is_none());
}

pub async fn test_rollback_discards_writes(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 102, 10).await;

    let mut tx = store.begin().await.expect("begin should succeed");
    tx.adjust_balance(UserId(102), Decimal::from(90))
        .await
        .expect("credit should succeed");
    tx.extend_track(UserId(102), Track::Router, 7)
        .await
        .expect("extend should succeed");
    tx.rollback().await.expect("rollback should succeed");

    let user = store.get_user(UserId(102)).await.unwrap().unwrap();
    assert_eq!(user.balance, Decimal::from(10));
    assert_eq!(user.subscription.router.duration_units, 0);
}

pub async fn test_dropped_unit_discards_writes(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 103, 0).await;

    {
        let mut tx = store.begin().await.expect("begin should succeed");
        tx.adjust_balance(UserId(103), Decimal::from(500))
            .await
            .expect("credit should succeed");
    }

    assert_eq!(balance(store, 103).await, Decimal::ZERO);
    // The store stays usable after an abandoned unit.
    seed_user(store, 104, 5).await;
    assert_eq!(balance(store, 104).await, Decimal::from(5));
}

pub async fn test_balance_cannot_go_negative(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 105, 10).await;

    let mut tx = store.begin().await.expect("begin should succeed");
    let result = tx.adjust_balance(UserId(105), Decimal::from(-20)).await;
    assert!(
        matches!(result, Err(StorageError::Constraint(_))),
        "expected constraint violation, got {result:?}"
    );
    tx.rollback().await.expect("rollback should succeed");

    assert_eq!(balance(store, 105).await, Decimal::from(10));
}

pub async fn test_balance_capped_at_column_maximum(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 112, 0).await;

    let mut tx = store.begin().await.expect("begin should succeed");
    let full = tx
        .adjust_balance(UserId(112), MAX_AMOUNT)
        .await
        .expect("credit up to the maximum should succeed");
    assert_eq!(full, MAX_AMOUNT);
    tx.commit().await.expect("commit should succeed");

    let mut tx = store.begin().await.expect("begin should succeed");
    let result = tx.adjust_balance(UserId(112), Decimal::new(1, 4)).await;
    assert!(
        matches!(result, Err(StorageError::Constraint(_))),
        "expected constraint violation, got {result:?}"
    );
    tx.rollback().await.expect("rollback should succeed");

    assert_eq!(balance(store, 112).await, MAX_AMOUNT);
}

pub async fn test_idempotency_key_bound_to_purchase(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 113, 0).await;
    seed_user(store, 114, 500).await;
    let service = service(store);

    let deposit = service
        .initiate_deposit(113, Decimal::from(1000), 30, "combo", Origin::CardWebhook)
        .await
        .expect("deposit should be initiated");

    let err = service
        .process_balance_payment(BalancePurchase {
            user_id: 114,
            amount: Decimal::from(1000),
            period: 30,
            track: "combo".to_string(),
            idempotency_key: Some(deposit.payment_id.clone()),
        })
        .await
        .expect_err("a deposit ID must not settle a balance purchase");
    assert_eq!(err.kind(), ErrorKind::IdempotencyKeyConflict);

    assert_eq!(balance(store, 113).await, Decimal::ZERO);
    assert_eq!(balance(store, 114).await, Decimal::from(500));
    let stored = store
        .get_intent(&deposit.payment_id)
        .await
        .expect("get should succeed")
        .expect("deposit should exist");
    assert_eq!(stored.status, PaymentStatus::Pending);
}

pub async fn test_intent_inserted_once(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 106, 0).await;
    let intent = draft("it_intent_once", 106).into_pending();

    let mut tx = store.begin().await.expect("begin should succeed");
    assert!(tx.insert_intent(&intent).await.expect("insert should succeed"));
    assert!(!tx.insert_intent(&intent).await.expect("insert should succeed"));
    let held = tx
        .lock_intent("it_intent_once")
        .await
        .expect("lock should succeed")
        .expect("intent should exist");
    assert_eq!(held.amount, Decimal::new(12_550, 2));
    assert_eq!(held.status, PaymentStatus::Pending);
    tx.update_intent_status("it_intent_once", PaymentStatus::Failed, Some("expired"))
        .await
        .expect("update should succeed");
    tx.commit().await.expect("commit should succeed");

    let stored = store
        .get_intent("it_intent_once")
        .await
        .expect("get should succeed")
        .expect("intent should exist");
    assert_eq!(stored.user_id, UserId(106));
    assert_eq!(stored.period, 30);
    assert_eq!(stored.track, Track::Combo);
    assert_eq!(stored.origin, Origin::CryptoWebhook);
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("expired"));
}

pub async fn test_list_intents_newest_first(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 107, 0).await;

    for payment_id in ["it_list_a", "it_list_b"] {
        let mut tx = store.begin().await.expect("begin should succeed");
        tx.insert_intent(&draft(payment_id, 107).into_pending())
            .await
            .expect("insert should succeed");
        tx.commit().await.expect("commit should succeed");
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let ids: Vec<_> = store
        .list_intents(UserId(107))
        .await
        .expect("list should succeed")
        .into_iter()
        .map(|intent| intent.payment_id)
        .collect();
    assert_eq!(ids, vec!["it_list_b", "it_list_a"]);
}

pub async fn test_device_slots(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 108, 0).await;

    let mut tx = store.begin().await.expect("begin should succeed");
    assert_eq!(tx.extend_track(UserId(108), Track::Device, 30).await.unwrap(), 30);
    assert!(tx.insert_device(UserId(108), Track::Device, "phone").await.unwrap());
    assert!(!tx.insert_device(UserId(108), Track::Device, "phone").await.unwrap());
    assert!(tx.insert_device(UserId(108), Track::Router, "phone").await.unwrap());
    tx.set_combo_type(UserId(108), 2).await.unwrap();
    tx.commit().await.expect("commit should succeed");

    let user = store.get_user(UserId(108)).await.unwrap().unwrap();
    assert!(user.subscription.device.devices.contains("phone"));
    assert!(user.subscription.router.devices.contains("phone"));
    assert_eq!(user.subscription.combo_type, 2);

    let mut tx = store.begin().await.expect("begin should succeed");
    assert!(tx.delete_device(UserId(108), Track::Device, "phone").await.unwrap());
    assert!(!tx.delete_device(UserId(108), Track::Device, "phone").await.unwrap());
    tx.commit().await.expect("commit should succeed");
}

pub async fn test_referral_recorded_once(store: &Arc<dyn LedgerStore>) {
    for id in [109, 110, 111] {
        seed_user(store, id, 0).await;
    }

    let mut tx = store.begin().await.expect("begin should succeed");
    assert!(tx
        .insert_referral(&ReferralBonus::new(UserId(110), UserId(109)))
        .await
        .unwrap());
    assert!(!tx
        .insert_referral(&ReferralBonus::new(UserId(110), UserId(111)))
        .await
        .unwrap());
    tx.commit().await.expect("commit should succeed");

    assert_eq!(store.count_referrals(UserId(109)).await.unwrap(), 1);
    assert_eq!(store.count_referrals(UserId(111)).await.unwrap(), 0);
}

// =============================================================================
// Billing properties under concurrency
// =============================================================================

pub async fn test_redelivered_webhooks_apply_once(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 201, 0).await;
    let service = service(store);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .process_webhook_payment(webhook("it_pay_dup", 201, 100, "router", 7))
                    .await
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        let outcome = handle
            .await
            .expect("task should not panic")
            .expect("delivery should be acknowledged");
        if matches!(outcome, Outcome::Applied { .. }) {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    let user = store.get_user(UserId(201)).await.unwrap().unwrap();
    assert_eq!(user.balance, Decimal::from(100));
    assert_eq!(user.subscription.router.duration_units, 7);
}

pub async fn test_concurrent_debits_never_overdraw(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 202, 100).await;
    let service = service(store);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .process_balance_payment(BalancePurchase {
                        user_id: 202,
                        amount: Decimal::from(30),
                        period: 1,
                        track: "device".to_string(),
                        idempotency_key: None,
                    })
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.expect("task should not panic") {
            Ok(_) => succeeded += 1,
            Err(err) => assert!(
                matches!(err, vpn_billing::BillingError::InsufficientBalance { .. }),
                "unexpected failure: {err}"
            ),
        }
    }

    assert_eq!(succeeded, 3);
    let user = store.get_user(UserId(202)).await.unwrap().unwrap();
    assert_eq!(user.balance, Decimal::from(10));
    assert_eq!(user.subscription.device.duration_units, 3);
}

pub async fn test_concurrent_extensions_lose_no_update(store: &Arc<dyn LedgerStore>) {
    seed_user(store, 203, 0).await;
    let service = service(store);

    let handles: Vec<_> = (1..=10i64)
        .map(|period| {
            let service = service.clone();
            tokio::spawn(async move { service.extend_subscription(203, "combo", period).await })
        })
        .collect();
    for handle in handles {
        handle
            .await
            .expect("task should not panic")
            .expect("extension should succeed");
    }

    let combo = service.get_subscription(203, "combo").await.unwrap();
    assert_eq!(combo.duration_units, 55);
}

pub async fn test_concurrent_referrals_credit_once(store: &Arc<dyn LedgerStore>) {
    for id in [204, 205, 206] {
        seed_user(store, id, 0).await;
    }
    let service = service(store);

    let a = {
        let service = service.clone();
        tokio::spawn(async move { service.apply_referral(206, 204).await })
    };
    let b = {
        let service = service.clone();
        tokio::spawn(async move { service.apply_referral(206, 205).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(balance(store, 206).await, Decimal::from(50));
    let referrers = balance(store, 204).await + balance(store, 205).await;
    assert_eq!(referrers, Decimal::from(100));
}

#[macro_export]
macro_rules! run_ledger_store_tests {
    ($store:expr) => {
        use $crate::storage::ledger_tests::*;

        // unit-of-work tests
        test_user_roundtrip($store).await;
        println!("  test_user_roundtrip: PASSED");

        test_rollback_discards_writes($store).await;
        println!("  test_rollback_discards_writes: PASSED");

        test_dropped_unit_discards_writes($store).await;
        println!("  test_dropped_unit_discards_writes: PASSED");

        test_balance_cannot_go_negative($store).await;
        println!("  test_balance_cannot_go_negative: PASSED");

        test_balance_capped_at_column_maximum($store).await;
        println!("  test_balance_capped_at_column_maximum: PASSED");

        test_idempotency_key_bound_to_purchase($store).await;
        println!("  test_idempotency_key_bound_to_purchase: PASSED");

        test_intent_inserted_once($store).await;
        println!("  test_intent_inserted_once: PASSED");

        test_list_intents_newest_first($store).await;
        println!("  test_list_intents_newest_first: PASSED");

        test_device_slots($store).await;
        println!("  test_device_slots: PASSED");

        test_referral_recorded_once($store).await;
        println!("  test_referral_recorded_once: PASSED");
    };
}

#[macro_export]
macro_rules! run_billing_concurrency_tests {
    ($store:expr) => {
        use $crate::storage::ledger_tests::*;

        test_redelivered_webhooks_apply_once($store).await;
        println!("  test_redelivered_webhooks_apply_once: PASSED");

        test_concurrent_debits_never_overdraw($store).await;
        println!("  test_concurrent_debits_never_overdraw: PASSED");

        test_concurrent_extensions_lose_no_update($store).await;
        println!("  test_concurrent_extensions_lose_no_update: PASSED");

        test_concurrent_referrals_credit_once($store).await;
        println!("  test_concurrent_referrals_credit_once: PASSED");
    };
}
