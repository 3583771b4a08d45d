//! Test utilities.
//!
//! Builders and seeding helpers shared by unit tests, the cucumber suite and
//! the storage integration tests.

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::config::Config;
use crate::interfaces::{LedgerStore, StorageError};
use crate::model::{Origin, User, UserId};
use crate::services::{BalancePurchase, BillingService, WebhookPayment};
use crate::storage::MockLedgerStore;

/// A billing service on a fresh in-memory store, with fast retries.
pub fn memory_service() -> (BillingService, MockLedgerStore) {
    let store = MockLedgerStore::new();
    let service = BillingService::new(Arc::new(store.clone()), &Config::for_test());
    (service, store)
}

/// Register `user_id` with the given opening balance, bypassing the services.
pub async fn seed_user(
    store: &dyn LedgerStore,
    user_id: i64,
    balance: Decimal,
) -> Result<User, StorageError> {
    let mut user = User::new(UserId(user_id));
    let mut tx = store.begin().await?;
    tx.insert_user(&user).await?;
    if !balance.is_zero() {
        user.balance = tx.adjust_balance(user.id, balance).await?;
    }
    tx.commit().await?;
    Ok(user)
}

/// Whole-unit decimal.
pub fn money(units: i64) -> Decimal {
    Decimal::new(units, 0)
}

/// A card webhook notification.
pub fn webhook(
    payment_id: &str,
    user_id: i64,
    amount: Decimal,
    track: &str,
    period: i64,
    status: &str,
) -> WebhookPayment {
    WebhookPayment {
        payment_id: payment_id.to_string(),
        user_id,
        amount,
        period,
        track: track.to_string(),
        origin: Origin::CardWebhook,
        status: status.to_string(),
    }
}

/// A balance purchase without a client idempotency key.
pub fn purchase(user_id: i64, amount: Decimal, track: &str, period: i64) -> BalancePurchase {
    BalancePurchase {
        user_id,
        amount,
        period,
        track: track.to_string(),
        idempotency_key: None,
    }
}
