//! Referral step definitions.

use cucumber::{given, then, when, World};
use rust_decimal::Decimal;

use vpn_billing::model::ReferralBonus;
use vpn_billing::test_utils::seed_user;
use vpn_billing::{BillingError, BillingService};

use crate::backend::{LedgerContext, StorageBackend};

/// Test context for referral scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct ReferralWorld {
    backend: StorageBackend,
    context: Option<LedgerContext>,
    last_result: Option<Result<ReferralBonus, BillingError>>,
}

impl ReferralWorld {
    fn new() -> Self {
        Self {
            backend: StorageBackend::from_env(),
            context: None,
            last_result: None,
        }
    }

    fn service(&self) -> &BillingService {
        &self
            .context
            .as_ref()
            .expect("Ledger context not initialized")
            .service
    }
}

#[given("a billing ledger")]
async fn given_billing_ledger(world: &mut ReferralWorld) {
    println!("Using backend: {}", world.backend.name());
    world.context = Some(LedgerContext::new(world.backend).await);
}

#[given(expr = "user {int} with balance {int}")]
async fn given_user_with_balance(world: &mut ReferralWorld, user_id: i64, balance: i64) {
    let store = &world
        .context
        .as_ref()
        .expect("Ledger context not initialized")
        .store;
    seed_user(store.as_ref(), user_id, Decimal::from(balance))
        .await
        .expect("Failed to seed user");
}

#[given(expr = "user {int} was referred by user {int}")]
async fn given_user_was_referred(world: &mut ReferralWorld, user_id: i64, referrer_id: i64) {
    world
        .service()
        .apply_referral(user_id, referrer_id)
        .await
        .expect("Setup referral failed");
}

#[when(expr = "user {int} is referred by user {int}")]
async fn when_user_is_referred(world: &mut ReferralWorld, user_id: i64, referrer_id: i64) {
    let result = world.service().apply_referral(user_id, referrer_id).await;
    world.last_result = Some(result);
}

#[then("the referral succeeds")]
async fn then_referral_succeeds(world: &mut ReferralWorld) {
    match world.last_result.as_ref().expect("No referral attempted") {
        Ok(_) => {}
        Err(err) => panic!("Referral failed: {err}"),
    }
}

#[then(expr = "the referral fails with {string}")]
async fn then_referral_fails(world: &mut ReferralWorld, kind: String) {
    match world.last_result.as_ref().expect("No referral attempted") {
        Ok(referral) => panic!("Referral unexpectedly succeeded: {referral:?}"),
        Err(err) => assert_eq!(format!("{:?}", err.kind()), kind, "{err}"),
    }
}

#[then(expr = "user {int} has balance {int}")]
async fn then_user_balance(world: &mut ReferralWorld, user_id: i64, expected: i64) {
    let user = world.service().get_user(user_id).await.expect("User should exist");
    assert_eq!(user.balance, Decimal::from(expected));
}

#[then(expr = "user {int} has {int} referral(s)")]
async fn then_referral_count(world: &mut ReferralWorld, referrer_id: i64, expected: u64) {
    let count = world
        .service()
        .count_referrals(referrer_id)
        .await
        .expect("Referrals should be countable");
    assert_eq!(count, expected);
}
