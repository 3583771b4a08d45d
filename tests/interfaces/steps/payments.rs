//! Reconciliation and balance purchase step definitions.

use cucumber::{given, then, when, World};
use rust_decimal::Decimal;

use vpn_billing::test_utils::{purchase, seed_user, webhook};
use vpn_billing::{BillingError, BillingService, Outcome, PaymentIntent};

use crate::backend::{LedgerContext, StorageBackend};

/// Test context for payment scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct PaymentWorld {
    backend: StorageBackend,
    context: Option<LedgerContext>,
    last_outcome: Option<Outcome>,
    last_error: Option<BillingError>,
    replays: Vec<Outcome>,
    deposit: Option<PaymentIntent>,
    purchase_results: Vec<Result<Outcome, BillingError>>,
}

impl PaymentWorld {
    fn new() -> Self {
        Self {
            backend: StorageBackend::from_env(),
            context: None,
            last_outcome: None,
            last_error: None,
            replays: Vec::new(),
            deposit: None,
            purchase_results: Vec::new(),
        }
    }

    fn ctx(&self) -> &LedgerContext {
        self.context
            .as_ref()
            .expect("Ledger context not initialized")
    }

    fn service(&self) -> &BillingService {
        &self.ctx().service
    }

    fn record(&mut self, result: Result<Outcome, BillingError>) {
        match result {
            Ok(outcome) => {
                self.last_outcome = Some(outcome);
                self.last_error = None;
            }
            Err(err) => {
                self.last_outcome = None;
                self.last_error = Some(err);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &mut self,
        payment_id: &str,
        status: &str,
        user_id: i64,
        amount: i64,
        track: &str,
        units: i64,
    ) {
        let payment = webhook(payment_id, user_id, Decimal::from(amount), track, units, status);
        let result = self.service().process_webhook_payment(payment).await;
        self.record(result);
    }
}

fn outcome_name(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Applied { .. } => "applied",
        Outcome::Rejected { .. } => "rejected",
        Outcome::Pending { .. } => "pending",
        Outcome::Replayed { .. } => "replayed",
    }
}

// --- Background ---

#[given("a billing ledger")]
async fn given_billing_ledger(world: &mut PaymentWorld) {
    println!("Using backend: {}", world.backend.name());
    world.context = Some(LedgerContext::new(world.backend).await);
}

#[given(expr = "user {int} with balance {int}")]
async fn given_user_with_balance(world: &mut PaymentWorld, user_id: i64, balance: i64) {
    seed_user(world.ctx().store.as_ref(), user_id, Decimal::from(balance))
        .await
        .expect("Failed to seed user");
}

// --- Given steps ---

#[given(
    expr = "webhook {string} reported {string} for user {int} amount {int} on track {string} for {int} units"
)]
async fn given_webhook_reported(
    world: &mut PaymentWorld,
    payment_id: String,
    status: String,
    user_id: i64,
    amount: i64,
    track: String,
    units: i64,
) {
    world
        .deliver(&payment_id, &status, user_id, amount, &track, units)
        .await;
    assert!(
        world.last_error.is_none(),
        "setup delivery failed: {:?}",
        world.last_error
    );
}

// --- When steps ---

#[when(
    expr = "webhook {string} reports {string} for user {int} amount {int} on track {string} for {int} units"
)]
async fn when_webhook_reports(
    world: &mut PaymentWorld,
    payment_id: String,
    status: String,
    user_id: i64,
    amount: i64,
    track: String,
    units: i64,
) {
    world
        .deliver(&payment_id, &status, user_id, amount, &track, units)
        .await;
}

#[when(expr = "webhook {string} is delivered {int} more times")]
async fn when_webhook_redelivered(world: &mut PaymentWorld, payment_id: String, times: usize) {
    let stored = world
        .service()
        .get_payment(&payment_id)
        .await
        .expect("Payment should exist");

    for _ in 0..times {
        let payment = webhook(
            &payment_id,
            stored.user_id.0,
            stored.amount,
            stored.track.as_str(),
            i64::from(stored.period),
            "succeeded",
        );
        let outcome = world
            .service()
            .process_webhook_payment(payment)
            .await
            .expect("Redelivery should be acknowledged");
        world.replays.push(outcome);
    }
}

#[when(expr = "user {int} initiates a deposit of {int} on track {string} for {int} units")]
async fn when_user_initiates_deposit(
    world: &mut PaymentWorld,
    user_id: i64,
    amount: i64,
    track: String,
    units: i64,
) {
    let deposit = world
        .service()
        .initiate_deposit(
            user_id,
            Decimal::from(amount),
            units,
            &track,
            vpn_billing::Origin::CryptoWebhook,
        )
        .await
        .expect("Failed to initiate deposit");
    world.deposit = Some(deposit);
}

#[when(expr = "the deposit is confirmed with {string}")]
async fn when_deposit_confirmed(world: &mut PaymentWorld, status: String) {
    let payment_id = world
        .deposit
        .as_ref()
        .expect("No deposit initiated")
        .payment_id
        .clone();
    let result = world.service().confirm_deposit(&payment_id, &status).await;
    world.record(result);
}

#[when(expr = "deposit {string} is confirmed with {string}")]
async fn when_named_deposit_confirmed(world: &mut PaymentWorld, payment_id: String, status: String) {
    let result = world.service().confirm_deposit(&payment_id, &status).await;
    world.record(result);
}

#[when(expr = "user {int} buys {int} units on track {string} for {int} from balance")]
async fn when_user_buys(
    world: &mut PaymentWorld,
    user_id: i64,
    units: i64,
    track: String,
    amount: i64,
) {
    let request = purchase(user_id, Decimal::from(amount), &track, units);
    let result = world.service().process_balance_payment(request).await;
    world.record(result);
}

#[when(expr = "user {int} buys {int} units on track {string} for {int} from balance with key {string}")]
async fn when_user_buys_with_key(
    world: &mut PaymentWorld,
    user_id: i64,
    units: i64,
    track: String,
    amount: i64,
    key: String,
) {
    let mut request = purchase(user_id, Decimal::from(amount), &track, units);
    request.idempotency_key = Some(key);
    let result = world.service().process_balance_payment(request).await;
    world.record(result);
}

#[when(expr = "user {int} buys {int} units on track {string} for {int} from balance keyed by the deposit")]
async fn when_user_buys_keyed_by_deposit(
    world: &mut PaymentWorld,
    user_id: i64,
    units: i64,
    track: String,
    amount: i64,
) {
    let key = world
        .deposit
        .as_ref()
        .expect("No deposit initiated")
        .payment_id
        .clone();
    let mut request = purchase(user_id, Decimal::from(amount), &track, units);
    request.idempotency_key = Some(key);
    let result = world.service().process_balance_payment(request).await;
    world.record(result);
}

#[when(regex = r#"^user (\d+) buys (\d+) units on track "(\w+)" for (\d*\.\d+) from balance$"#)]
async fn when_user_buys_fractional(
    world: &mut PaymentWorld,
    user_id: i64,
    units: i64,
    track: String,
    amount: String,
) {
    let amount: Decimal = amount.parse().expect("Amount should be a decimal");
    let request = purchase(user_id, amount, &track, units);
    let result = world.service().process_balance_payment(request).await;
    world.record(result);
}

#[when(expr = "user {int} makes {int} concurrent purchases of {int} on track {string}")]
async fn when_concurrent_purchases(
    world: &mut PaymentWorld,
    user_id: i64,
    count: usize,
    amount: i64,
    track: String,
) {
    let handles: Vec<_> = (0..count)
        .map(|_| {
            let service = world.service().clone();
            let request = purchase(user_id, Decimal::from(amount), &track, 1);
            tokio::spawn(async move { service.process_balance_payment(request).await })
        })
        .collect();

    for handle in handles {
        world
            .purchase_results
            .push(handle.await.expect("Purchase task panicked"));
    }
}

// --- Then steps ---

#[then(expr = "the outcome is {string}")]
async fn then_outcome_is(world: &mut PaymentWorld, expected: String) {
    let outcome = world
        .last_outcome
        .as_ref()
        .unwrap_or_else(|| panic!("Expected outcome, got error {:?}", world.last_error));
    assert_eq!(outcome_name(outcome), expected);
}

#[then(expr = "the request fails with {string}")]
async fn then_request_fails(world: &mut PaymentWorld, kind: String) {
    let err = world
        .last_error
        .as_ref()
        .unwrap_or_else(|| panic!("Expected error, got {:?}", world.last_outcome));
    assert_eq!(format!("{:?}", err.kind()), kind, "{err}");
}

#[then("every redelivery is a replay")]
async fn then_every_redelivery_replays(world: &mut PaymentWorld) {
    assert!(!world.replays.is_empty());
    assert!(world.replays.iter().all(Outcome::is_replay));
}

#[then(expr = "{int} purchases succeed")]
async fn then_purchases_succeed(world: &mut PaymentWorld, expected: usize) {
    let succeeded = world.purchase_results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, expected);
    for err in world.purchase_results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(err, BillingError::InsufficientBalance { .. }),
            "unexpected failure: {err}"
        );
    }
}

#[then(expr = "user {int} has balance {int}")]
async fn then_user_balance(world: &mut PaymentWorld, user_id: i64, expected: i64) {
    let user = world.service().get_user(user_id).await.expect("User should exist");
    assert_eq!(user.balance, Decimal::from(expected));
    assert!(user.balance >= Decimal::ZERO);
}

#[then(expr = "user {int} has {int} units on track {string}")]
async fn then_user_units(world: &mut PaymentWorld, user_id: i64, expected: u32, track: String) {
    let state = world
        .service()
        .get_subscription(user_id, &track)
        .await
        .expect("Subscription should be readable");
    assert_eq!(state.duration_units, expected);
}

#[then(expr = "user {int} has {int} payments")]
async fn then_user_payments(world: &mut PaymentWorld, user_id: i64, expected: usize) {
    let payments = world
        .service()
        .list_payments(user_id)
        .await
        .expect("Payments should be listable");
    assert_eq!(payments.len(), expected);
}

#[then(expr = "payment {string} has status {string}")]
async fn then_payment_status(world: &mut PaymentWorld, payment_id: String, status: String) {
    let intent = world
        .service()
        .get_payment(&payment_id)
        .await
        .expect("Payment should exist");
    assert_eq!(intent.status.as_str(), status);
}

#[then(expr = "payment {string} does not exist")]
async fn then_payment_missing(world: &mut PaymentWorld, payment_id: String) {
    match world.service().get_payment(&payment_id).await {
        Err(err) => assert!(err.is_not_found(), "{err}"),
        Ok(intent) => panic!("Unexpected intent {intent:?}"),
    }
}
