//! Handler-facing billing facade.
//!
//! Converts raw request fields into domain values and routes each operation
//! to the component that owns it. No database handle is exposed.

use std::sync::Arc;

use rust_decimal::Decimal;

use super::{
    BalancePurchase, BillingError, Outcome, PaymentIntentTracker, ReconciliationEngine,
    ReferralBonusApplier, Result, SubscriptionLedger, UserRegistry, WebhookPayment,
};
use crate::config::Config;
use crate::interfaces::LedgerStore;
use crate::model::{Origin, PaymentIntent, ReferralBonus, TrackState, User, UserId};
use crate::storage::init_storage;
use crate::validation::{
    parse_track, validate_amount, validate_device_name, validate_payment_id, validate_period,
};

/// Entry point for request handlers.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn LedgerStore>,
    users: UserRegistry,
    intents: PaymentIntentTracker,
    reconciliation: ReconciliationEngine,
    subscriptions: SubscriptionLedger,
    referrals: ReferralBonusApplier,
}

impl BillingService {
    pub fn new(store: Arc<dyn LedgerStore>, config: &Config) -> Self {
        let retry = config.retry.clone();
        Self {
            users: UserRegistry::new(Arc::clone(&store), retry.clone()),
            intents: PaymentIntentTracker::new(Arc::clone(&store), retry.clone()),
            reconciliation: ReconciliationEngine::new(Arc::clone(&store), retry.clone()),
            subscriptions: SubscriptionLedger::new(Arc::clone(&store), retry.clone()),
            referrals: ReferralBonusApplier::new(Arc::clone(&store), retry, &config.billing),
            store,
        }
    }

    /// Open the configured storage backend and build the service on it.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = init_storage(&config.storage).await?;
        Ok(Self::new(store, config))
    }

    /// Name of the storage backend in use.
    pub fn backend(&self) -> &str {
        self.store.name()
    }

    pub async fn register_user(&self, user_id: i64) -> Result<User> {
        self.users.register(UserId(user_id)).await
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User> {
        self.users.get(UserId(user_id)).await
    }

    /// `InitiateDeposit`: open a pending intent the provider will settle.
    pub async fn initiate_deposit(
        &self,
        user_id: i64,
        amount: Decimal,
        period: i64,
        track: &str,
        origin: Origin,
    ) -> Result<PaymentIntent> {
        let amount = validate_amount(amount)?;
        let period = validate_period(period)?;
        let track = parse_track(track)?;
        self.intents
            .initiate(UserId(user_id), amount, period, track, origin)
            .await
    }

    /// `ProcessWebhookPayment`.
    pub async fn process_webhook_payment(&self, payment: WebhookPayment) -> Result<Outcome> {
        self.reconciliation.process_webhook(payment).await
    }

    /// `ConfirmDeposit`: settle a known intent by ID.
    pub async fn confirm_deposit(&self, payment_id: &str, status: &str) -> Result<Outcome> {
        self.reconciliation.confirm_deposit(payment_id, status).await
    }

    /// `ProcessBalancePayment`.
    pub async fn process_balance_payment(&self, purchase: BalancePurchase) -> Result<Outcome> {
        self.reconciliation.process_balance_payment(purchase).await
    }

    /// `ExtendSubscription`: returns the new duration.
    pub async fn extend_subscription(&self, user_id: i64, track: &str, period: i64) -> Result<u32> {
        let track = parse_track(track)?;
        let units = validate_period(period)?;
        self.subscriptions.extend(UserId(user_id), track, units).await
    }

    pub async fn get_subscription(&self, user_id: i64, track: &str) -> Result<TrackState> {
        let track = parse_track(track)?;
        self.subscriptions.get(UserId(user_id), track).await
    }

    pub async fn assign_device(&self, user_id: i64, track: &str, device: &str) -> Result<()> {
        let track = parse_track(track)?;
        validate_device_name(device)?;
        self.subscriptions
            .assign_slot(UserId(user_id), track, device)
            .await
    }

    pub async fn release_device(&self, user_id: i64, track: &str, device: &str) -> Result<()> {
        let track = parse_track(track)?;
        validate_device_name(device)?;
        self.subscriptions
            .release_slot(UserId(user_id), track, device)
            .await
    }

    pub async fn set_combo_type(&self, user_id: i64, combo_type: i32) -> Result<()> {
        self.subscriptions
            .set_combo_type(UserId(user_id), combo_type)
            .await
    }

    /// `ApplyReferral`.
    pub async fn apply_referral(&self, user_id: i64, referrer_id: i64) -> Result<ReferralBonus> {
        self.referrals
            .apply(UserId(user_id), UserId(referrer_id))
            .await
    }

    pub async fn list_referrals(&self, referrer_id: i64) -> Result<Vec<ReferralBonus>> {
        self.referrals.list(UserId(referrer_id)).await
    }

    pub async fn count_referrals(&self, referrer_id: i64) -> Result<u64> {
        self.referrals.count(UserId(referrer_id)).await
    }

    pub async fn get_payment(&self, payment_id: &str) -> Result<PaymentIntent> {
        validate_payment_id(payment_id)?;
        self.intents.get(payment_id).await
    }

    /// All payment attempts for a user, newest first.
    pub async fn list_payments(&self, user_id: i64) -> Result<Vec<PaymentIntent>> {
        let user_id = UserId(user_id);
        if self.store.get_user(user_id).await?.is_none() {
            return Err(BillingError::UserNotFound(user_id));
        }
        self.intents.list_for_user(user_id).await
    }
}
