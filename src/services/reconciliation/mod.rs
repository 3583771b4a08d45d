//! Reconciliation engine: turns payment notifications into exactly-once
//! ledger effects.
//!
//! Every entry point resolves the payment intent, checks its status and
//! applies the balance change, the subscription extension and the status
//! transition inside one unit of work. A notification for an intent that is
//! already terminal is acknowledged as a replay and changes nothing.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use super::intent_tracker::PaymentIntentTracker;
use super::subscription::{lock_user, SubscriptionLedger};
use super::{finish, BillingError, Result};
use crate::interfaces::{LedgerStore, LedgerTx};
use crate::model::{IntentDraft, Origin, PaymentIntent, PaymentStatus, ReportedStatus, UserId};
use crate::utils::retry::{with_retry, RetryConfig};
use crate::validation::{
    parse_reported_status, parse_track, validate_amount, validate_payment_id, validate_period,
};

/// Prefix of synthetic payment IDs for balance purchases.
pub const BALANCE_ID_PREFIX: &str = "balance_";

/// Notification tuple delivered by the webhook ingress after signature
/// verification. Fields are raw and validated here.
#[derive(Debug, Clone)]
pub struct WebhookPayment {
    pub payment_id: String,
    pub user_id: i64,
    pub amount: Decimal,
    pub period: i64,
    pub track: String,
    pub origin: Origin,
    pub status: String,
}

/// A validated payment notification.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub draft: IntentDraft,
    pub status: ReportedStatus,
    /// Provider status string, recorded as the failure reason.
    pub raw_status: String,
}

impl TryFrom<WebhookPayment> for PaymentEvent {
    type Error = BillingError;

    fn try_from(payment: WebhookPayment) -> Result<Self> {
        validate_payment_id(&payment.payment_id)?;
        if !payment.origin.is_webhook() {
            return Err(BillingError::InvalidOrigin(payment.origin.to_string()));
        }
        let amount = validate_amount(payment.amount)?;
        let period = validate_period(payment.period)?;
        let track = parse_track(&payment.track)?;
        let status = parse_reported_status(&payment.status)?;

        Ok(Self {
            draft: IntentDraft {
                payment_id: payment.payment_id,
                user_id: UserId(payment.user_id),
                amount,
                period,
                track,
                origin: payment.origin,
            },
            status,
            raw_status: payment.status,
        })
    }
}

/// Direct purchase paid from the user's balance.
#[derive(Debug, Clone)]
pub struct BalancePurchase {
    pub user_id: i64,
    pub amount: Decimal,
    pub period: i64,
    pub track: String,
    /// Client-supplied key that makes resubmission of the same request a
    /// replay. A fresh `balance_<uuid>` is used when absent.
    pub idempotency_key: Option<String>,
}

/// Result of reconciling one payment event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The effect was applied by this call.
    Applied {
        intent: PaymentIntent,
        balance: Decimal,
        duration_units: u32,
    },
    /// The payment failed; nothing was applied.
    Rejected { intent: PaymentIntent },
    /// The provider has not settled the payment yet.
    Pending { intent: PaymentIntent },
    /// The intent was already terminal; nothing changed.
    Replayed { intent: PaymentIntent },
}

impl Outcome {
    pub fn intent(&self) -> &PaymentIntent {
        match self {
            Outcome::Applied { intent, .. }
            | Outcome::Rejected { intent }
            | Outcome::Pending { intent }
            | Outcome::Replayed { intent } => intent,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed { .. })
    }
}

/// Applies payment outcomes to balances and subscriptions exactly once.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    retry: RetryConfig,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Reconcile a provider notification. Redelivery is acknowledged as
    /// [`Outcome::Replayed`], never an error.
    #[tracing::instrument(
        name = "reconciliation.webhook",
        skip_all,
        fields(payment_id = %payment.payment_id, user_id = payment.user_id, origin = %payment.origin)
    )]
    pub async fn process_webhook(&self, payment: WebhookPayment) -> Result<Outcome> {
        let event = PaymentEvent::try_from(payment)?;
        let event = &event;

        let outcome = with_retry(&self.retry, "reconciliation.webhook", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<Outcome> = async {
                let (intent, _) =
                    PaymentIntentTracker::get_or_create_in(tx.as_mut(), &event.draft).await?;
                Self::resolve_in(tx.as_mut(), intent, event.status, &event.raw_status).await
            }
            .await;
            finish(tx, result).await
        })
        .await?;

        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Settle an existing intent by payment ID alone.
    #[tracing::instrument(name = "reconciliation.confirm", skip_all, fields(%payment_id, %status))]
    pub async fn confirm_deposit(&self, payment_id: &str, status: &str) -> Result<Outcome> {
        validate_payment_id(payment_id)?;
        let reported = parse_reported_status(status)?;

        let outcome = with_retry(&self.retry, "reconciliation.confirm", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<Outcome> = async {
                let intent = tx
                    .lock_intent(payment_id)
                    .await?
                    .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))?;
                Self::resolve_in(tx.as_mut(), intent, reported, status).await
            }
            .await;
            finish(tx, result).await
        })
        .await?;

        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Buy subscription time from the user's balance.
    ///
    /// Debits `amount` and extends the track in one unit; fails with
    /// `InsufficientBalance` and changes nothing if the balance is short.
    /// A client idempotency key only replays a balance purchase with the same
    /// user, amount, period and track; any other payment under that ID fails
    /// with `IdempotencyKeyConflict`.
    #[tracing::instrument(name = "reconciliation.balance", skip_all, fields(user_id = purchase.user_id, track = %purchase.track))]
    pub async fn process_balance_payment(&self, purchase: BalancePurchase) -> Result<Outcome> {
        let amount = validate_amount(purchase.amount)?;
        let period = validate_period(purchase.period)?;
        let track = parse_track(&purchase.track)?;
        // Fixed before the retry loop so a retried unit replays instead of
        // charging twice.
        let payment_id = match purchase.idempotency_key {
            Some(key) => {
                validate_payment_id(&key)?;
                key
            }
            None => format!("{BALANCE_ID_PREFIX}{}", Uuid::new_v4()),
        };

        let draft = IntentDraft {
            payment_id,
            user_id: UserId(purchase.user_id),
            amount,
            period,
            track,
            origin: Origin::Balance,
        };
        let draft = &draft;

        let outcome = with_retry(&self.retry, "reconciliation.balance", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<Outcome> = async {
                let (intent, _) =
                    PaymentIntentTracker::get_or_create_in(tx.as_mut(), draft).await?;
                if !is_same_purchase(&intent, draft) {
                    return Err(BillingError::IdempotencyKeyConflict(
                        intent.payment_id.clone(),
                    ));
                }
                Self::resolve_in(
                    tx.as_mut(),
                    intent,
                    ReportedStatus::Succeeded,
                    PaymentStatus::Succeeded.as_str(),
                )
                .await
            }
            .await;
            finish(tx, result).await
        })
        .await?;

        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Decide and apply the effect for a held intent.
    async fn resolve_in(
        tx: &mut dyn LedgerTx,
        mut intent: PaymentIntent,
        reported: ReportedStatus,
        raw_status: &str,
    ) -> Result<Outcome> {
        if intent.status.is_terminal() {
            return Ok(Outcome::Replayed { intent });
        }

        match reported {
            ReportedStatus::Pending => Ok(Outcome::Pending { intent }),
            ReportedStatus::Failed => {
                PaymentIntentTracker::mark_failed_in(tx, &intent.payment_id, raw_status).await?;
                intent.status = PaymentStatus::Failed;
                intent.failure_reason = Some(raw_status.to_string());
                Ok(Outcome::Rejected { intent })
            }
            ReportedStatus::Succeeded => Self::apply_in(tx, intent).await,
        }
    }

    /// Balance change, extension and status transition for a pending intent.
    /// The stored intent's fields are authoritative.
    async fn apply_in(tx: &mut dyn LedgerTx, mut intent: PaymentIntent) -> Result<Outcome> {
        let user = lock_user(tx, intent.user_id).await?;

        let delta = match intent.origin {
            Origin::Balance => {
                if user.balance < intent.amount {
                    return Err(BillingError::InsufficientBalance {
                        available: user.balance,
                        required: intent.amount,
                    });
                }
                -intent.amount
            }
            Origin::CardWebhook | Origin::CryptoWebhook => intent.amount,
        };

        let balance = tx.adjust_balance(intent.user_id, delta).await?;
        let duration_units =
            SubscriptionLedger::extend_in(tx, intent.user_id, intent.track, intent.period).await?;
        PaymentIntentTracker::mark_succeeded_in(tx, &intent.payment_id).await?;
        intent.status = PaymentStatus::Succeeded;

        Ok(Outcome::Applied {
            intent,
            balance,
            duration_units,
        })
    }
}

/// Whether a stored intent is the balance purchase described by `draft`.
fn is_same_purchase(intent: &PaymentIntent, draft: &IntentDraft) -> bool {
    intent.origin == Origin::Balance
        && intent.user_id == draft.user_id
        && intent.amount == draft.amount
        && intent.period == draft.period
        && intent.track == draft.track
}

fn log_outcome(outcome: &Outcome) {
    let intent = outcome.intent();
    match outcome {
        Outcome::Applied {
            balance,
            duration_units,
            ..
        } => info!(
            payment_id = %intent.payment_id,
            user_id = %intent.user_id,
            track = %intent.track,
            origin = %intent.origin,
            amount = %intent.amount,
            %balance,
            duration_units,
            "Payment applied"
        ),
        Outcome::Rejected { .. } => info!(
            payment_id = %intent.payment_id,
            user_id = %intent.user_id,
            reason = intent.failure_reason.as_deref().unwrap_or_default(),
            "Payment failed, nothing applied"
        ),
        Outcome::Pending { .. } => {
            debug!(payment_id = %intent.payment_id, "Payment still pending")
        }
        Outcome::Replayed { .. } => debug!(
            payment_id = %intent.payment_id,
            status = %intent.status,
            "Intent already terminal, replay acknowledged"
        ),
    }
}
