//! Payment intent tracker: the de-duplication boundary for payment attempts.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{finish, BillingError, Result};
use crate::interfaces::{LedgerStore, LedgerTx, StorageError};
use crate::model::{IntentDraft, Origin, PaymentIntent, PaymentStatus, Track, UserId};
use crate::utils::retry::{with_retry, RetryConfig};

/// Prefix of system-generated deposit IDs.
pub const DEPOSIT_ID_PREFIX: &str = "pay_";

/// Creates and looks up payment intents by payment ID.
#[derive(Clone)]
pub struct PaymentIntentTracker {
    store: Arc<dyn LedgerStore>,
    retry: RetryConfig,
}

impl PaymentIntentTracker {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Resolve or create the intent for `draft` in its own unit of work.
    ///
    /// Returns the stored intent unchanged with `false` if the payment ID is
    /// already known; the caller must not reapply its effects.
    pub async fn get_or_create(&self, draft: IntentDraft) -> Result<(PaymentIntent, bool)> {
        let draft = &draft;
        with_retry(&self.retry, "intent.get_or_create", move || async move {
            let mut tx = self.store.begin().await?;
            let result = Self::get_or_create_in(tx.as_mut(), draft).await;
            finish(tx, result).await
        })
        .await
    }

    /// Resolve or create the intent for `draft` inside an open unit.
    ///
    /// The intent row is held until the unit finishes, so the caller's
    /// status check and transition are atomic with respect to concurrent
    /// deliveries of the same payment ID.
    pub(crate) async fn get_or_create_in(
        tx: &mut dyn LedgerTx,
        draft: &IntentDraft,
    ) -> Result<(PaymentIntent, bool)> {
        let candidate = draft.clone().into_pending();
        if tx.insert_intent(&candidate).await? {
            debug!(payment_id = %candidate.payment_id, "Created pending intent");
            return Ok((candidate, true));
        }

        let existing = tx.lock_intent(&draft.payment_id).await?.ok_or_else(|| {
            StorageError::Corrupt(format!(
                "intent {} rejected by insert but not found",
                draft.payment_id
            ))
        })?;

        if !draft.matches(&existing) {
            warn!(
                payment_id = %existing.payment_id,
                stored_user = %existing.user_id,
                stored_amount = %existing.amount,
                stored_track = %existing.track,
                reported_user = %draft.user_id,
                reported_amount = %draft.amount,
                reported_track = %draft.track,
                "Notification does not match stored intent, using stored record"
            );
        }

        Ok((existing, false))
    }

    /// Open a pending deposit for a webhook-settled payment.
    ///
    /// The provider later settles it by ID through a webhook or
    /// [`ReconciliationEngine::confirm_deposit`](super::ReconciliationEngine::confirm_deposit).
    #[tracing::instrument(name = "intent.initiate", skip_all, fields(%user_id, %track, %origin))]
    pub async fn initiate(
        &self,
        user_id: UserId,
        amount: Decimal,
        period: u32,
        track: Track,
        origin: Origin,
    ) -> Result<PaymentIntent> {
        if !origin.is_webhook() {
            return Err(BillingError::InvalidOrigin(origin.to_string()));
        }

        let draft = IntentDraft {
            payment_id: format!("{DEPOSIT_ID_PREFIX}{}", Uuid::new_v4()),
            user_id,
            amount,
            period,
            track,
            origin,
        };
        let draft = &draft;

        let intent = with_retry(&self.retry, "intent.initiate", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<PaymentIntent> = async {
                tx.lock_user(user_id)
                    .await?
                    .ok_or(BillingError::UserNotFound(user_id))?;
                let (intent, _) = Self::get_or_create_in(tx.as_mut(), draft).await?;
                Ok(intent)
            }
            .await;
            finish(tx, result).await
        })
        .await?;

        info!(payment_id = %intent.payment_id, amount = %intent.amount, "Deposit initiated");
        Ok(intent)
    }

    pub async fn get(&self, payment_id: &str) -> Result<PaymentIntent> {
        self.store
            .get_intent(payment_id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))
    }

    /// All intents for a user, newest first.
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<PaymentIntent>> {
        Ok(self.store.list_intents(user_id).await?)
    }

    pub(crate) async fn mark_failed_in(
        tx: &mut dyn LedgerTx,
        payment_id: &str,
        reason: &str,
    ) -> Result<()> {
        tx.update_intent_status(payment_id, PaymentStatus::Failed, Some(reason))
            .await?;
        Ok(())
    }

    pub(crate) async fn mark_succeeded_in(tx: &mut dyn LedgerTx, payment_id: &str) -> Result<()> {
        tx.update_intent_status(payment_id, PaymentStatus::Succeeded, None)
            .await?;
        Ok(())
    }
}
