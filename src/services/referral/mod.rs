//! Referral bonus applier.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use super::{finish, BillingError, Result};
use crate::config::BillingConfig;
use crate::interfaces::{LedgerStore, LedgerTx};
use crate::model::{ReferralBonus, UserId};
use crate::utils::retry::{with_retry, RetryConfig};

/// Applies the one-time referral credit.
///
/// The referral record and both balance credits commit as one unit. A second
/// referral of the same user is rejected by the uniqueness constraint on the
/// referee, not by a prior read.
#[derive(Clone)]
pub struct ReferralBonusApplier {
    store: Arc<dyn LedgerStore>,
    retry: RetryConfig,
    referee_bonus: Decimal,
    referrer_bonus: Decimal,
}

impl ReferralBonusApplier {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryConfig, bonuses: &BillingConfig) -> Self {
        Self {
            store,
            retry,
            referee_bonus: bonuses.referee_bonus,
            referrer_bonus: bonuses.referrer_bonus,
        }
    }

    #[tracing::instrument(name = "referral.apply", skip_all, fields(%user_id, %referrer_id))]
    pub async fn apply(&self, user_id: UserId, referrer_id: UserId) -> Result<ReferralBonus> {
        if user_id == referrer_id {
            return Err(BillingError::SelfReferral(user_id));
        }

        let referral = with_retry(&self.retry, "referral.apply", move || async move {
            let mut tx = self.store.begin().await?;
            let result = self.apply_in(tx.as_mut(), user_id, referrer_id).await;
            finish(tx, result).await
        })
        .await?;

        info!(
            referee_bonus = %self.referee_bonus,
            referrer_bonus = %self.referrer_bonus,
            "Referral applied"
        );
        Ok(referral)
    }

    async fn apply_in(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: UserId,
        referrer_id: UserId,
    ) -> Result<ReferralBonus> {
        // Ascending ID order, so two referrals between the same pair cannot
        // deadlock.
        let (first, second) = if user_id < referrer_id {
            (user_id, referrer_id)
        } else {
            (referrer_id, user_id)
        };
        let first_found = tx.lock_user(first).await?.is_some();
        let second_found = tx.lock_user(second).await?.is_some();
        let (user_found, referrer_found) = if first == user_id {
            (first_found, second_found)
        } else {
            (second_found, first_found)
        };

        if !user_found {
            return Err(BillingError::UserNotFound(user_id));
        }
        if !referrer_found {
            return Err(BillingError::ReferrerNotFound(referrer_id));
        }

        let referral = ReferralBonus::new(user_id, referrer_id);
        if !tx.insert_referral(&referral).await? {
            return Err(BillingError::AlreadyReferred(user_id));
        }

        if !self.referee_bonus.is_zero() {
            tx.adjust_balance(user_id, self.referee_bonus).await?;
        }
        if !self.referrer_bonus.is_zero() {
            tx.adjust_balance(referrer_id, self.referrer_bonus).await?;
        }

        Ok(referral)
    }

    /// Referrals credited to `referrer_id`, oldest first.
    pub async fn list(&self, referrer_id: UserId) -> Result<Vec<ReferralBonus>> {
        Ok(self.store.list_referrals(referrer_id).await?)
    }

    pub async fn count(&self, referrer_id: UserId) -> Result<u64> {
        Ok(self.store.count_referrals(referrer_id).await?)
    }
}
