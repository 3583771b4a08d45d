//! Subscription ledger: per-user, per-track duration counters and device slots.

use std::sync::Arc;

use tracing::info;

use super::{finish, BillingError, Result};
use crate::interfaces::{LedgerStore, LedgerTx};
use crate::model::{SubscriptionState, Track, TrackState, User, UserId};
use crate::utils::retry::{with_retry, RetryConfig};

/// Duration counters and slot assignments for the three tracks.
///
/// Extension is additive. Every mutation holds the user row for the whole
/// unit, so concurrent extensions of the same track serialize.
#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn LedgerStore>,
    retry: RetryConfig,
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Add `units` to a track. Returns the new duration.
    #[tracing::instrument(name = "subscription.extend", skip_all, fields(%user_id, %track, units = units))]
    pub async fn extend(&self, user_id: UserId, track: Track, units: u32) -> Result<u32> {
        let duration = with_retry(&self.retry, "subscription.extend", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<u32> = async {
                lock_user(tx.as_mut(), user_id).await?;
                Self::extend_in(tx.as_mut(), user_id, track, units).await
            }
            .await;
            finish(tx, result).await
        })
        .await?;

        info!(duration_units = duration, "Subscription extended");
        Ok(duration)
    }

    /// Extend inside an open unit. The caller must already hold the user.
    pub(crate) async fn extend_in(
        tx: &mut dyn LedgerTx,
        user_id: UserId,
        track: Track,
        units: u32,
    ) -> Result<u32> {
        Ok(tx.extend_track(user_id, track, units).await?)
    }

    pub async fn get(&self, user_id: UserId, track: Track) -> Result<TrackState> {
        Ok(self.state(user_id).await?.track(track).clone())
    }

    pub async fn state(&self, user_id: UserId) -> Result<SubscriptionState> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))?;
        Ok(user.subscription)
    }

    /// Assign a device slot on an active track.
    #[tracing::instrument(name = "subscription.assign_slot", skip_all, fields(%user_id, %track, device = %device))]
    pub async fn assign_slot(&self, user_id: UserId, track: Track, device: &str) -> Result<()> {
        with_retry(&self.retry, "subscription.assign_slot", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<()> = async {
                let user = lock_user(tx.as_mut(), user_id).await?;
                if !user.subscription.track(track).is_active() {
                    return Err(BillingError::NoActiveSubscription { user_id, track });
                }
                if !tx.insert_device(user_id, track, device).await? {
                    return Err(BillingError::SlotAlreadyAssigned {
                        user_id,
                        track,
                        device: device.to_string(),
                    });
                }
                Ok(())
            }
            .await;
            finish(tx, result).await
        })
        .await?;

        info!("Device slot assigned");
        Ok(())
    }

    /// Free a device slot. Works on expired tracks too.
    #[tracing::instrument(name = "subscription.release_slot", skip_all, fields(%user_id, %track, device = %device))]
    pub async fn release_slot(&self, user_id: UserId, track: Track, device: &str) -> Result<()> {
        with_retry(&self.retry, "subscription.release_slot", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<()> = async {
                lock_user(tx.as_mut(), user_id).await?;
                if !tx.delete_device(user_id, track, device).await? {
                    return Err(BillingError::SlotNotAssigned {
                        user_id,
                        track,
                        device: device.to_string(),
                    });
                }
                Ok(())
            }
            .await;
            finish(tx, result).await
        })
        .await?;

        info!("Device slot released");
        Ok(())
    }

    pub async fn set_combo_type(&self, user_id: UserId, combo_type: i32) -> Result<()> {
        with_retry(&self.retry, "subscription.set_combo_type", move || async move {
            let mut tx = self.store.begin().await?;
            let result: Result<()> = async {
                lock_user(tx.as_mut(), user_id).await?;
                tx.set_combo_type(user_id, combo_type).await?;
                Ok(())
            }
            .await;
            finish(tx, result).await
        })
        .await
    }
}

/// Hold the user row for the rest of the unit.
pub(crate) async fn lock_user(tx: &mut dyn LedgerTx, user_id: UserId) -> Result<User> {
    tx.lock_user(user_id)
        .await?
        .ok_or(BillingError::UserNotFound(user_id))
}
