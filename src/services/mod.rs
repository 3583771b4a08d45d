//! Billing services.
//!
//! Each component owns one slice of the ledger contract and runs its
//! mutations inside a single [`LedgerTx`] unit of work, retried on storage
//! contention. [`BillingService`] is the facade handlers call.

pub mod billing;
pub mod error;
pub mod intent_tracker;
pub mod reconciliation;
pub mod referral;
pub mod subscription;
pub mod users;

pub use billing::BillingService;
pub use error::{BillingError, ErrorKind, Result};
pub use intent_tracker::PaymentIntentTracker;
pub use reconciliation::{BalancePurchase, Outcome, PaymentEvent, ReconciliationEngine, WebhookPayment};
pub use referral::ReferralBonusApplier;
pub use subscription::SubscriptionLedger;
pub use users::UserRegistry;

use tracing::warn;

use crate::interfaces::LedgerTx;

/// Commit the unit on success, roll it back on failure.
///
/// A failed rollback is logged and the unit error is returned; the
/// backend discards the unfinished unit when it is dropped.
pub(crate) async fn finish<T>(mut tx: Box<dyn LedgerTx>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed, discarding unit of work");
            }
            Err(err)
        }
    }
}
