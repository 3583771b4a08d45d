//! Billing policy configuration.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::validation::validate_amount;

/// Referral bonus amounts.
///
/// Both sides are credited by default. Setting `referee_bonus` to zero gives
/// the referrer-only behaviour of earlier releases.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Credited to the newly referred user.
    pub referee_bonus: Decimal,
    /// Credited to the user who made the referral.
    pub referrer_bonus: Decimal,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            referee_bonus: Decimal::new(50, 0),
            referrer_bonus: Decimal::new(100, 0),
        }
    }
}

impl BillingConfig {
    /// Reject bonuses the ledger cannot credit.
    ///
    /// A bonus is either zero (that side is not credited) or a valid amount.
    pub fn validate(&self) -> Result<(), String> {
        for (name, bonus) in [
            ("referee_bonus", self.referee_bonus),
            ("referrer_bonus", self.referrer_bonus),
        ] {
            if bonus.is_zero() {
                continue;
            }
            validate_amount(bonus).map_err(|err| format!("billing.{name}: {err}"))?;
        }
        Ok(())
    }
}
