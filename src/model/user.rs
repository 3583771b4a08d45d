//! User identity and balance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::SubscriptionState;

/// Numeric user identity, as issued by the messenger front end.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user with its monetary balance and subscription state.
///
/// `balance` is never negative after a committed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub balance: Decimal,
    pub subscription: SubscriptionState,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A fresh user: zero balance, every track zeroed.
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            balance: Decimal::ZERO,
            subscription: SubscriptionState::default(),
            created_at: Utc::now(),
        }
    }
}
