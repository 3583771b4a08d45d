//! Referral records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// One referral: `user_id` was brought in by `referrer_id`.
///
/// At most one record exists per `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralBonus {
    pub user_id: UserId,
    pub referrer_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl ReferralBonus {
    pub fn new(user_id: UserId, referrer_id: UserId) -> Self {
        Self {
            user_id,
            referrer_id,
            created_at: Utc::now(),
        }
    }
}
