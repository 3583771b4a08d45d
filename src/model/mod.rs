//! Domain types shared by the ledger store and the billing services.
//!
//! These are plain data: no I/O, no locking. Mutation rules (exactly-once
//! effects, non-negative balances, additive durations) are enforced by the
//! services that own them, not by the types themselves.

mod payment;
mod referral;
mod subscription;
mod user;

pub use payment::{IntentDraft, Origin, PaymentIntent, PaymentStatus, ReportedStatus};
pub use referral::ReferralBonus;
pub use subscription::{SubscriptionState, Track, TrackState};
pub use user::{User, UserId};

/// Error returned when a wire string does not name a known domain value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {target}: {value}")]
pub struct ParseError {
    pub target: ParseTarget,
    pub value: String,
}

impl ParseError {
    pub(crate) fn new(target: ParseTarget, value: &str) -> Self {
        Self {
            target,
            value: value.to_string(),
        }
    }
}

/// Which domain value a [`ParseError`] was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTarget {
    Track,
    Origin,
    PaymentStatus,
    ReportedStatus,
}

impl std::fmt::Display for ParseTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParseTarget::Track => "track",
            ParseTarget::Origin => "payment origin",
            ParseTarget::PaymentStatus => "payment status",
            ParseTarget::ReportedStatus => "reported status",
        };
        f.write_str(name)
    }
}
