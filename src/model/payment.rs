//! Payment intents: the idempotency-keyed audit record of one payment attempt.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ParseError, ParseTarget, Track, UserId};

/// Channel that produced a payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Direct debit of the user's balance.
    Balance,
    /// Card processor webhook (YooKassa).
    CardWebhook,
    /// Crypto processor webhook (CryptoBot).
    CryptoWebhook,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Balance => "balance",
            Origin::CardWebhook => "card-webhook",
            Origin::CryptoWebhook => "crypto-webhook",
        }
    }

    pub fn is_webhook(&self) -> bool {
        !matches!(self, Origin::Balance)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balance" => Ok(Origin::Balance),
            "card-webhook" | "ukassa" => Ok(Origin::CardWebhook),
            "crypto-webhook" | "crypto" => Ok(Origin::CryptoWebhook),
            other => Err(ParseError::new(ParseTarget::Origin, other)),
        }
    }
}

/// Lifecycle state of a [`PaymentIntent`].
///
/// Transitions are monotonic: `Pending -> Succeeded` or `Pending -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(ParseError::new(ParseTarget::PaymentStatus, other)),
        }
    }
}

/// Outcome claimed by an inbound notification, normalised across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportedStatus {
    Succeeded,
    Failed,
    /// Not yet final on the provider side; nothing is applied.
    Pending,
}

/// Classifies the raw status strings sent by the card and crypto processors.
impl FromStr for ReportedStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" | "paid" | "invoice_paid" => Ok(ReportedStatus::Succeeded),
            "failed" | "canceled" | "cancelled" | "expired" | "invoice_expired" => {
                Ok(ReportedStatus::Failed)
            }
            "pending" | "waiting_for_capture" | "active" => Ok(ReportedStatus::Pending),
            other => Err(ParseError::new(ParseTarget::ReportedStatus, other)),
        }
    }
}

/// Fields of a payment attempt before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentDraft {
    pub payment_id: String,
    pub user_id: UserId,
    pub amount: Decimal,
    pub period: u32,
    pub track: Track,
    pub origin: Origin,
}

impl IntentDraft {
    /// Materialise the draft as a fresh `pending` intent.
    pub fn into_pending(self) -> PaymentIntent {
        PaymentIntent {
            payment_id: self.payment_id,
            user_id: self.user_id,
            amount: self.amount,
            period: self.period,
            track: self.track,
            origin: self.origin,
            status: PaymentStatus::Pending,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    /// True when `intent` records the same attempt as this draft.
    pub fn matches(&self, intent: &PaymentIntent) -> bool {
        self.user_id == intent.user_id
            && self.amount == intent.amount
            && self.period == intent.period
            && self.track == intent.track
    }
}

/// Durable record of one payment attempt, keyed by `payment_id`.
///
/// Retained indefinitely as an audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub payment_id: String,
    pub user_id: UserId,
    pub amount: Decimal,
    pub period: u32,
    pub track: Track,
    pub origin: Origin,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
