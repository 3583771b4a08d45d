//! vpn-billing - payment reconciliation and subscription ledger
//!
//! Converts balance debits and card/crypto webhook notifications into
//! exactly-once balance and subscription effects, and applies one-time
//! referral credits.

pub mod config;
pub mod interfaces;
pub mod model;
pub mod services;
pub mod storage;
pub mod utils;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use model::{Origin, PaymentIntent, PaymentStatus, Track, User, UserId};
pub use services::{BalancePurchase, BillingError, BillingService, ErrorKind, Outcome, WebhookPayment};
