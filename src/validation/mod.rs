//! Input validation for external data.
//!
//! Provides centralized validation for all fields that cross trust boundaries
//! (webhook tuples, purchase requests, device names). Everything here runs
//! before a unit of work is opened.

use rust_decimal::Decimal;

use crate::model::{ReportedStatus, Track};
use crate::services::{BillingError, Result};

/// Length limits for validated fields.
pub mod limits {
    /// Maximum payment ID length (provider invoice IDs, `pay_<uuid>`).
    pub const MAX_PAYMENT_ID_LENGTH: usize = 128;
    /// Maximum device name length (e.g., "android", "living-room-router").
    pub const MAX_DEVICE_NAME_LENGTH: usize = 64;

    use rust_decimal::Decimal;

    /// Decimal places kept by the money columns (`NUMERIC(20, 4)`).
    pub const MAX_AMOUNT_SCALE: u32 = 4;
    /// Largest value a money column holds: 9999999999999999.9999.
    pub const MAX_AMOUNT: Decimal =
        Decimal::from_parts(1_661_992_959, 1_808_227_885, 5, false, MAX_AMOUNT_SCALE);
}

/// Validate a payment or purchase amount.
///
/// Rules:
/// - Strictly positive
/// - At most 4 decimal places (trailing zeros ignored)
/// - No larger than the money column maximum
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO
        || amount.normalize().scale() > limits::MAX_AMOUNT_SCALE
        || amount > limits::MAX_AMOUNT
    {
        return Err(BillingError::InvalidAmount(amount));
    }
    Ok(amount)
}

/// Validate a subscription period and narrow it to a unit count.
pub fn validate_period(period: i64) -> Result<u32> {
    u32::try_from(period).map_err(|_| BillingError::InvalidPeriod(period))
}

/// Parse a track name; unknown names are rejected, never defaulted.
pub fn parse_track(track: &str) -> Result<Track> {
    Ok(track.parse::<Track>()?)
}

/// Parse a provider status string into its normalised outcome.
pub fn parse_reported_status(status: &str) -> Result<ReportedStatus> {
    Ok(status.parse::<ReportedStatus>()?)
}

/// Validate a payment ID.
///
/// Rules:
/// - Must not be empty
/// - Maximum 128 characters
/// - Printable ASCII only, no whitespace
pub fn validate_payment_id(payment_id: &str) -> Result<()> {
    let valid = !payment_id.is_empty()
        && payment_id.len() <= limits::MAX_PAYMENT_ID_LENGTH
        && payment_id.chars().all(|c| c.is_ascii_graphic());
    if !valid {
        return Err(BillingError::InvalidPaymentId(payment_id.to_string()));
    }
    Ok(())
}

/// Validate a device name.
///
/// Rules:
/// - Must not be empty or only whitespace
/// - Maximum 64 characters
pub fn validate_device_name(device: &str) -> Result<()> {
    if device.trim().is_empty() || device.len() > limits::MAX_DEVICE_NAME_LENGTH {
        return Err(BillingError::InvalidDeviceName(device.to_string()));
    }
    Ok(())
}
