//! Shared storage helper functions.
//!
//! Column encoding and decoding shared by the SQL backends. Stored values
//! that fail to decode are reported as [`StorageError::Corrupt`].

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;

use crate::interfaces::{Result, StorageError};
use crate::model::{Origin, PaymentStatus, Track, UserId};
use crate::validation::limits::MAX_AMOUNT;

/// Format a timestamp as fixed-width RFC 3339 so text ordering matches time
/// ordering.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp {value:?}: {e}")))
}

pub fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).map_err(|e| StorageError::Corrupt(format!("decimal {value:?}: {e}")))
}

pub fn parse_track(value: &str) -> Result<Track> {
    value
        .parse()
        .map_err(|e| StorageError::Corrupt(format!("{e}")))
}

pub fn parse_origin(value: &str) -> Result<Origin> {
    value
        .parse()
        .map_err(|e| StorageError::Corrupt(format!("{e}")))
}

pub fn parse_status(value: &str) -> Result<PaymentStatus> {
    value
        .parse()
        .map_err(|e| StorageError::Corrupt(format!("{e}")))
}

/// Narrow a stored unit count (duration or period).
pub fn parse_units(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| StorageError::Corrupt(format!("unit count {value}")))
}

/// Add `delta` to `current`, refusing to go below zero or past the money
/// column maximum.
pub fn checked_balance(user_id: UserId, current: Decimal, delta: Decimal) -> Result<Decimal> {
    let next = current.checked_add(delta).ok_or_else(|| {
        StorageError::Constraint(format!("balance of user {user_id} overflows"))
    })?;
    if next < Decimal::ZERO || next > MAX_AMOUNT {
        return Err(StorageError::Constraint(format!(
            "balance of user {user_id} would become {next}"
        )));
    }
    Ok(next)
}

/// Add `units` to a duration counter without wrapping.
pub fn checked_duration(user_id: UserId, track: Track, current: u32, units: u32) -> Result<u32> {
    current.checked_add(units).ok_or_else(|| {
        StorageError::Constraint(format!("{track} duration of user {user_id} overflows"))
    })
}
