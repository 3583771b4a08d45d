//! Billing error taxonomy.

use rust_decimal::Decimal;

use crate::interfaces::StorageError;
use crate::model::{ParseError, ParseTarget, Track, UserId};

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Closed classification of [`BillingError`] for callers that branch on the
/// kind of failure (HTTP status mapping, webhook acknowledgement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidAmount,
    InvalidPeriod,
    InvalidTrack,
    InvalidInput,
    InsufficientBalance,
    /// A client idempotency key names a payment that is not this purchase.
    IdempotencyKeyConflict,
    AlreadyReferred,
    SelfReferral,
    NoActiveSubscription,
    SlotConflict,
    /// Lock contention or aborted transaction; safe to retry.
    StorageConflict,
    Internal,
}

/// Errors returned by billing operations.
///
/// Every variant except `StorageConflict` and `Storage` is raised before any
/// mutation is committed.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Referrer not found: {0}")]
    ReferrerNotFound(UserId),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("User already exists: {0}")]
    UserAlreadyExists(UserId),

    #[error("Invalid amount: {0} (must be positive with at most 4 decimal places and 16 integer digits)")]
    InvalidAmount(Decimal),

    #[error("Invalid period: {0} (must be a non-negative unit count)")]
    InvalidPeriod(i64),

    #[error("Invalid track: {0}")]
    InvalidTrack(String),

    #[error("Invalid payment status: {0}")]
    InvalidStatus(String),

    #[error("Invalid payment origin: {0}")]
    InvalidOrigin(String),

    #[error("Invalid payment id: {0}")]
    InvalidPaymentId(String),

    #[error("Invalid device name: {0}")]
    InvalidDeviceName(String),

    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Decimal, required: Decimal },

    #[error("Idempotency key {0} is already used by a different payment")]
    IdempotencyKeyConflict(String),

    #[error("User {0} has already been referred")]
    AlreadyReferred(UserId),

    #[error("User {0} cannot refer themselves")]
    SelfReferral(UserId),

    #[error("No active {track} subscription for user {user_id}")]
    NoActiveSubscription { user_id: UserId, track: Track },

    #[error("Device {device} already holds a {track} slot for user {user_id}")]
    SlotAlreadyAssigned {
        user_id: UserId,
        track: Track,
        device: String,
    },

    #[error("Device {device} holds no {track} slot for user {user_id}")]
    SlotNotAssigned {
        user_id: UserId,
        track: Track,
        device: String,
    },

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::UserNotFound(_)
            | BillingError::ReferrerNotFound(_)
            | BillingError::PaymentNotFound(_) => ErrorKind::NotFound,
            BillingError::UserAlreadyExists(_) => ErrorKind::AlreadyExists,
            BillingError::InvalidAmount(_) => ErrorKind::InvalidAmount,
            BillingError::InvalidPeriod(_) => ErrorKind::InvalidPeriod,
            BillingError::InvalidTrack(_) => ErrorKind::InvalidTrack,
            BillingError::InvalidStatus(_)
            | BillingError::InvalidOrigin(_)
            | BillingError::InvalidPaymentId(_)
            | BillingError::InvalidDeviceName(_) => ErrorKind::InvalidInput,
            BillingError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            BillingError::IdempotencyKeyConflict(_) => ErrorKind::IdempotencyKeyConflict,
            BillingError::AlreadyReferred(_) => ErrorKind::AlreadyReferred,
            BillingError::SelfReferral(_) => ErrorKind::SelfReferral,
            BillingError::NoActiveSubscription { .. } => ErrorKind::NoActiveSubscription,
            BillingError::SlotAlreadyAssigned { .. } | BillingError::SlotNotAssigned { .. } => {
                ErrorKind::SlotConflict
            }
            BillingError::StorageConflict(_) => ErrorKind::StorageConflict,
            BillingError::Storage(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<StorageError> for BillingError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(message) => BillingError::StorageConflict(message),
            other => BillingError::Storage(other),
        }
    }
}

impl From<ParseError> for BillingError {
    fn from(err: ParseError) -> Self {
        match err.target {
            ParseTarget::Track => BillingError::InvalidTrack(err.value),
            ParseTarget::Origin => BillingError::InvalidOrigin(err.value),
            ParseTarget::PaymentStatus | ParseTarget::ReportedStatus => {
                BillingError::InvalidStatus(err.value)
            }
        }
    }
}
