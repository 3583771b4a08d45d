//! Ledger storage interface.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::model::{PaymentIntent, PaymentStatus, ReferralBonus, Track, User, UserId};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Lock contention, busy database or aborted transaction. Safe to retry.
    #[error("Storage conflict: {0}")]
    Conflict(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Unit of work already finished")]
    Finished,

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// SQLite BUSY/LOCKED families and Postgres serialization, deadlock and
/// lock-timeout codes.
const CONTENTION_CODES: &[&str] = &[
    "5", "6", "261", "262", "517", "773", "40001", "40P01", "55P03",
];

/// SQLite `SQLITE_CONSTRAINT_CHECK`, Postgres `check_violation` and
/// `numeric_value_out_of_range`.
const CHECK_VIOLATION_CODES: &[&str] = &["275", "23514", "22003"];

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let contention = match &err {
            sqlx::Error::PoolTimedOut => Some("connection pool timed out".to_string()),
            sqlx::Error::Database(db) => db
                .code()
                .filter(|code| CONTENTION_CODES.contains(&code.as_ref()))
                .map(|_| db.message().to_string()),
            _ => None,
        };

        if let Some(message) = contention {
            return StorageError::Conflict(message);
        }

        let violation = match &err {
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| CHECK_VIOLATION_CODES.contains(&code.as_ref())) =>
            {
                Some(db.message().to_string())
            }
            _ => None,
        };

        match violation {
            Some(message) => StorageError::Constraint(message),
            None => StorageError::Database(err),
        }
    }
}

/// Interface for ledger persistence.
///
/// Reads on the store observe committed state only. All mutation goes through
/// a [`LedgerTx`] obtained from [`LedgerStore::begin`].
///
/// # Implementations
///
/// - `SqliteLedgerStore`: SQLite storage (`BEGIN IMMEDIATE` write lock)
/// - `PostgresLedgerStore`: PostgreSQL storage (`SELECT ... FOR UPDATE` row locks)
/// - `MockLedgerStore`: In-memory store with failure injection
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a unit of work.
    ///
    /// Waits a bounded time for the underlying lock and fails with
    /// [`StorageError::Conflict`] when it cannot be acquired.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Load a user with its full subscription state.
    async fn get_user(&self, user_id: UserId) -> Result<Option<User>>;

    /// Load a payment intent by its idempotency key.
    async fn get_intent(&self, payment_id: &str) -> Result<Option<PaymentIntent>>;

    /// All intents for a user, newest first.
    async fn list_intents(&self, user_id: UserId) -> Result<Vec<PaymentIntent>>;

    /// All referrals credited to a referrer, oldest first.
    async fn list_referrals(&self, referrer_id: UserId) -> Result<Vec<ReferralBonus>>;

    /// Number of users a referrer has brought in.
    async fn count_referrals(&self, referrer_id: UserId) -> Result<u64> {
        Ok(self.list_referrals(referrer_id).await?.len() as u64)
    }

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// One atomic unit of work against the ledger.
///
/// Every row read through `lock_*` is held exclusively until [`commit`] or
/// [`rollback`]. Dropping an unfinished unit discards its writes.
///
/// [`commit`]: LedgerTx::commit
/// [`rollback`]: LedgerTx::rollback
#[async_trait]
pub trait LedgerTx: Send {
    /// Insert a user with zeroed subscription rows.
    ///
    /// Returns `false` without writing if the ID is already taken.
    async fn insert_user(&mut self, user: &User) -> Result<bool>;

    /// Load and hold a user row with its subscription state.
    async fn lock_user(&mut self, user_id: UserId) -> Result<Option<User>>;

    /// Conditional insert keyed on `payment_id`.
    ///
    /// Returns `false` without writing if the key already exists; never fails
    /// on the uniqueness constraint itself.
    async fn insert_intent(&mut self, intent: &PaymentIntent) -> Result<bool>;

    /// Load and hold a payment intent.
    async fn lock_intent(&mut self, payment_id: &str) -> Result<Option<PaymentIntent>>;

    async fn update_intent_status(
        &mut self,
        payment_id: &str,
        status: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> Result<()>;

    /// Atomic increment of a user's balance. Returns the new balance.
    ///
    /// Fails with [`StorageError::Constraint`] if the result would be negative.
    async fn adjust_balance(&mut self, user_id: UserId, delta: Decimal) -> Result<Decimal>;

    /// Atomic increment of a track's duration. Returns the new duration.
    async fn extend_track(&mut self, user_id: UserId, track: Track, units: u32) -> Result<u32>;

    /// Returns `false` if the device already holds a slot on this track.
    async fn insert_device(&mut self, user_id: UserId, track: Track, device: &str) -> Result<bool>;

    /// Returns `false` if the device held no slot on this track.
    async fn delete_device(&mut self, user_id: UserId, track: Track, device: &str) -> Result<bool>;

    async fn set_combo_type(&mut self, user_id: UserId, combo_type: i32) -> Result<()>;

    /// Conditional insert keyed on the referee. Returns `false` if the
    /// referee already has a record.
    async fn insert_referral(&mut self, referral: &ReferralBonus) -> Result<bool>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
