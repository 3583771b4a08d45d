//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building,
//! plus the DDL each SQL backend runs on startup.

use sea_query::Iden;

/// Users table schema.
#[derive(Iden)]
pub enum Users {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "balance"]
    Balance,
    #[iden = "combo_type"]
    ComboType,
    #[iden = "created_at"]
    CreatedAt,
}

/// Per-track duration counters, one row per (user, track).
#[derive(Iden)]
pub enum Subscriptions {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "track"]
    Track,
    #[iden = "duration_units"]
    DurationUnits,
}

/// Device slots assigned on a track.
#[derive(Iden)]
pub enum DeviceSlots {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "track"]
    Track,
    #[iden = "device"]
    Device,
}

/// Payment intents table schema.
#[derive(Iden)]
pub enum PaymentIntents {
    Table,
    #[iden = "payment_id"]
    PaymentId,
    #[iden = "user_id"]
    UserId,
    #[iden = "amount"]
    Amount,
    #[iden = "period"]
    Period,
    #[iden = "track"]
    Track,
    #[iden = "origin"]
    Origin,
    #[iden = "status"]
    Status,
    #[iden = "failure_reason"]
    FailureReason,
    #[iden = "created_at"]
    CreatedAt,
}

/// Referrals table schema.
#[derive(Iden)]
pub enum Referrals {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "referrer_id"]
    ReferrerId,
    #[iden = "created_at"]
    CreatedAt,
}

/// SQL for creating the SQLite ledger tables.
///
/// Money is canonical decimal TEXT; timestamps are RFC 3339 TEXT in UTC.
pub const CREATE_SQLITE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    balance TEXT NOT NULL,
    combo_type INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    user_id INTEGER NOT NULL REFERENCES users(user_id),
    track TEXT NOT NULL,
    duration_units INTEGER NOT NULL DEFAULT 0 CHECK (duration_units >= 0),
    PRIMARY KEY (user_id, track)
);

CREATE TABLE IF NOT EXISTS device_slots (
    user_id INTEGER NOT NULL REFERENCES users(user_id),
    track TEXT NOT NULL,
    device TEXT NOT NULL,
    PRIMARY KEY (user_id, track, device)
);

CREATE TABLE IF NOT EXISTS payment_intents (
    payment_id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    amount TEXT NOT NULL,
    period INTEGER NOT NULL CHECK (period >= 0),
    track TEXT NOT NULL,
    origin TEXT NOT NULL,
    status TEXT NOT NULL,
    failure_reason TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_payment_intents_user ON payment_intents(user_id, created_at);

CREATE TABLE IF NOT EXISTS referrals (
    user_id INTEGER PRIMARY KEY REFERENCES users(user_id),
    referrer_id INTEGER NOT NULL REFERENCES users(user_id),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referrals(referrer_id);
"#;

/// SQL for creating the PostgreSQL ledger tables, one statement per entry.
#[cfg(feature = "postgres")]
pub const CREATE_POSTGRES_TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
    user_id BIGINT PRIMARY KEY,
    balance NUMERIC(20, 4) NOT NULL CHECK (balance >= 0),
    combo_type INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
)"#,
    r#"CREATE TABLE IF NOT EXISTS subscriptions (
    user_id BIGINT NOT NULL REFERENCES users(user_id),
    track TEXT NOT NULL,
    duration_units BIGINT NOT NULL DEFAULT 0 CHECK (duration_units >= 0),
    PRIMARY KEY (user_id, track)
)"#,
    r#"CREATE TABLE IF NOT EXISTS device_slots (
    user_id BIGINT NOT NULL REFERENCES users(user_id),
    track TEXT NOT NULL,
    device TEXT NOT NULL,
    PRIMARY KEY (user_id, track, device)
)"#,
    r#"CREATE TABLE IF NOT EXISTS payment_intents (
    payment_id TEXT PRIMARY KEY,
    user_id BIGINT NOT NULL,
    amount NUMERIC(20, 4) NOT NULL CHECK (amount > 0),
    period BIGINT NOT NULL CHECK (period >= 0),
    track TEXT NOT NULL,
    origin TEXT NOT NULL,
    status TEXT NOT NULL,
    failure_reason TEXT,
    created_at TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_payment_intents_user ON payment_intents(user_id, created_at)",
    r#"CREATE TABLE IF NOT EXISTS referrals (
    user_id BIGINT PRIMARY KEY REFERENCES users(user_id),
    referrer_id BIGINT NOT NULL REFERENCES users(user_id),
    created_at TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referrals(referrer_id)",
];
