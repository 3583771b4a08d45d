//! SQLite LedgerStore implementation.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::warn;

use crate::config::SqliteConfig;
use crate::interfaces::{LedgerStore, LedgerTx, Result, StorageError};
use crate::model::{
    PaymentIntent, PaymentStatus, ReferralBonus, SubscriptionState, Track, User, UserId,
};
use crate::storage::helpers::{
    checked_balance, checked_duration, format_timestamp, parse_decimal, parse_origin,
    parse_status, parse_timestamp, parse_track, parse_units,
};
use crate::storage::schema::{
    DeviceSlots, PaymentIntents, Referrals, Subscriptions, Users, CREATE_SQLITE_TABLES,
};

/// SQLite implementation of LedgerStore.
///
/// Every unit of work runs under `BEGIN IMMEDIATE`, so units are serialized
/// by the database write lock and `lock_*` reads need no row locking.
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Create a new SQLite ledger store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file described by `config`.
    pub async fn connect(config: &SqliteConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.busy_timeout_ms))
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_SQLITE_TABLES).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let mut conn = self.pool.acquire().await?;
        // BEGIN IMMEDIATE acquires the write lock upfront, preventing deadlocks
        // when concurrent DEFERRED transactions race to upgrade from shared to exclusive.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Box::new(SqliteLedgerTx { conn: Some(conn) }))
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let mut conn = self.pool.acquire().await?;
        load_user(&mut conn, user_id).await
    }

    async fn get_intent(&self, payment_id: &str) -> Result<Option<PaymentIntent>> {
        let mut conn = self.pool.acquire().await?;
        load_intent(&mut conn, payment_id).await
    }

    async fn list_intents(&self, user_id: UserId) -> Result<Vec<PaymentIntent>> {
        let query = intent_select()
            .and_where(Expr::col(PaymentIntents::UserId).eq(user_id.0))
            .order_by(PaymentIntents::CreatedAt, Order::Desc)
            .order_by(PaymentIntents::PaymentId, Order::Desc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(decode_intent).collect()
    }

    async fn list_referrals(&self, referrer_id: UserId) -> Result<Vec<ReferralBonus>> {
        let query = Query::select()
            .columns([Referrals::UserId, Referrals::ReferrerId, Referrals::CreatedAt])
            .from(Referrals::Table)
            .and_where(Expr::col(Referrals::ReferrerId).eq(referrer_id.0))
            .order_by(Referrals::CreatedAt, Order::Asc)
            .order_by(Referrals::UserId, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut referrals = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.try_get("created_at")?;
            referrals.push(ReferralBonus {
                user_id: UserId(row.try_get("user_id")?),
                referrer_id: UserId(row.try_get("referrer_id")?),
                created_at: parse_timestamp(&created_at)?,
            });
        }

        Ok(referrals)
    }

    async fn count_referrals(&self, referrer_id: UserId) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(Referrals::UserId).count())
            .from(Referrals::Table)
            .and_where(Expr::col(Referrals::ReferrerId).eq(referrer_id.0))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

/// One `BEGIN IMMEDIATE` unit of work on a pooled connection.
pub struct SqliteLedgerTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteLedgerTx {
    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn.as_deref_mut().ok_or(StorageError::Finished)
    }
}

impl Drop for SqliteLedgerTx {
    fn drop(&mut self) {
        // Closing the connection discards the open transaction; returning it
        // to the pool would leak the write lock.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// Roll back after a failed COMMIT, or close the connection if even that fails.
async fn discard(mut conn: PoolConnection<Sqlite>) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        warn!(error = %e, "Rollback failed, closing connection");
        drop(conn.detach());
    }
}

#[async_trait]
impl LedgerTx for SqliteLedgerTx {
    async fn insert_user(&mut self, user: &User) -> Result<bool> {
        let conn = self.conn()?;

        let query = Query::insert()
            .into_table(Users::Table)
            .columns([
                Users::UserId,
                Users::Balance,
                Users::ComboType,
                Users::CreatedAt,
            ])
            .values_panic([
                user.id.0.into(),
                user.balance.to_string().into(),
                user.subscription.combo_type.into(),
                format_timestamp(&user.created_at).into(),
            ])
            .on_conflict(OnConflict::column(Users::UserId).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&query).execute(&mut *conn).await?.rows_affected() == 0 {
            return Ok(false);
        }

        for track in Track::ALL {
            let query = Query::insert()
                .into_table(Subscriptions::Table)
                .columns([
                    Subscriptions::UserId,
                    Subscriptions::Track,
                    Subscriptions::DurationUnits,
                ])
                .values_panic([
                    user.id.0.into(),
                    track.as_str().into(),
                    user.subscription.track(track).duration_units.into(),
                ])
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query).execute(&mut *conn).await?;
        }

        Ok(true)
    }

    async fn lock_user(&mut self, user_id: UserId) -> Result<Option<User>> {
        load_user(self.conn()?, user_id).await
    }

    async fn insert_intent(&mut self, intent: &PaymentIntent) -> Result<bool> {
        let conn = self.conn()?;

        let query = Query::insert()
            .into_table(PaymentIntents::Table)
            .columns([
                PaymentIntents::PaymentId,
                PaymentIntents::UserId,
                PaymentIntents::Amount,
                PaymentIntents::Period,
                PaymentIntents::Track,
                PaymentIntents::Origin,
                PaymentIntents::Status,
                PaymentIntents::FailureReason,
                PaymentIntents::CreatedAt,
            ])
            .values_panic([
                intent.payment_id.as_str().into(),
                intent.user_id.0.into(),
                intent.amount.to_string().into(),
                intent.period.into(),
                intent.track.as_str().into(),
                intent.origin.as_str().into(),
                intent.status.as_str().into(),
                intent.failure_reason.clone().into(),
                format_timestamp(&intent.created_at).into(),
            ])
            .on_conflict(
                OnConflict::column(PaymentIntents::PaymentId)
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn lock_intent(&mut self, payment_id: &str) -> Result<Option<PaymentIntent>> {
        load_intent(self.conn()?, payment_id).await
    }

    async fn update_intent_status(
        &mut self,
        payment_id: &str,
        status: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;

        let query = Query::update()
            .table(PaymentIntents::Table)
            .values([
                (PaymentIntents::Status, status.as_str().into()),
                (
                    PaymentIntents::FailureReason,
                    failure_reason.map(str::to_string).into(),
                ),
            ])
            .and_where(Expr::col(PaymentIntents::PaymentId).eq(payment_id))
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&query).execute(&mut *conn).await?.rows_affected() == 0 {
            return Err(StorageError::Constraint(format!(
                "intent {payment_id} does not exist"
            )));
        }
        Ok(())
    }

    async fn adjust_balance(&mut self, user_id: UserId, delta: Decimal) -> Result<Decimal> {
        let conn = self.conn()?;

        let query = Query::select()
            .column(Users::Balance)
            .from(Users::Table)
            .and_where(Expr::col(Users::UserId).eq(user_id.0))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StorageError::Constraint(format!("user {user_id} does not exist")))?;
        let current: String = row.try_get("balance")?;
        let next = checked_balance(user_id, parse_decimal(&current)?, delta)?;

        let query = Query::update()
            .table(Users::Table)
            .value(Users::Balance, next.to_string())
            .and_where(Expr::col(Users::UserId).eq(user_id.0))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(next)
    }

    async fn extend_track(&mut self, user_id: UserId, track: Track, units: u32) -> Result<u32> {
        let conn = self.conn()?;

        let query = Query::select()
            .column(Subscriptions::DurationUnits)
            .from(Subscriptions::Table)
            .and_where(Expr::col(Subscriptions::UserId).eq(user_id.0))
            .and_where(Expr::col(Subscriptions::Track).eq(track.as_str()))
            .to_string(SqliteQueryBuilder);

        let current = match sqlx::query(&query).fetch_optional(&mut *conn).await? {
            Some(row) => parse_units(row.try_get("duration_units")?)?,
            None => 0,
        };
        let next = checked_duration(user_id, track, current, units)?;

        let query = Query::insert()
            .into_table(Subscriptions::Table)
            .columns([
                Subscriptions::UserId,
                Subscriptions::Track,
                Subscriptions::DurationUnits,
            ])
            .values_panic([user_id.0.into(), track.as_str().into(), next.into()])
            .on_conflict(
                OnConflict::columns([Subscriptions::UserId, Subscriptions::Track])
                    .update_column(Subscriptions::DurationUnits)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(next)
    }

    async fn insert_device(&mut self, user_id: UserId, track: Track, device: &str) -> Result<bool> {
        let conn = self.conn()?;

        let query = Query::insert()
            .into_table(DeviceSlots::Table)
            .columns([DeviceSlots::UserId, DeviceSlots::Track, DeviceSlots::Device])
            .values_panic([user_id.0.into(), track.as_str().into(), device.into()])
            .on_conflict(
                OnConflict::columns([DeviceSlots::UserId, DeviceSlots::Track, DeviceSlots::Device])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_device(&mut self, user_id: UserId, track: Track, device: &str) -> Result<bool> {
        let conn = self.conn()?;

        let query = Query::delete()
            .from_table(DeviceSlots::Table)
            .and_where(Expr::col(DeviceSlots::UserId).eq(user_id.0))
            .and_where(Expr::col(DeviceSlots::Track).eq(track.as_str()))
            .and_where(Expr::col(DeviceSlots::Device).eq(device))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_combo_type(&mut self, user_id: UserId, combo_type: i32) -> Result<()> {
        let conn = self.conn()?;

        let query = Query::update()
            .table(Users::Table)
            .value(Users::ComboType, combo_type)
            .and_where(Expr::col(Users::UserId).eq(user_id.0))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(())
    }

    async fn insert_referral(&mut self, referral: &ReferralBonus) -> Result<bool> {
        let conn = self.conn()?;

        let query = Query::insert()
            .into_table(Referrals::Table)
            .columns([Referrals::UserId, Referrals::ReferrerId, Referrals::CreatedAt])
            .values_panic([
                referral.user_id.0.into(),
                referral.referrer_id.0.into(),
                format_timestamp(&referral.created_at).into(),
            ])
            .on_conflict(OnConflict::column(Referrals::UserId).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(&mut self) -> Result<()> {
        let mut conn = self.conn.take().ok_or(StorageError::Finished)?;
        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            discard(conn).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut conn = self.conn.take().ok_or(StorageError::Finished)?;
        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            drop(conn.detach());
            return Err(e.into());
        }
        Ok(())
    }
}

async fn load_user(conn: &mut SqliteConnection, user_id: UserId) -> Result<Option<User>> {
    let query = Query::select()
        .columns([Users::Balance, Users::ComboType, Users::CreatedAt])
        .from(Users::Table)
        .and_where(Expr::col(Users::UserId).eq(user_id.0))
        .to_string(SqliteQueryBuilder);

    let Some(row) = sqlx::query(&query).fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };

    let balance: String = row.try_get("balance")?;
    let created_at: String = row.try_get("created_at")?;
    let mut subscription = SubscriptionState {
        combo_type: row.try_get("combo_type")?,
        ..SubscriptionState::default()
    };

    let query = Query::select()
        .columns([Subscriptions::Track, Subscriptions::DurationUnits])
        .from(Subscriptions::Table)
        .and_where(Expr::col(Subscriptions::UserId).eq(user_id.0))
        .to_string(SqliteQueryBuilder);

    for row in sqlx::query(&query).fetch_all(&mut *conn).await? {
        let track: String = row.try_get("track")?;
        subscription.track_mut(parse_track(&track)?).duration_units =
            parse_units(row.try_get("duration_units")?)?;
    }

    let query = Query::select()
        .columns([DeviceSlots::Track, DeviceSlots::Device])
        .from(DeviceSlots::Table)
        .and_where(Expr::col(DeviceSlots::UserId).eq(user_id.0))
        .to_string(SqliteQueryBuilder);

    for row in sqlx::query(&query).fetch_all(&mut *conn).await? {
        let track: String = row.try_get("track")?;
        subscription
            .track_mut(parse_track(&track)?)
            .devices
            .insert(row.try_get("device")?);
    }

    Ok(Some(User {
        id: user_id,
        balance: parse_decimal(&balance)?,
        subscription,
        created_at: parse_timestamp(&created_at)?,
    }))
}

fn intent_select() -> sea_query::SelectStatement {
    Query::select()
        .columns([
            PaymentIntents::PaymentId,
            PaymentIntents::UserId,
            PaymentIntents::Amount,
            PaymentIntents::Period,
            PaymentIntents::Track,
            PaymentIntents::Origin,
            PaymentIntents::Status,
            PaymentIntents::FailureReason,
            PaymentIntents::CreatedAt,
        ])
        .from(PaymentIntents::Table)
        .to_owned()
}

async fn load_intent(
    conn: &mut SqliteConnection,
    payment_id: &str,
) -> Result<Option<PaymentIntent>> {
    let query = intent_select()
        .and_where(Expr::col(PaymentIntents::PaymentId).eq(payment_id))
        .to_string(SqliteQueryBuilder);

    sqlx::query(&query)
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(decode_intent)
        .transpose()
}

fn decode_intent(row: &SqliteRow) -> Result<PaymentIntent> {
    let amount: String = row.try_get("amount")?;
    let track: String = row.try_get("track")?;
    let origin: String = row.try_get("origin")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(PaymentIntent {
        payment_id: row.try_get("payment_id")?,
        user_id: UserId(row.try_get("user_id")?),
        amount: parse_decimal(&amount)?,
        period: parse_units(row.try_get("period")?)?,
        track: parse_track(&track)?,
        origin: parse_origin(&origin)?,
        status: parse_status(&status)?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: parse_timestamp(&created_at)?,
    })
}
