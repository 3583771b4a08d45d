//! PostgreSQL LedgerStore implementation.
//!
//! Units of work take `SELECT ... FOR UPDATE` row locks on the user and
//! intent rows they touch, so operations on disjoint users run in parallel.
//! Every unit sets `lock_timeout`, turning a long wait into a retryable
//! conflict.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_query::{Expr, LockType, OnConflict, Order, PostgresQueryBuilder, Query};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

use crate::config::PostgresConfig;
use crate::interfaces::{LedgerStore, LedgerTx, Result, StorageError};
use crate::model::{
    PaymentIntent, PaymentStatus, ReferralBonus, SubscriptionState, Track, User, UserId,
};
use crate::storage::helpers::{
    format_timestamp, parse_origin, parse_status, parse_timestamp, parse_track, parse_units,
};
use crate::storage::schema::{
    DeviceSlots, PaymentIntents, Referrals, Subscriptions, Users, CREATE_POSTGRES_TABLES,
};

/// PostgreSQL implementation of LedgerStore.
pub struct PostgresLedgerStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PostgresLedgerStore {
    /// Create a new PostgreSQL ledger store.
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.lock_timeout_ms.max(1_000)))
            .connect(&config.uri)
            .await?;

        Ok(Self::new(pool, config.lock_timeout_ms))
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        for statement in CREATE_POSTGRES_TABLES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters; the value is a plain integer.
        sqlx::query(&format!("SET LOCAL lock_timeout = {}", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PostgresLedgerTx { tx: Some(tx) }))
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let mut conn = self.pool.acquire().await?;
        load_user(&mut conn, user_id, false).await
    }

    async fn get_intent(&self, payment_id: &str) -> Result<Option<PaymentIntent>> {
        let mut conn = self.pool.acquire().await?;
        load_intent(&mut conn, payment_id, false).await
    }

    async fn list_intents(&self, user_id: UserId) -> Result<Vec<PaymentIntent>> {
        let query = intent_select()
            .and_where(Expr::col(PaymentIntents::UserId).eq(user_id.0))
            .order_by(PaymentIntents::CreatedAt, Order::Desc)
            .order_by(PaymentIntents::PaymentId, Order::Desc)
            .to_string(PostgresQueryBuilder);

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
            .to_string(PostgresQueryBuilder);

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
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

/// One unit of work in a PostgreSQL transaction.
///
/// Dropping an unfinished unit rolls the transaction back.
pub struct PostgresLedgerTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresLedgerTx {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(StorageError::Finished)
    }
}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    async fn insert_user(&mut self, user: &User) -> Result<bool> {
        let conn = self.conn()?;

        let inserted = sqlx::query(
            "INSERT INTO users (user_id, balance, combo_type, created_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user.id.0)
        .bind(user.balance)
        .bind(user.subscription.combo_type)
        .bind(format_timestamp(&user.created_at))
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted == 0 {
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
                .to_string(PostgresQueryBuilder);

            sqlx::query(&query).execute(&mut *conn).await?;
        }

        Ok(true)
    }

    async fn lock_user(&mut self, user_id: UserId) -> Result<Option<User>> {
        load_user(self.conn()?, user_id, true).await
    }

    async fn insert_intent(&mut self, intent: &PaymentIntent) -> Result<bool> {
        let conn = self.conn()?;

        let result = sqlx::query(
            "INSERT INTO payment_intents \
             (payment_id, user_id, amount, period, track, origin, status, failure_reason, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT (payment_id) DO NOTHING",
        )
        .bind(&intent.payment_id)
        .bind(intent.user_id.0)
        .bind(intent.amount)
        .bind(i64::from(intent.period))
        .bind(intent.track.as_str())
        .bind(intent.origin.as_str())
        .bind(intent.status.as_str())
        .bind(intent.failure_reason.as_deref())
        .bind(format_timestamp(&intent.created_at))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn lock_intent(&mut self, payment_id: &str) -> Result<Option<PaymentIntent>> {
        load_intent(self.conn()?, payment_id, true).await
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
            .to_string(PostgresQueryBuilder);

        if sqlx::query(&query).execute(&mut *conn).await?.rows_affected() == 0 {
            return Err(StorageError::Constraint(format!(
                "intent {payment_id} does not exist"
            )));
        }
        Ok(())
    }

    async fn adjust_balance(&mut self, user_id: UserId, delta: Decimal) -> Result<Decimal> {
        let conn = self.conn()?;

        // The CHECK (balance >= 0) constraint rejects an overdraft.
        let row = sqlx::query(
            "UPDATE users SET balance = balance + $1 WHERE user_id = $2 RETURNING balance",
        )
        .bind(delta)
        .bind(user_id.0)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StorageError::Constraint(format!("user {user_id} does not exist")))?;

        Ok(row.try_get("balance")?)
    }

    async fn extend_track(&mut self, user_id: UserId, track: Track, units: u32) -> Result<u32> {
        let conn = self.conn()?;

        let row = sqlx::query(
            "INSERT INTO subscriptions (user_id, track, duration_units) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, track) \
             DO UPDATE SET duration_units = subscriptions.duration_units + EXCLUDED.duration_units \
             RETURNING duration_units",
        )
        .bind(user_id.0)
        .bind(track.as_str())
        .bind(i64::from(units))
        .fetch_one(&mut *conn)
        .await?;

        let duration = parse_units(row.try_get("duration_units")?).map_err(|_| {
            StorageError::Constraint(format!("{track} duration of user {user_id} overflows"))
        })?;
        Ok(duration)
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
            .to_string(PostgresQueryBuilder);

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
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_combo_type(&mut self, user_id: UserId, combo_type: i32) -> Result<()> {
        let conn = self.conn()?;

        let query = Query::update()
            .table(Users::Table)
            .value(Users::ComboType, combo_type)
            .and_where(Expr::col(Users::UserId).eq(user_id.0))
            .to_string(PostgresQueryBuilder);

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
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(StorageError::Finished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(StorageError::Finished)?;
        tx.rollback().await?;
        Ok(())
    }
}

async fn load_user(
    conn: &mut PgConnection,
    user_id: UserId,
    for_update: bool,
) -> Result<Option<User>> {
    let mut select = Query::select();
    select
        .columns([Users::Balance, Users::ComboType, Users::CreatedAt])
        .from(Users::Table)
        .and_where(Expr::col(Users::UserId).eq(user_id.0));
    if for_update {
        select.lock(LockType::Update);
    }
    let query = select.to_string(PostgresQueryBuilder);

    let Some(row) = sqlx::query(&query).fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };

    let balance: Decimal = row.try_get("balance")?;
    let created_at: String = row.try_get("created_at")?;
    let mut subscription = SubscriptionState {
        combo_type: row.try_get("combo_type")?,
        ..SubscriptionState::default()
    };

    let query = Query::select()
        .columns([Subscriptions::Track, Subscriptions::DurationUnits])
        .from(Subscriptions::Table)
        .and_where(Expr::col(Subscriptions::UserId).eq(user_id.0))
        .to_string(PostgresQueryBuilder);

    for row in sqlx::query(&query).fetch_all(&mut *conn).await? {
        let track: String = row.try_get("track")?;
        subscription.track_mut(parse_track(&track)?).duration_units =
            parse_units(row.try_get("duration_units")?)?;
    }

    let query = Query::select()
        .columns([DeviceSlots::Track, DeviceSlots::Device])
        .from(DeviceSlots::Table)
        .and_where(Expr::col(DeviceSlots::UserId).eq(user_id.0))
        .to_string(PostgresQueryBuilder);

    for row in sqlx::query(&query).fetch_all(&mut *conn).await? {
        let track: String = row.try_get("track")?;
        subscription
            .track_mut(parse_track(&track)?)
            .devices
            .insert(row.try_get("device")?);
    }

    Ok(Some(User {
        id: user_id,
        balance,
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
    conn: &mut PgConnection,
    payment_id: &str,
    for_update: bool,
) -> Result<Option<PaymentIntent>> {
    let mut select = intent_select();
    select.and_where(Expr::col(PaymentIntents::PaymentId).eq(payment_id));
    if for_update {
        select.lock(LockType::Update);
    }
    let query = select.to_string(PostgresQueryBuilder);

    sqlx::query(&query)
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(decode_intent)
        .transpose()
}

fn decode_intent(row: &PgRow) -> Result<PaymentIntent> {
    let track: String = row.try_get("track")?;
    let origin: String = row.try_get("origin")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(PaymentIntent {
        payment_id: row.try_get("payment_id")?,
        user_id: UserId(row.try_get("user_id")?),
        amount: row.try_get("amount")?,
        period: parse_units(row.try_get("period")?)?,
        track: parse_track(&track)?,
        origin: parse_origin(&origin)?,
        status: parse_status(&status)?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: parse_timestamp(&created_at)?,
    })
}
