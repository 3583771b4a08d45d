//! In-memory ledger store for testing and the `memory` backend.
//!
//! A single async mutex admits one unit of work at a time. Each unit works
//! on a private copy of the committed state and publishes it on commit, so
//! rollback (explicit or by drop) is simply discarding the copy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::interfaces::{LedgerStore, LedgerTx, Result, StorageError};
use crate::model::{PaymentIntent, PaymentStatus, ReferralBonus, Track, User, UserId};
use crate::storage::helpers::{checked_balance, checked_duration};

/// Default bound on waiting for the unit-of-work lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Operation at which an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    InsertIntent,
    UpdateIntentStatus,
    AdjustBalance,
    ExtendTrack,
    InsertReferral,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct LedgerState {
    users: BTreeMap<UserId, User>,
    intents: HashMap<String, PaymentIntent>,
    referrals: BTreeMap<UserId, ReferralBonus>,
}

/// Mock ledger store that keeps all state in memory.
#[derive(Clone)]
pub struct MockLedgerStore {
    committed: Arc<RwLock<LedgerState>>,
    writer: Arc<Mutex<()>>,
    lock_timeout: Duration,
    fail_points: Arc<RwLock<HashSet<FailPoint>>>,
    conflicts_remaining: Arc<AtomicU32>,
    commits: Arc<AtomicU32>,
}

impl Default for MockLedgerStore {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl MockLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            committed: Arc::new(RwLock::new(LedgerState::default())),
            writer: Arc::new(Mutex::new(())),
            lock_timeout,
            fail_points: Arc::new(RwLock::new(HashSet::new())),
            conflicts_remaining: Arc::new(AtomicU32::new(0)),
            commits: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make every call at `point` fail with [`StorageError::Unavailable`].
    pub async fn fail_on(&self, point: FailPoint) {
        self.fail_points.write().await.insert(point);
    }

    pub async fn clear_failures(&self) {
        self.fail_points.write().await.clear();
    }

    /// Make the next `count` calls to `begin` fail with a retryable conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of units committed so far.
    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Insert or replace a user directly, bypassing units of work.
    pub async fn put_user(&self, user: User) {
        self.committed.write().await.users.insert(user.id, user);
    }
}

#[async_trait]
impl LedgerStore for MockLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        if self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Conflict("injected conflict".to_string()));
        }
        fail_at(&self.fail_points, FailPoint::Begin).await?;

        let guard = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.writer).lock_owned())
            .await
            .map_err(|_| StorageError::Conflict("timed out waiting for ledger lock".to_string()))?;
        let staged = self.committed.read().await.clone();

        Ok(Box::new(MockLedgerTx {
            guard: Some(guard),
            staged,
            committed: Arc::clone(&self.committed),
            fail_points: Arc::clone(&self.fail_points),
            commits: Arc::clone(&self.commits),
        }))
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        Ok(self.committed.read().await.users.get(&user_id).cloned())
    }

    async fn get_intent(&self, payment_id: &str) -> Result<Option<PaymentIntent>> {
        Ok(self.committed.read().await.intents.get(payment_id).cloned())
    }

    async fn list_intents(&self, user_id: UserId) -> Result<Vec<PaymentIntent>> {
        let state = self.committed.read().await;
        let mut intents: Vec<_> = state
            .intents
            .values()
            .filter(|intent| intent.user_id == user_id)
            .cloned()
            .collect();
        intents.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.payment_id.cmp(&a.payment_id))
        });
        Ok(intents)
    }

    async fn list_referrals(&self, referrer_id: UserId) -> Result<Vec<ReferralBonus>> {
        let state = self.committed.read().await;
        let mut referrals: Vec<_> = state
            .referrals
            .values()
            .filter(|referral| referral.referrer_id == referrer_id)
            .cloned()
            .collect();
        referrals.sort_by_key(|referral| (referral.created_at, referral.user_id));
        Ok(referrals)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

async fn fail_at(fail_points: &RwLock<HashSet<FailPoint>>, point: FailPoint) -> Result<()> {
    if fail_points.read().await.contains(&point) {
        return Err(StorageError::Unavailable(format!(
            "injected failure at {point:?}"
        )));
    }
    Ok(())
}

/// One unit of work on the mock store.
pub struct MockLedgerTx {
    guard: Option<OwnedMutexGuard<()>>,
    staged: LedgerState,
    committed: Arc<RwLock<LedgerState>>,
    fail_points: Arc<RwLock<HashSet<FailPoint>>>,
    commits: Arc<AtomicU32>,
}

impl MockLedgerTx {
    fn ensure_open(&self) -> Result<()> {
        if self.guard.is_none() {
            return Err(StorageError::Finished);
        }
        Ok(())
    }

    async fn check(&self, point: FailPoint) -> Result<()> {
        self.ensure_open()?;
        fail_at(&self.fail_points, point).await
    }

    fn user_mut(&mut self, user_id: UserId) -> Result<&mut User> {
        self.staged
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StorageError::Constraint(format!("user {user_id} does not exist")))
    }
}

#[async_trait]
impl LedgerTx for MockLedgerTx {
    async fn insert_user(&mut self, user: &User) -> Result<bool> {
        self.ensure_open()?;
        if self.staged.users.contains_key(&user.id) {
            return Ok(false);
        }
        self.staged.users.insert(user.id, user.clone());
        Ok(true)
    }

    async fn lock_user(&mut self, user_id: UserId) -> Result<Option<User>> {
        self.ensure_open()?;
        Ok(self.staged.users.get(&user_id).cloned())
    }

    async fn insert_intent(&mut self, intent: &PaymentIntent) -> Result<bool> {
        self.check(FailPoint::InsertIntent).await?;
        if self.staged.intents.contains_key(&intent.payment_id) {
            return Ok(false);
        }
        self.staged
            .intents
            .insert(intent.payment_id.clone(), intent.clone());
        Ok(true)
    }

    async fn lock_intent(&mut self, payment_id: &str) -> Result<Option<PaymentIntent>> {
        self.ensure_open()?;
        Ok(self.staged.intents.get(payment_id).cloned())
    }

    async fn update_intent_status(
        &mut self,
        payment_id: &str,
        status: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        self.check(FailPoint::UpdateIntentStatus).await?;
        let intent = self
            .staged
            .intents
            .get_mut(payment_id)
            .ok_or_else(|| StorageError::Constraint(format!("intent {payment_id} does not exist")))?;
        intent.status = status;
        intent.failure_reason = failure_reason.map(str::to_string);
        Ok(())
    }

    async fn adjust_balance(&mut self, user_id: UserId, delta: Decimal) -> Result<Decimal> {
        self.check(FailPoint::AdjustBalance).await?;
        let user = self.user_mut(user_id)?;
        user.balance = checked_balance(user_id, user.balance, delta)?;
        Ok(user.balance)
    }

    async fn extend_track(&mut self, user_id: UserId, track: Track, units: u32) -> Result<u32> {
        self.check(FailPoint::ExtendTrack).await?;
        let user = self.user_mut(user_id)?;
        let state = user.subscription.track_mut(track);
        state.duration_units = checked_duration(user_id, track, state.duration_units, units)?;
        Ok(state.duration_units)
    }

    async fn insert_device(&mut self, user_id: UserId, track: Track, device: &str) -> Result<bool> {
        self.ensure_open()?;
        let user = self.user_mut(user_id)?;
        Ok(user
            .subscription
            .track_mut(track)
            .devices
            .insert(device.to_string()))
    }

    async fn delete_device(&mut self, user_id: UserId, track: Track, device: &str) -> Result<bool> {
        self.ensure_open()?;
        let user = self.user_mut(user_id)?;
        Ok(user.subscription.track_mut(track).devices.remove(device))
    }

    async fn set_combo_type(&mut self, user_id: UserId, combo_type: i32) -> Result<()> {
        self.ensure_open()?;
        self.user_mut(user_id)?.subscription.combo_type = combo_type;
        Ok(())
    }

    async fn insert_referral(&mut self, referral: &ReferralBonus) -> Result<bool> {
        self.check(FailPoint::InsertReferral).await?;
        if self.staged.referrals.contains_key(&referral.user_id) {
            return Ok(false);
        }
        self.staged
            .referrals
            .insert(referral.user_id, referral.clone());
        Ok(true)
    }

    async fn commit(&mut self) -> Result<()> {
        self.check(FailPoint::Commit).await?;
        *self.committed.write().await = std::mem::take(&mut self.staged);
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.guard = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.staged = LedgerState::default();
        self.guard = None;
        Ok(())
    }
}
