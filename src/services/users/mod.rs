//! User registry.

use std::sync::Arc;

use tracing::info;

use super::{finish, BillingError, Result};
use crate::interfaces::LedgerStore;
use crate::model::{User, UserId};
use crate::utils::retry::{with_retry, RetryConfig};

/// Registers users and reads their ledger state.
#[derive(Clone)]
pub struct UserRegistry {
    store: Arc<dyn LedgerStore>,
    retry: RetryConfig,
}

impl UserRegistry {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Create a user with zero balance and zeroed subscription tracks.
    #[tracing::instrument(name = "users.register", skip_all, fields(%user_id))]
    pub async fn register(&self, user_id: UserId) -> Result<User> {
        let user = User::new(user_id);
        let user = &user;

        with_retry(&self.retry, "users.register", move || async move {
            let mut tx = self.store.begin().await?;
            let result = match tx.insert_user(user).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(BillingError::UserAlreadyExists(user_id)),
                Err(err) => Err(err.into()),
            };
            finish(tx, result).await
        })
        .await?;

        info!("User registered");
        Ok(user.clone())
    }

    pub async fn get(&self, user_id: UserId) -> Result<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))
    }
}
