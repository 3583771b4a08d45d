//! Storage implementations.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::interfaces::{LedgerStore, Result, StorageError};

pub mod helpers;
pub mod mock;
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use mock::{FailPoint, MockLedgerStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedgerStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresLedgerStore;

/// Initialize storage based on configuration.
///
/// SQL backends create their schema if it does not exist yet.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn LedgerStore>> {
    match config.storage_type {
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            info!(path = %config.sqlite.path, "Storage: sqlite");

            if let Some(parent) = std::path::Path::new(&config.sqlite.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::Unavailable(format!("cannot create {}: {e}", parent.display()))
                    })?;
                }
            }

            let store = SqliteLedgerStore::connect(&config.sqlite).await?;
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err(StorageError::Unavailable("sqlite feature not enabled".to_string()))
        }
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            info!("Storage: postgres");

            let store = PostgresLedgerStore::connect(&config.postgres).await?;
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageType::Postgres => {
            tracing::error!("PostgreSQL storage requested but 'postgres' feature is not enabled");
            Err(StorageError::Unavailable("postgres feature not enabled".to_string()))
        }
        StorageType::Memory => {
            info!("Storage: memory (state is lost on exit)");

            let store = match config.memory_lock_timeout_ms {
                Some(ms) => MockLedgerStore::with_lock_timeout(Duration::from_millis(ms)),
                None => MockLedgerStore::new(),
            };
            Ok(Arc::new(store))
        }
    }
}
