//! Backend factory for interface tests.
//!
//! Provides a billing service on a fresh ledger for each scenario, backed by
//! the store selected through the environment.

use std::env;
use std::sync::Arc;

use vpn_billing::config::{Config, SqliteConfig};
use vpn_billing::interfaces::LedgerStore;
use vpn_billing::storage::{MockLedgerStore, SqliteLedgerStore};
use vpn_billing::BillingService;

#[cfg(feature = "postgres")]
use std::time::Duration;
#[cfg(feature = "postgres")]
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
#[cfg(feature = "postgres")]
use vpn_billing::config::PostgresConfig;
#[cfg(feature = "postgres")]
use vpn_billing::storage::PostgresLedgerStore;

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Sqlite,
    Postgres,
}

impl StorageBackend {
    pub fn from_env() -> Self {
        match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "sqlite".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StorageBackend::Memory,
            "postgres" => StorageBackend::Postgres,
            _ => StorageBackend::Sqlite,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Sqlite => "sqlite",
            StorageBackend::Postgres => "postgres",
        }
    }
}

/// Resources that must outlive the store.
#[allow(dead_code)]
#[derive(Debug)]
enum Resources {
    None,
    TempDir(tempfile::TempDir),
    #[cfg(feature = "postgres")]
    Postgres(testcontainers::ContainerAsync<GenericImage>),
}

/// A billing service and direct access to the ledger it runs on.
pub struct LedgerContext {
    pub service: BillingService,
    pub store: Arc<dyn LedgerStore>,
    #[allow(dead_code)]
    resources: Resources,
}

impl std::fmt::Debug for LedgerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerContext")
            .field("backend", &self.store.name())
            .field("resources", &self.resources)
            .finish()
    }
}

impl LedgerContext {
    /// Create an empty ledger on the configured backend.
    pub async fn new(backend: StorageBackend) -> Self {
        match backend {
            StorageBackend::Memory => Self::create_memory(),
            StorageBackend::Sqlite => Self::create_sqlite().await,
            StorageBackend::Postgres => Self::create_postgres().await,
        }
    }

    fn build(store: Arc<dyn LedgerStore>, resources: Resources) -> Self {
        let service = BillingService::new(Arc::clone(&store), &Config::for_test());
        Self {
            service,
            store,
            resources,
        }
    }

    fn create_memory() -> Self {
        Self::build(Arc::new(MockLedgerStore::new()), Resources::None)
    }

    async fn create_sqlite() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = SqliteConfig {
            path: dir.path().join("billing.db").display().to_string(),
            ..SqliteConfig::default()
        };

        let store = SqliteLedgerStore::connect(&config)
            .await
            .expect("Failed to open SQLite ledger");
        store.init().await.expect("Failed to create schema");

        Self::build(Arc::new(store), Resources::TempDir(dir))
    }

    #[cfg(feature = "postgres")]
    async fn create_postgres() -> Self {
        let image = GenericImage::new("postgres", "16")
            .with_exposed_port(5432.tcp())
            .with_wait_for(WaitFor::message_on_stdout(
                "database system is ready to accept connections",
            ));

        let container = image
            .with_env_var("POSTGRES_USER", "testuser")
            .with_env_var("POSTGRES_PASSWORD", "testpass")
            .with_env_var("POSTGRES_DB", "testdb")
            .with_startup_timeout(Duration::from_secs(60))
            .start()
            .await
            .expect("Failed to start Postgres container");

        // Brief delay for full readiness
        tokio::time::sleep(Duration::from_secs(2)).await;

        let host_port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");
        let host = container.get_host().await.expect("Failed to get host");

        let config = PostgresConfig {
            uri: format!("postgres://testuser:testpass@{}:{}/testdb", host, host_port),
            ..PostgresConfig::default()
        };
        let store = PostgresLedgerStore::connect(&config)
            .await
            .expect("Failed to connect to PostgreSQL");
        store.init().await.expect("Failed to create schema");

        Self::build(Arc::new(store), Resources::Postgres(container))
    }

    #[cfg(not(feature = "postgres"))]
    async fn create_postgres() -> Self {
        panic!("PostgreSQL feature not enabled. Build with --features postgres");
    }
}
