//! vpn-billing-migrate: schema bootstrap
//!
//! Loads configuration, opens the configured ledger backend and creates its
//! tables if they do not exist. Safe to run on every deploy.
//!
//! ## Configuration
//! - VPN_BILLING_CONFIG: Path to a YAML config file (optional)
//! - VPN_BILLING__STORAGE__TYPE: sqlite | postgres | memory
//! - VPN_BILLING_LOG: Log filter (default: info)

use tracing::info;

use vpn_billing::config::Config;
use vpn_billing::storage::init_storage;
use vpn_billing::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let store = init_storage(&config.storage).await?;

    info!(backend = store.name(), "Ledger schema ready");
    Ok(())
}
