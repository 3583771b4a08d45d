//! Interface tests for the billing contracts using Cucumber.
//!
//! These tests verify that every ledger backend gives the same
//! reconciliation, purchase and referral behaviour.
//! Select a backend via environment variable:
//!
//! ```bash
//! # SQLite (default)
//! cargo test --test interfaces --features test-utils
//!
//! # In-memory store
//! STORAGE_BACKEND=memory cargo test --test interfaces --features test-utils
//!
//! # PostgreSQL (uses testcontainers)
//! STORAGE_BACKEND=postgres cargo test --test interfaces --features test-utils,postgres
//! ```

mod backend;

use cucumber::World;
use steps::payments::PaymentWorld;
use steps::referral::ReferralWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Reconciliation Interface Tests ===\n");
    PaymentWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/interfaces/features/reconciliation.feature")
        .await;

    println!("\n=== Running Balance Purchase Interface Tests ===\n");
    PaymentWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/interfaces/features/balance_purchase.feature")
        .await;

    println!("\n=== Running Referral Interface Tests ===\n");
    ReferralWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/interfaces/features/referral.feature")
        .await;
}
