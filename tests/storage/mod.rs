//! Shared storage integration tests.
//!
//! Tests the LedgerStore contract and the billing properties that depend on
//! it against every SQL backend. Each backend module imports these test
//! functions and runs them.

pub mod ledger_tests;
