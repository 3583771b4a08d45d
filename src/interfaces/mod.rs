//! Abstract interfaces for vpn-billing components.
//!
//! These traits define the contract for the persistence collaborator:
//! pool-level reads plus units of work that hold exclusive per-key locks
//! across a check-then-mutate sequence.

pub mod ledger_store;

pub use ledger_store::{LedgerStore, LedgerTx, Result, StorageError};
