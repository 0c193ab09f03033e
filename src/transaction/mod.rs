//! Transactions over directory locks.
//!
//! A transaction is a record in the object store plus the lock markers
//! it holds. Every structural mutation of the virtual filesystem runs
//! inside one.
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `INIT` | record created, nothing locked |
//! | `ACQUIRE` | taking locks |
//! | `EXEC` | locks held, mutation in progress |
//! | `COMMIT` / `FAIL` | outcome decided, locks still held |
//! | `RELEASING` | removing lock markers |
//! | `RELEASED` | terminal; the record is deleted |
//!
//! Transactions stuck in `ACQUIRE` or `EXEC` past the configured
//! timeout are rolled back by a background sweep.

pub mod manager;
pub mod record;
pub mod store;

pub use manager::{init_info, TransactionManager};
pub use record::{TransactionRecord, TransactionStatus};
pub use store::{TransactionStore, TRANSACTIONS_DIR};
