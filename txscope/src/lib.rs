#![forbid(unsafe_code)]
//! Facade crate re-exporting core types and macros for the `txscope` library.
//!
//! This crate provides the main public API. It re-exports the connection
//! contract, the stateful transaction, the transaction managers and the
//! `#[transactional]` macro so that you only need to add this single crate as a
//! dependency in your application. Backend connection providers are re-exported
//! under [`backends`] when their feature is enabled.
//!
//! # Example: demarcating a unit of work
//!
//! ```ignore
//! // Non-runnable snippet: it needs a real connection provider.
//! use std::sync::Arc;
//! use txscope::transactions::{ThreadLocalTransactionManager, TransactionManager, TransactionManagerExt};
//!
//! let manager = ThreadLocalTransactionManager::new(Arc::new(provider));
//! let tx = manager.open_transaction()?;
//! manager.execute_in_context(tx, || {
//!     // Every caller on this thread now sees the same transaction.
//!     let tx = manager.get_transaction()?;
//!     tx.execute("UPDATE accounts SET balance = balance - 10 WHERE id = 1", |stmt| stmt.execute(&[]))?;
//!     Ok::<_, txscope::TxError>(())
//! })?;
//! ```
//!
//! # Example: `#[transactional]`
//!
//! ```ignore
//! txscope::config::install_default(provider);
//!
//! #[txscope::transactional(read_only)]
//! fn count_accounts() -> Result<i64, txscope::TxError> {
//!     let tx = txscope::config::transaction()?;
//!     let rows = tx.execute("SELECT COUNT(*) FROM accounts", |stmt| stmt.query(&[]))?;
//!     Ok(rows[0].get_i64(0).unwrap_or(0))
//! }
//! ```

// Re-export the core contract.
pub use txscope_core::{
    Connection, ConnectionProvider, ParamValue, PreparedStatement, Row, StatefulTransaction,
    TxError, TxResult,
};

// Re-export the procedural macro.
pub use txscope_macros::transactional;

// Managers, definitions and the process-wide configuration.
pub use txscope_core::{config, transactions};

// In-memory connection doubles for downstream tests.
#[cfg(feature = "testing")]
pub use txscope_core::testing;

// Backend connection providers, enabled per feature.
pub mod backends {
    #[cfg(feature = "libsql-backend")]
    pub use txscope_libsql::{LibsqlConnection, LibsqlConnectionProvider};

    #[cfg(feature = "postgres-backend")]
    pub use txscope_tokio_postgres::{TokioPostgresConnection, TokioPostgresConnectionProvider};
}
