//! Common integration testing utilities and generic tests reusable across backends.
//!
//! Backends implement [`ProviderFactory`] in their integration tests and call the
//! `test_*` functions; every function panics on a violated expectation and
//! returns driver failures as errors.

use std::rc::Rc;
use std::sync::Arc;

use txscope_core::transactions::{
    LocalTransactionManager, TransactionDefinition, TransactionManager, TransactionManagerExt,
};
use txscope_core::{ConnectionProvider, ParamValue, StatefulTransaction, TxError, TxResult};

/// In-memory connection doubles, re-exported for harnesses.
pub use txscope_core::testing as mock;

/// Expose migration SQL via constants for harnesses.
pub mod migrations {
    pub const POSTGRES_ITEMS_SQL: &str = include_str!("../migrations/postgres/001_items.sql");
    pub const LIBSQL_ITEMS_SQL: &str = include_str!("../migrations/libsql/001_items.sql");
}

/// Placeholder syntax of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `?1`, `?2`, ...
    Sqlite,
    /// `$1`, `$2`, ...
    Postgres,
}

impl Dialect {
    /// The placeholder for the `n`th (1-based) parameter.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{n}"),
            Dialect::Postgres => format!("${n}"),
        }
    }
}

pub trait ProviderFactory {
    /// A provider connected to a database where the `items` table exists and is empty.
    fn new_provider(&self) -> TxResult<Arc<dyn ConnectionProvider>>;

    fn dialect(&self) -> Dialect;
}

pub fn insert_item(tx: &StatefulTransaction, dialect: Dialect, name: &str) -> TxResult<u64> {
    let sql = format!("INSERT INTO items (name) VALUES ({})", dialect.placeholder(1));
    tx.execute(&sql, |stmt| stmt.execute(&[ParamValue::String(name.to_string())]))
}

pub fn count_items(tx: &StatefulTransaction, dialect: Dialect, name: &str) -> TxResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM items WHERE name = {}", dialect.placeholder(1));
    let rows = tx.execute(&sql, |stmt| stmt.query(&[ParamValue::String(name.to_string())]))?;
    Ok(rows.first().and_then(|row| row.get_i64(0)).unwrap_or(0))
}

/// Count committed rows named `name` through a fresh, auto-closing transaction.
pub fn count_committed(
    provider: &dyn ConnectionProvider,
    dialect: Dialect,
    name: &str,
) -> TxResult<i64> {
    let tx = StatefulTransaction::open(provider, &TransactionDefinition::default())?
        .with_auto_close(true);
    let n = count_items(&tx, dialect, name)?;
    tx.commit()?;
    Ok(n)
}

#[derive(Debug)]
enum BlockError {
    Tx(TxError),
    Aborted,
}

impl From<TxError> for BlockError {
    fn from(e: TxError) -> Self {
        BlockError::Tx(e)
    }
}

/// Generic commit test: committed work is visible to other connections.
pub fn test_commit_persists<F: ProviderFactory>(f: &F) -> TxResult<()> {
    let provider = f.new_provider()?;
    let d = f.dialect();
    let tx = StatefulTransaction::open(provider.as_ref(), &TransactionDefinition::default())?;
    assert_eq!(insert_item(&tx, d, "committed")?, 1);
    assert_eq!(count_items(&tx, d, "committed")?, 1);
    tx.commit()?;
    assert!(tx.is_live(), "commit without auto-close keeps the connection");
    tx.close()?;
    assert!(!tx.is_live());

    assert_eq!(count_committed(provider.as_ref(), d, "committed")?, 1);
    Ok(())
}

/// Generic rollback test: rolled back work is discarded.
pub fn test_rollback_discards<F: ProviderFactory>(f: &F) -> TxResult<()> {
    let provider = f.new_provider()?;
    let d = f.dialect();
    let tx = StatefulTransaction::open(provider.as_ref(), &TransactionDefinition::default())?
        .with_auto_close(true);
    insert_item(&tx, d, "discarded")?;
    tx.rollback()?;
    assert!(!tx.is_live(), "auto-close releases the connection");

    assert_eq!(count_committed(provider.as_ref(), d, "discarded")?, 0);
    Ok(())
}

/// A failing block passed to `execute_in_context` leaves nothing behind.
pub fn test_block_failure_rolls_back<F: ProviderFactory>(f: &F) -> TxResult<()> {
    let provider = f.new_provider()?;
    let d = f.dialect();
    let mgr = LocalTransactionManager::new(Arc::clone(&provider));
    let tx = mgr.open_transaction()?;
    let res = mgr.execute_in_context(Rc::clone(&tx), || {
        insert_item(&*mgr.get_transaction()?, d, "aborted")?;
        Err::<(), _>(BlockError::Aborted)
    });
    match res {
        Err(BlockError::Aborted) => {}
        Err(BlockError::Tx(e)) => return Err(e),
        Ok(()) => panic!("block failure must propagate"),
    }
    assert!(!tx.is_live());
    assert!(mgr.current_transaction().is_none());

    assert_eq!(count_committed(provider.as_ref(), d, "aborted")?, 0);
    Ok(())
}

/// A nested scope commits its own work and hands the outer transaction back live.
pub fn test_execute_in_context_restores_outer<F: ProviderFactory>(f: &F) -> TxResult<()> {
    let provider = f.new_provider()?;
    let d = f.dialect();
    let mgr = LocalTransactionManager::new(Arc::clone(&provider));
    let outer = mgr.get_transaction()?;
    let inner = mgr.open_transaction()?;
    mgr.execute_in_context(Rc::clone(&inner), || {
        insert_item(&*mgr.get_transaction()?, d, "inner").map(|_| ())
    })?;
    assert!(!inner.is_live());
    assert!(outer.is_live());
    let bound = mgr.current_transaction().expect("outer binding restored");
    assert!(Rc::ptr_eq(&bound, &outer));

    // The outer transaction keeps working after the nested scope.
    assert_eq!(count_items(&outer, d, "inner")?, 1);
    insert_item(&outer, d, "outer")?;
    outer.commit()?;
    outer.close()?;

    assert_eq!(count_committed(provider.as_ref(), d, "outer")?, 1);
    Ok(())
}

/// Terminal calls on a finished transaction are no-ops; statements report a closed connection.
pub fn test_closed_transaction_behaviour<F: ProviderFactory>(f: &F) -> TxResult<()> {
    let provider = f.new_provider()?;
    let d = f.dialect();
    let tx = StatefulTransaction::open(provider.as_ref(), &TransactionDefinition::default())?
        .with_auto_close(true);
    insert_item(&tx, d, "closed")?;
    tx.commit()?;
    tx.commit()?;
    tx.rollback()?;
    tx.close()?;
    let err = insert_item(&tx, d, "after-close").expect_err("connection is closed");
    assert!(matches!(err, TxError::Closed), "unexpected error: {err:?}");

    assert_eq!(count_committed(provider.as_ref(), d, "closed")?, 1);
    Ok(())
}

/// Read-only transactions reject writes (best effort across backends).
pub fn test_read_only_rejects_writes<F: ProviderFactory>(f: &F) -> TxResult<()> {
    let provider = f.new_provider()?;
    let d = f.dialect();
    let def = TransactionDefinition {
        read_only: true,
        ..TransactionDefinition::default()
    };
    let tx = StatefulTransaction::open(provider.as_ref(), &def)?;
    assert_eq!(count_items(&tx, d, "read-only")?, 0);
    assert!(insert_item(&tx, d, "read-only").is_err());
    tx.close()?;

    assert_eq!(count_committed(provider.as_ref(), d, "read-only")?, 0);
    Ok(())
}
