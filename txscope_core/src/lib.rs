#![forbid(unsafe_code)]
//! Core contracts for the txscope transaction demarcation library.
//! This crate is database-agnostic and should not contain any backend-specific logic.

pub mod config;
mod stateful;
pub mod transactions;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use stateful::StatefulTransaction;

use transactions::{Propagation, TransactionDefinition};

/// A backend-agnostic representation of a database value.
/// Used both for statement parameters and for values read back from rows,
/// so that `txscope_core` does not depend on a specific database driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Null,
}

/// One result row, as an ordered list of column values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<ParamValue>,
}

impl Row {
    pub fn new(values: Vec<ParamValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&ParamValue> {
        self.values.get(idx)
    }

    /// Integer column value; 32-bit integers are widened.
    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        match self.values.get(idx)? {
            ParamValue::I64(v) => Some(*v),
            ParamValue::I32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn get_str(&self, idx: usize) -> Option<&str> {
        match self.values.get(idx)? {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_values(self) -> Vec<ParamValue> {
        self.values
    }
}

/// Lightweight, backend-agnostic error type for transaction operations.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// The connection was already closed when an operation needed it.
    #[error("connection is closed")]
    Closed,
    /// No process-wide transaction manager has been installed.
    #[error("no transaction manager configured")]
    NotConfigured,
    /// The requested propagation cannot be honored in the current context.
    #[error("propagation {propagation:?} not satisfied: {reason}")]
    Propagation {
        propagation: Propagation,
        reason: &'static str,
    },
    /// The connection provider failed to hand out a connection.
    #[error("failed to open connection")]
    Provider {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Opaque backend error from the underlying driver or adapter.
    #[error("backend error")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TxError {
    /// Wrap a backend/driver error.
    pub fn backend<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TxError::Backend {
            source: Box::new(e),
        }
    }
    /// Wrap a connection acquisition error.
    pub fn provider<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TxError::Provider {
            source: Box::new(e),
        }
    }
}

/// Convenience alias for results returned by transaction operations.
pub type TxResult<T> = Result<T, TxError>;

/// A statement prepared on a [`Connection`]. Its lifetime is bounded by the
/// connection that produced it.
pub trait PreparedStatement {
    /// The SQL text this statement was prepared from.
    fn sql(&self) -> &str;

    /// Execute with the given parameters, returning the number of affected rows.
    fn execute(&mut self, params: &[ParamValue]) -> TxResult<u64>;

    /// Run the statement and collect every result row.
    fn query(&mut self, params: &[ParamValue]) -> TxResult<Vec<Row>>;

    /// Release the statement. Calling it more than once is a no-op.
    fn close(&mut self) -> TxResult<()>;
}

/// A stateful, non-thread-safe handle to one database session.
///
/// Work performed on a connection is transactional: it becomes durable on
/// [`commit`](Connection::commit) and is discarded on
/// [`rollback`](Connection::rollback) or when the connection is closed.
pub trait Connection {
    fn commit(&self) -> TxResult<()>;

    fn rollback(&self) -> TxResult<()>;

    /// Release the session. Closing a closed connection is a no-op.
    fn close(&self) -> TxResult<()>;

    fn is_closed(&self) -> bool;

    fn prepare_statement<'c>(&'c self, sql: &str) -> TxResult<Box<dyn PreparedStatement + 'c>>;

    /// Run one or more parameterless statements. Backends with a native batch
    /// API override this; the default prepares and executes `sql` once.
    fn execute_batch(&self, sql: &str) -> TxResult<()> {
        let mut stmt = self.prepare_statement(sql)?;
        let executed = stmt.execute(&[]);
        let released = stmt.close();
        executed?;
        released
    }
}

/// Source of fresh connections. Pooling, retries and networking are the
/// provider's business; the core only consumes this contract.
pub trait ConnectionProvider: Send + Sync {
    fn open_connection(&self, def: &TransactionDefinition) -> TxResult<Box<dyn Connection>>;
}

impl<F> ConnectionProvider for F
where
    F: Fn(&TransactionDefinition) -> TxResult<Box<dyn Connection>> + Send + Sync,
{
    fn open_connection(&self, def: &TransactionDefinition) -> TxResult<Box<dyn Connection>> {
        self(def)
    }
}
