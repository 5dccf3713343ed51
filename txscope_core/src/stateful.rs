//! A transaction bound to exactly one physical connection.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::transactions::TransactionDefinition;
use crate::{Connection, ConnectionProvider, PreparedStatement, TxError, TxResult};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Owns one connection for its whole lifetime and presents a uniform
/// commit/rollback/close/execute contract on top of it.
///
/// Liveness is read from the connection itself; there is no separate state
/// flag. Terminal operations on a transaction that is no longer live are
/// no-ops, so callers may commit, roll back or close defensively.
pub struct StatefulTransaction {
    id: u64,
    connection: Box<dyn Connection>,
    auto_close: Cell<bool>,
}

impl StatefulTransaction {
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            connection,
            auto_close: Cell::new(false),
        }
    }

    /// Acquire a fresh connection from `provider` and wrap it.
    pub fn open(provider: &dyn ConnectionProvider, def: &TransactionDefinition) -> TxResult<Self> {
        Ok(Self::new(provider.open_connection(def)?))
    }

    /// Construction-time variant of [`set_auto_close`](Self::set_auto_close).
    pub fn with_auto_close(self, auto_close: bool) -> Self {
        self.auto_close.set(auto_close);
        self
    }

    /// Process-unique identifier, used to correlate log lines.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_live(&self) -> bool {
        !self.connection.is_closed()
    }

    pub fn auto_close(&self) -> bool {
        self.auto_close.get()
    }

    /// Whether `commit` and `rollback` also close the connection.
    pub fn set_auto_close(&self, auto_close: bool) -> &Self {
        self.auto_close.set(auto_close);
        self
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub fn commit(&self) -> TxResult<()> {
        if !self.is_live() {
            return Ok(());
        }
        let committed = self.connection.commit();
        self.finish(committed)
    }

    pub fn rollback(&self) -> TxResult<()> {
        if !self.is_live() {
            return Ok(());
        }
        let rolled_back = self.connection.rollback();
        self.finish(rolled_back)
    }

    pub fn close(&self) -> TxResult<()> {
        if !self.is_live() {
            return Ok(());
        }
        self.connection.close()
    }

    /// Prepare `sql`, hand the statement to `action`, and release the statement
    /// on every exit path. A release failure is only reported when `action`
    /// itself succeeded.
    pub fn execute<R, E, F>(&self, sql: &str, action: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn PreparedStatement) -> Result<R, E>,
        E: From<TxError>,
    {
        let stmt = self.connection.prepare_statement(sql)?;
        let mut guard = StatementGuard { stmt: Some(stmt) };
        let outcome = match guard.stmt.as_mut() {
            Some(stmt) => action(stmt.as_mut()),
            None => Err(TxError::Closed.into()),
        };
        let released = guard.release();
        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Err(release_err)) => {
                warn!(tx = self.id, error = %release_err, "failed to release statement");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Run `action` directly against the raw connection.
    pub fn with_connection<R, F>(&self, action: F) -> R
    where
        F: FnOnce(&dyn Connection) -> R,
    {
        action(self.connection.as_ref())
    }

    // Auto-close runs whatever the terminal call returned; the terminal failure wins.
    fn finish(&self, outcome: TxResult<()>) -> TxResult<()> {
        if !self.auto_close.get() {
            return outcome;
        }
        let closed = self.connection.close();
        match (outcome, closed) {
            (Err(e), Err(close_err)) => {
                warn!(tx = self.id, error = %close_err, "auto-close failed after terminal failure");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), closed) => closed,
        }
    }
}

impl fmt::Debug for StatefulTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulTransaction")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("auto_close", &self.auto_close.get())
            .finish()
    }
}

// Dropping the last handle releases the connection; backends roll back pending work on close.
impl Drop for StatefulTransaction {
    fn drop(&mut self) {
        if self.is_live() {
            if let Err(e) = self.connection.close() {
                warn!(tx = self.id, error = %e, "failed to close connection on drop");
            }
        }
    }
}

/// Releases a prepared statement when dropped, covering unwinding out of an action.
struct StatementGuard<'c> {
    stmt: Option<Box<dyn PreparedStatement + 'c>>,
}

impl StatementGuard<'_> {
    fn release(&mut self) -> TxResult<()> {
        match self.stmt.take() {
            Some(mut stmt) => stmt.close(),
            None => Ok(()),
        }
    }
}

impl Drop for StatementGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut stmt) = self.stmt.take() {
            let _ = stmt.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, Faults, MockProvider};
    use crate::ParamValue;
    use proptest::prelude::*;

    fn open(provider: &MockProvider) -> StatefulTransaction {
        StatefulTransaction::open(provider, &TransactionDefinition::default()).expect("open")
    }

    #[test]
    fn fresh_transaction_is_live_and_not_auto_closing() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        assert!(tx.is_live());
        assert!(!tx.auto_close());
        assert_eq!(provider.opened(), 1);
    }

    #[test]
    fn ids_are_unique() {
        let provider = MockProvider::new();
        let a = open(&provider);
        let b = open(&provider);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn commit_without_auto_close_keeps_connection_open() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        tx.commit().unwrap();
        assert!(tx.is_live());
        assert_eq!(provider.events(), vec![Event::Opened(0), Event::Committed(0)]);
        tx.close().unwrap();
        assert!(!tx.is_live());
    }

    #[test]
    fn commit_with_auto_close_closes_connection() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        tx.set_auto_close(true).commit().unwrap();
        assert!(!tx.is_live());
        assert_eq!(
            provider.events(),
            vec![Event::Opened(0), Event::Committed(0), Event::Closed(0)]
        );
    }

    #[test]
    fn rollback_with_auto_close_closes_connection() {
        let provider = MockProvider::new();
        let tx = open(&provider).with_auto_close(true);
        tx.rollback().unwrap();
        assert!(!tx.is_live());
        assert_eq!(
            provider.events(),
            vec![Event::Opened(0), Event::RolledBack(0), Event::Closed(0)]
        );
    }

    #[test]
    fn rollback_without_auto_close_keeps_connection_open() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        tx.rollback().unwrap();
        assert!(tx.is_live());
    }

    #[test]
    fn terminal_calls_on_closed_transaction_are_noops() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        tx.close().unwrap();
        tx.close().unwrap();
        tx.commit().unwrap();
        tx.rollback().unwrap();
        assert_eq!(provider.events(), vec![Event::Opened(0), Event::Closed(0)]);
    }

    #[test]
    fn failed_commit_still_auto_closes_and_propagates() {
        let provider = MockProvider::new();
        provider.set_faults(Faults {
            commit: true,
            ..Faults::default()
        });
        let tx = open(&provider).with_auto_close(true);
        let err = tx.commit().expect_err("commit should fail");
        assert!(matches!(err, TxError::Backend { .. }));
        assert!(!tx.is_live(), "auto-close must run after a failed commit");
        assert_eq!(provider.events(), vec![Event::Opened(0), Event::Closed(0)]);
    }

    #[test]
    fn commit_failure_wins_over_close_failure() {
        let provider = MockProvider::new();
        provider.set_faults(Faults {
            commit: true,
            close: true,
            ..Faults::default()
        });
        let tx = open(&provider).with_auto_close(true);
        let err = tx.commit().expect_err("commit should fail");
        let source = std::error::Error::source(&err).expect("source").to_string();
        assert!(source.contains("commit"), "unexpected error: {source}");
    }

    #[test]
    fn close_failure_after_successful_commit_is_reported() {
        let provider = MockProvider::new();
        provider.set_faults(Faults {
            close: true,
            ..Faults::default()
        });
        let tx = open(&provider).with_auto_close(true);
        let err = tx.commit().expect_err("close should fail");
        let source = std::error::Error::source(&err).expect("source").to_string();
        assert!(source.contains("close"), "unexpected error: {source}");
    }

    #[test]
    fn execute_releases_statement_on_success() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        let affected = tx
            .execute("INSERT INTO t VALUES (?)", |stmt| {
                assert_eq!(stmt.sql(), "INSERT INTO t VALUES (?)");
                stmt.execute(&[ParamValue::I64(1)])
            })
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(
            provider.events(),
            vec![
                Event::Opened(0),
                Event::Prepared(0, "INSERT INTO t VALUES (?)".into()),
                Event::Executed(0, "INSERT INTO t VALUES (?)".into()),
                Event::StatementClosed(0),
            ]
        );
    }

    #[test]
    fn execute_releases_statement_on_action_failure() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        let err = tx
            .execute::<(), TxError, _>("SELECT 1", |_stmt| Err(TxError::Closed))
            .expect_err("action failure should propagate");
        assert!(matches!(err, TxError::Closed));
        assert_eq!(provider.events().last(), Some(&Event::StatementClosed(0)));
    }

    #[test]
    fn execute_releases_statement_when_action_panics() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = tx.execute::<(), TxError, _>("SELECT 1", |_stmt| panic!("action blew up"));
        }));
        assert!(res.is_err());
        assert_eq!(provider.events().last(), Some(&Event::StatementClosed(0)));
    }

    #[test]
    fn execute_propagates_prepare_failure() {
        let provider = MockProvider::new();
        provider.set_faults(Faults {
            prepare: true,
            ..Faults::default()
        });
        let tx = open(&provider);
        let mut called = false;
        let err = tx
            .execute::<(), TxError, _>("SELECT 1", |_stmt| {
                called = true;
                Ok(())
            })
            .expect_err("prepare should fail");
        assert!(matches!(err, TxError::Backend { .. }));
        assert!(!called);
    }

    #[test]
    fn execute_after_close_surfaces_connection_error() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        tx.close().unwrap();
        let err = tx
            .execute::<(), TxError, _>("SELECT 1", |_stmt| Ok(()))
            .expect_err("closed connection should refuse to prepare");
        assert!(matches!(err, TxError::Closed));
    }

    #[test]
    fn query_returns_rows_from_statement() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        let rows = tx
            .execute::<_, TxError, _>("SELECT 1", |stmt| stmt.query(&[]))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str(0), Some("SELECT 1"));
    }

    #[test]
    fn with_connection_hands_out_raw_connection() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        let closed = tx.with_connection(|conn| conn.is_closed());
        assert!(!closed);
        tx.with_connection(|conn| conn.commit()).unwrap();
        assert_eq!(provider.events(), vec![Event::Opened(0), Event::Committed(0)]);
    }

    #[test]
    fn debug_output_mentions_liveness() {
        let provider = MockProvider::new();
        let tx = open(&provider);
        let s = format!("{:?}", tx);
        assert!(s.contains("live: true"), "{s}");
    }

    #[test]
    fn dropping_a_live_transaction_closes_its_connection() {
        let provider = MockProvider::new();
        drop(open(&provider));
        assert_eq!(provider.events(), vec![Event::Opened(0), Event::Closed(0)]);

        let closed = open(&provider);
        closed.close().unwrap();
        drop(closed);
        assert_eq!(provider.events_for(1), vec![Event::Opened(1), Event::Closed(1)]);
    }

    #[derive(Debug, Clone, Copy)]
    enum Terminal {
        Commit,
        Rollback,
        Close,
    }

    fn terminal() -> impl Strategy<Value = Terminal> {
        prop_oneof![
            Just(Terminal::Commit),
            Just(Terminal::Rollback),
            Just(Terminal::Close),
        ]
    }

    proptest! {
        #[test]
        fn terminal_sequences_are_idempotent(
            auto_close in any::<bool>(),
            ops in proptest::collection::vec(terminal(), 1..12),
        ) {
            let provider = MockProvider::new();
            let tx = open(&provider).with_auto_close(auto_close);
            let mut terminated = false;
            let mut events_at_termination = None;
            for op in ops {
                match op {
                    Terminal::Commit => tx.commit().unwrap(),
                    Terminal::Rollback => tx.rollback().unwrap(),
                    Terminal::Close => tx.close().unwrap(),
                }
                let terminal_now = matches!(op, Terminal::Close) || auto_close;
                if terminated {
                    prop_assert!(!tx.is_live());
                    prop_assert_eq!(Some(provider.events()), events_at_termination.clone());
                } else if terminal_now {
                    terminated = true;
                    prop_assert!(!tx.is_live());
                    events_at_termination = Some(provider.events());
                } else {
                    prop_assert!(tx.is_live());
                }
            }
        }
    }
}
