//! In-memory connection doubles for exercising transaction lifecycles
//! without a database. Enabled for other crates through the `testing` feature.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transactions::TransactionDefinition;
use crate::{Connection, ConnectionProvider, ParamValue, PreparedStatement, Row, TxError, TxResult};

/// Everything a [`MockConnection`] did, tagged with the connection id.
/// Failed operations are not recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened(usize),
    Prepared(usize, String),
    Executed(usize, String),
    StatementClosed(usize),
    Committed(usize),
    RolledBack(usize),
    Closed(usize),
}

/// Operations that should fail on every connection of a provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub open: bool,
    pub commit: bool,
    pub rollback: bool,
    pub close: bool,
    pub prepare: bool,
    pub execute: bool,
}

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<Event>>,
    faults: Mutex<Faults>,
    definitions: Mutex<Vec<TransactionDefinition>>,
    next_id: AtomicUsize,
}

fn injected(op: &str) -> TxError {
    TxError::backend(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("injected {op} failure"),
    ))
}

/// Hands out [`MockConnection`]s numbered from zero and records what they do.
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct MockProvider {
    shared: Arc<Shared>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.shared.faults.lock() = faults;
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.events.lock().clone()
    }

    /// Events of a single connection, in order.
    pub fn events_for(&self, conn: usize) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| event_conn(e) == conn)
            .collect()
    }

    /// Number of connections handed out so far.
    pub fn opened(&self) -> usize {
        self.shared.next_id.load(Ordering::SeqCst)
    }

    /// Definitions passed to `open_connection`, in call order.
    pub fn definitions(&self) -> Vec<TransactionDefinition> {
        self.shared.definitions.lock().clone()
    }

    fn record(&self, event: Event) {
        self.shared.events.lock().push(event);
    }
}

fn event_conn(e: &Event) -> usize {
    match e {
        Event::Opened(id)
        | Event::Prepared(id, _)
        | Event::Executed(id, _)
        | Event::StatementClosed(id)
        | Event::Committed(id)
        | Event::RolledBack(id)
        | Event::Closed(id) => *id,
    }
}

impl ConnectionProvider for MockProvider {
    fn open_connection(&self, def: &TransactionDefinition) -> TxResult<Box<dyn Connection>> {
        if self.shared.faults.lock().open {
            return Err(TxError::provider(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "injected open failure",
            )));
        }
        self.shared.definitions.lock().push(def.clone());
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(Event::Opened(id));
        Ok(Box::new(MockConnection {
            id,
            provider: self.clone(),
            closed: Cell::new(false),
        }))
    }
}

/// A connection that only records what it is asked to do.
pub struct MockConnection {
    id: usize,
    provider: MockProvider,
    closed: Cell<bool>,
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    fn faults(&self) -> Faults {
        *self.provider.shared.faults.lock()
    }

    fn ensure_open(&self) -> TxResult<()> {
        if self.closed.get() {
            Err(TxError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Connection for MockConnection {
    fn commit(&self) -> TxResult<()> {
        self.ensure_open()?;
        if self.faults().commit {
            return Err(injected("commit"));
        }
        self.provider.record(Event::Committed(self.id));
        Ok(())
    }

    fn rollback(&self) -> TxResult<()> {
        self.ensure_open()?;
        if self.faults().rollback {
            return Err(injected("rollback"));
        }
        self.provider.record(Event::RolledBack(self.id));
        Ok(())
    }

    fn close(&self) -> TxResult<()> {
        if self.closed.get() {
            return Ok(());
        }
        // A failed close leaves the session open.
        if self.faults().close {
            return Err(injected("close"));
        }
        self.closed.set(true);
        self.provider.record(Event::Closed(self.id));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn prepare_statement<'c>(&'c self, sql: &str) -> TxResult<Box<dyn PreparedStatement + 'c>> {
        self.ensure_open()?;
        if self.faults().prepare {
            return Err(injected("prepare"));
        }
        self.provider
            .record(Event::Prepared(self.id, sql.to_string()));
        Ok(Box::new(MockStatement {
            conn: self,
            sql: sql.to_string(),
            closed: false,
        }))
    }
}

/// Statement double. `query` yields a single row holding the statement text.
pub struct MockStatement<'c> {
    conn: &'c MockConnection,
    sql: String,
    closed: bool,
}

impl PreparedStatement for MockStatement<'_> {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn execute(&mut self, _params: &[ParamValue]) -> TxResult<u64> {
        self.conn.ensure_open()?;
        if self.closed {
            return Err(TxError::Closed);
        }
        if self.conn.faults().execute {
            return Err(injected("execute"));
        }
        self.conn
            .provider
            .record(Event::Executed(self.conn.id, self.sql.clone()));
        Ok(1)
    }

    fn query(&mut self, params: &[ParamValue]) -> TxResult<Vec<Row>> {
        self.execute(params)?;
        Ok(vec![Row::new(vec![ParamValue::String(self.sql.clone())])])
    }

    fn close(&mut self) -> TxResult<()> {
        if !self.closed {
            self.closed = true;
            self.conn
                .provider
                .record(Event::StatementClosed(self.conn.id));
        }
        Ok(())
    }
}
