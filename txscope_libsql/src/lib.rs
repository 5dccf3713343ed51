#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "libsql-backend"),
    doc = "Enable feature `libsql-backend` to use this adapter."
)]

#[cfg(feature = "libsql-backend")]
mod backend {
    use std::cell::{Cell, RefCell};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Instant;

    use libsql::{Database, Value};
    use tokio::runtime::{Builder, Runtime};
    use txscope_core::transactions::{Isolation, TransactionDefinition};
    use txscope_core::{
        Connection, ConnectionProvider, ParamValue, PreparedStatement, Row, TxError, TxResult,
    };

    #[cfg(feature = "tracing")]
    use tracing::info;

    const DEFAULT_BUSY_TIMEOUT_MS: u128 = 1000;

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, rows: usize, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(
                backend = "libsql",
                op = op,
                rows = rows,
                elapsed_ms = elapsed,
                success = success,
                "tx op"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("tx_ops_total", 1, "backend" => "libsql", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("tx_op_duration_ms", elapsed as f64, "backend" => "libsql", "op" => op.to_string());
            if !success {
                metrics::counter!("tx_op_errors_total", 1, "backend" => "libsql", "op" => op.to_string());
            }
        }
    }

    pub(crate) fn begin_sql(isolation: Isolation) -> &'static str {
        match isolation {
            Isolation::Default | Isolation::ReadCommitted => "BEGIN DEFERRED",
            Isolation::RepeatableRead => "BEGIN IMMEDIATE",
            Isolation::Serializable => "BEGIN EXCLUSIVE",
        }
    }

    // Helper function to convert ParamValue to libsql::Value.
    pub(crate) fn to_libsql_value(p: &ParamValue) -> Value {
        match p {
            ParamValue::String(s) => Value::Text(s.clone()),
            ParamValue::I32(i) => Value::Integer(i64::from(*i)), // libsql uses i64 for integers
            ParamValue::I64(i) => Value::Integer(*i),
            ParamValue::F64(f) => Value::Real(*f),
            ParamValue::Bool(b) => Value::Integer(i64::from(*b)), // SQLite bools are 0/1
            ParamValue::Bytes(b) => Value::Blob(b.clone()),
            ParamValue::Null => Value::Null,
        }
    }

    pub(crate) fn from_libsql_value(v: Value) -> ParamValue {
        match v {
            Value::Null => ParamValue::Null,
            Value::Integer(i) => ParamValue::I64(i),
            Value::Real(f) => ParamValue::F64(f),
            Value::Text(s) => ParamValue::String(s),
            Value::Blob(b) => ParamValue::Bytes(b),
        }
    }

    fn adapter_runtime() -> TxResult<Arc<Runtime>> {
        Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map(Arc::new)
            .map_err(TxError::provider)
    }

    /// Hands out libsql connections to one database.
    ///
    /// The driver is asynchronous; every call is driven to completion on the
    /// provider's own tokio runtime, so connections must not be used from
    /// inside another runtime's worker thread.
    #[derive(Clone)]
    pub struct LibsqlConnectionProvider {
        db: Arc<Database>,
        runtime: Arc<Runtime>,
    }

    impl LibsqlConnectionProvider {
        /// Wrap an existing database, driving it on a dedicated runtime.
        pub fn new(db: Arc<Database>) -> TxResult<Self> {
            Ok(Self::with_runtime(db, adapter_runtime()?))
        }

        /// Wrap an existing database, driving it on `runtime`.
        pub fn with_runtime(db: Arc<Database>, runtime: Arc<Runtime>) -> Self {
            Self { db, runtime }
        }

        /// Open (creating if needed) a local SQLite file.
        pub fn open_local(path: impl AsRef<Path>) -> TxResult<Self> {
            let runtime = adapter_runtime()?;
            let db = runtime
                .block_on(libsql::Builder::new_local(path.as_ref()).build())
                .map_err(TxError::provider)?;
            Ok(Self::with_runtime(Arc::new(db), runtime))
        }

        pub fn database(&self) -> &Arc<Database> {
            &self.db
        }

        pub fn runtime(&self) -> &Arc<Runtime> {
            &self.runtime
        }
    }

    impl ConnectionProvider for LibsqlConnectionProvider {
        fn open_connection(&self, def: &TransactionDefinition) -> TxResult<Box<dyn Connection>> {
            let start = Instant::now();
            let conn = match self.db.connect() {
                Ok(conn) => conn,
                Err(e) => {
                    obs_record("open", start, 0, false);
                    return Err(TxError::provider(e));
                }
            };
            // Apply a busy_timeout to reduce spurious SQLITE_BUSY. Use the provided timeout or a small default.
            let busy_ms = def
                .timeout
                .map(|d| d.as_millis())
                .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
            self.runtime.block_on(async {
                conn.execute_batch(&format!("PRAGMA busy_timeout = {}", busy_ms))
                    .await
                    .ok();
                if def.read_only {
                    conn.execute("PRAGMA query_only = ON", ()).await.ok();
                }
            });
            obs_record("open", start, 0, true);
            Ok(Box::new(LibsqlConnection {
                conn: RefCell::new(Some(conn)),
                runtime: Arc::clone(&self.runtime),
                begin: begin_sql(def.isolation),
                in_tx: Cell::new(false),
            }))
        }
    }

    /// One libsql session. A transaction is begun on the first statement after
    /// open, commit or rollback.
    pub struct LibsqlConnection {
        conn: RefCell<Option<libsql::Connection>>,
        runtime: Arc<Runtime>,
        begin: &'static str,
        in_tx: Cell<bool>,
    }

    impl LibsqlConnection {
        fn live(&self) -> TxResult<libsql::Connection> {
            self.conn.borrow().clone().ok_or(TxError::Closed)
        }

        fn ensure_begun(&self, conn: &libsql::Connection) -> TxResult<()> {
            if self.in_tx.get() {
                return Ok(());
            }
            self.runtime
                .block_on(conn.execute(self.begin, ()))
                .map_err(TxError::backend)?;
            self.in_tx.set(true);
            Ok(())
        }

        fn finish(&self, op: &str, sql: &str) -> TxResult<()> {
            let conn = self.live()?;
            if !self.in_tx.get() {
                return Ok(());
            }
            let start = Instant::now();
            let res = self
                .runtime
                .block_on(conn.execute(sql, ()))
                .map(|_| ())
                .map_err(TxError::backend);
            // A failed COMMIT leaves the transaction open for a rollback.
            if res.is_ok() {
                self.in_tx.set(false);
            }
            obs_record(op, start, 0, res.is_ok());
            res
        }

        /// Whether a transaction has been begun on this session and not yet ended.
        pub fn in_transaction(&self) -> bool {
            self.in_tx.get()
        }
    }

    impl Connection for LibsqlConnection {
        fn commit(&self) -> TxResult<()> {
            self.finish("commit", "COMMIT")
        }

        fn rollback(&self) -> TxResult<()> {
            self.finish("rollback", "ROLLBACK")
        }

        fn close(&self) -> TxResult<()> {
            let Some(conn) = self.conn.borrow_mut().take() else {
                return Ok(());
            };
            let start = Instant::now();
            // The session is released even when the pending ROLLBACK fails.
            let res = if self.in_tx.replace(false) {
                self.runtime
                    .block_on(conn.execute("ROLLBACK", ()))
                    .map(|_| ())
                    .map_err(TxError::backend)
            } else {
                Ok(())
            };
            drop(conn);
            obs_record("close", start, 0, res.is_ok());
            res
        }

        fn is_closed(&self) -> bool {
            self.conn.borrow().is_none()
        }

        fn prepare_statement<'c>(
            &'c self,
            sql: &str,
        ) -> TxResult<Box<dyn PreparedStatement + 'c>> {
            let conn = self.live()?;
            let stmt = self
                .runtime
                .block_on(conn.prepare(sql))
                .map_err(TxError::backend)?;
            Ok(Box::new(LibsqlStatement {
                owner: self,
                sql: sql.to_string(),
                stmt: Some(stmt),
            }))
        }

        fn execute_batch(&self, sql: &str) -> TxResult<()> {
            let conn = self.live()?;
            self.ensure_begun(&conn)?;
            let start = Instant::now();
            let res = self
                .runtime
                .block_on(conn.execute_batch(sql))
                .map(|_| ())
                .map_err(TxError::backend);
            obs_record("execute_batch", start, 0, res.is_ok());
            res
        }
    }

    /// A statement prepared on a [`LibsqlConnection`].
    pub struct LibsqlStatement<'c> {
        owner: &'c LibsqlConnection,
        sql: String,
        stmt: Option<libsql::Statement>,
    }

    impl LibsqlStatement<'_> {
        fn ready(&mut self) -> TxResult<&mut libsql::Statement> {
            let conn = self.owner.live()?;
            self.owner.ensure_begun(&conn)?;
            let stmt = self.stmt.as_mut().ok_or(TxError::Closed)?;
            stmt.reset();
            Ok(stmt)
        }
    }

    impl PreparedStatement for LibsqlStatement<'_> {
        fn sql(&self) -> &str {
            &self.sql
        }

        fn execute(&mut self, params: &[ParamValue]) -> TxResult<u64> {
            let start = Instant::now();
            let values: Vec<Value> = params.iter().map(to_libsql_value).collect();
            let runtime = Arc::clone(&self.owner.runtime);
            let stmt = self.ready()?;
            let res = runtime
                .block_on(stmt.execute(values))
                .map(|n| n as u64)
                .map_err(TxError::backend);
            let affected = res.as_ref().map(|n| *n as usize).unwrap_or(0);
            obs_record("execute", start, affected, res.is_ok());
            res
        }

        fn query(&mut self, params: &[ParamValue]) -> TxResult<Vec<Row>> {
            let start = Instant::now();
            let values: Vec<Value> = params.iter().map(to_libsql_value).collect();
            let runtime = Arc::clone(&self.owner.runtime);
            let stmt = self.ready()?;
            let res = runtime.block_on(async {
                let mut rows = stmt.query(values).await.map_err(TxError::backend)?;
                let mut out = Vec::new();
                while let Some(row) = rows.next().await.map_err(TxError::backend)? {
                    let n = row.column_count();
                    let mut values = Vec::with_capacity(n.max(0) as usize);
                    for idx in 0..n {
                        let v = row.get_value(idx).map_err(TxError::backend)?;
                        values.push(from_libsql_value(v));
                    }
                    out.push(Row::new(values));
                }
                Ok::<_, TxError>(out)
            });
            obs_record(
                "query",
                start,
                res.as_ref().map(Vec::len).unwrap_or(0),
                res.is_ok(),
            );
            res
        }

        fn close(&mut self) -> TxResult<()> {
            self.stmt.take();
            Ok(())
        }
    }
}

#[cfg(feature = "libsql-backend")]
pub use backend::{LibsqlConnection, LibsqlConnectionProvider, LibsqlStatement};
