#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "postgres-backend"),
    doc = "Enable feature `postgres-backend` to use this adapter."
)]

#[cfg(feature = "postgres-backend")]
mod backend {
    use std::cell::{Cell, RefCell};
    use std::sync::Arc;
    use std::time::Instant;

    use tokio::runtime::{Builder, Runtime};
    use tokio_postgres::{
        types::{ToSql, Type},
        Client, NoTls, Statement,
    };
    use txscope_core::transactions::{Isolation, TransactionDefinition};
    use txscope_core::{
        Connection, ConnectionProvider, ParamValue, PreparedStatement, Row, TxError, TxResult,
    };

    #[cfg(feature = "tracing")]
    use tracing::{error, info};

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, rows: usize, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(
                backend = "postgres",
                op = op,
                rows = rows,
                elapsed_ms = elapsed,
                success = success,
                "tx op"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("tx_ops_total", 1, "backend" => "postgres", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("tx_op_duration_ms", elapsed as f64, "backend" => "postgres", "op" => op.to_string());
            if !success {
                metrics::counter!("tx_op_errors_total", 1, "backend" => "postgres", "op" => op.to_string());
            }
        }
    }

    pub(crate) fn isolation_sql(isolation: Isolation) -> Option<&'static str> {
        match isolation {
            Isolation::Default => None,
            Isolation::ReadCommitted => Some("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            Isolation::RepeatableRead => Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            Isolation::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
        }
    }

    /// The batch that opens a transaction shaped by `def`.
    pub(crate) fn begin_sql(def: &TransactionDefinition) -> String {
        let mut stmts = vec!["BEGIN".to_string()];
        if let Some(iso) = isolation_sql(def.isolation) {
            stmts.push(iso.to_string());
        }
        if def.read_only {
            stmts.push("SET TRANSACTION READ ONLY".to_string());
        }
        if let Some(timeout) = def.timeout {
            stmts.push(format!(
                "SET LOCAL statement_timeout = {}",
                timeout.as_millis()
            ));
        }
        stmts.join("; ")
    }

    /// A helper to convert `ParamValue`s into a `Vec` of owned, boxed `ToSql` trait objects.
    /// This is necessary to manage the lifetimes of the parameters correctly.
    pub(crate) fn to_postgres_params(values: &[ParamValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
        values
            .iter()
            .map(|v| -> Box<dyn ToSql + Sync + Send> {
                match v {
                    ParamValue::String(s) => Box::new(s.clone()),
                    ParamValue::I32(i) => Box::new(*i),
                    ParamValue::I64(i) => Box::new(*i),
                    ParamValue::F64(f) => Box::new(*f),
                    ParamValue::Bool(b) => Box::new(*b),
                    ParamValue::Bytes(b) => Box::new(b.clone()),
                    ParamValue::Null => Box::new(Option::<i32>::None),
                }
            })
            .collect()
    }

    fn nullable<T>(v: Option<T>, f: impl FnOnce(T) -> ParamValue) -> ParamValue {
        v.map(f).unwrap_or(ParamValue::Null)
    }

    // Columns of other types are read through their text representation.
    fn from_postgres_row(row: &tokio_postgres::Row) -> TxResult<Row> {
        let mut values = Vec::with_capacity(row.len());
        for (idx, column) in row.columns().iter().enumerate() {
            let ty = column.type_();
            let value = if *ty == Type::BOOL {
                nullable(row.try_get::<_, Option<bool>>(idx).map_err(TxError::backend)?, ParamValue::Bool)
            } else if *ty == Type::INT2 {
                nullable(row.try_get::<_, Option<i16>>(idx).map_err(TxError::backend)?, |v| {
                    ParamValue::I32(i32::from(v))
                })
            } else if *ty == Type::INT4 {
                nullable(row.try_get::<_, Option<i32>>(idx).map_err(TxError::backend)?, ParamValue::I32)
            } else if *ty == Type::INT8 {
                nullable(row.try_get::<_, Option<i64>>(idx).map_err(TxError::backend)?, ParamValue::I64)
            } else if *ty == Type::FLOAT4 {
                nullable(row.try_get::<_, Option<f32>>(idx).map_err(TxError::backend)?, |v| {
                    ParamValue::F64(f64::from(v))
                })
            } else if *ty == Type::FLOAT8 {
                nullable(row.try_get::<_, Option<f64>>(idx).map_err(TxError::backend)?, ParamValue::F64)
            } else if *ty == Type::BYTEA {
                nullable(row.try_get::<_, Option<Vec<u8>>>(idx).map_err(TxError::backend)?, ParamValue::Bytes)
            } else {
                nullable(row.try_get::<_, Option<String>>(idx).map_err(TxError::backend)?, ParamValue::String)
            };
            values.push(value);
        }
        Ok(Row::new(values))
    }

    fn adapter_runtime() -> TxResult<Arc<Runtime>> {
        Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map(Arc::new)
            .map_err(TxError::provider)
    }

    /// Opens one PostgreSQL session per transaction.
    ///
    /// Sessions are driven on the provider's own tokio runtime, which also runs
    /// each session's connection task. Do not call into a connection from inside
    /// another runtime's worker thread.
    #[derive(Clone)]
    pub struct TokioPostgresConnectionProvider {
        conn_str: String,
        runtime: Arc<Runtime>,
    }

    impl TokioPostgresConnectionProvider {
        pub fn new<S: Into<String>>(conn_str: S) -> TxResult<Self> {
            Ok(Self::with_runtime(conn_str, adapter_runtime()?))
        }

        pub fn with_runtime<S: Into<String>>(conn_str: S, runtime: Arc<Runtime>) -> Self {
            Self {
                conn_str: conn_str.into(),
                runtime,
            }
        }

        pub fn conn_str(&self) -> &str {
            &self.conn_str
        }

        pub fn runtime(&self) -> &Arc<Runtime> {
            &self.runtime
        }
    }

    impl std::fmt::Debug for TokioPostgresConnectionProvider {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TokioPostgresConnectionProvider")
                .finish_non_exhaustive()
        }
    }

    impl ConnectionProvider for TokioPostgresConnectionProvider {
        fn open_connection(&self, def: &TransactionDefinition) -> TxResult<Box<dyn Connection>> {
            let start = Instant::now();
            let (client, connection) = match self
                .runtime
                .block_on(tokio_postgres::connect(&self.conn_str, NoTls))
            {
                Ok(pair) => pair,
                Err(e) => {
                    obs_record("open", start, 0, false);
                    return Err(TxError::provider(e));
                }
            };
            // The connection object must be spawned to process network events.
            self.runtime.spawn(async move {
                if let Err(e) = connection.await {
                    #[cfg(feature = "tracing")]
                    error!(error = %e, "postgres connection error");
                    #[cfg(not(feature = "tracing"))]
                    eprintln!("Postgres connection error: {}", e);
                }
            });
            obs_record("open", start, 0, true);
            Ok(Box::new(TokioPostgresConnection {
                client: RefCell::new(Some(client)),
                runtime: Arc::clone(&self.runtime),
                block: Block::new(begin_sql(def)),
            }))
        }
    }

    /// Whether a transaction block is open on a session. The block is begun
    /// lazily and ended by COMMIT or ROLLBACK; the server ends it even when
    /// COMMIT fails.
    pub(crate) struct Block {
        begin: String,
        open: Cell<bool>,
    }

    impl Block {
        pub(crate) fn new(begin: String) -> Self {
            Self {
                begin,
                open: Cell::new(false),
            }
        }

        pub(crate) fn is_open(&self) -> bool {
            self.open.get()
        }

        pub(crate) fn ensure_begun(
            &self,
            run: impl FnOnce(&str) -> TxResult<()>,
        ) -> TxResult<()> {
            if self.open.get() {
                return Ok(());
            }
            run(&self.begin)?;
            self.open.set(true);
            Ok(())
        }

        /// Run `sql` (COMMIT or ROLLBACK) if a block is open.
        pub(crate) fn end(&self, sql: &str, run: impl FnOnce(&str) -> TxResult<()>) -> TxResult<()> {
            if !self.open.replace(false) {
                return Ok(());
            }
            run(sql)
        }
    }

    /// One PostgreSQL session. A transaction is begun on the first statement
    /// after open, commit or rollback.
    ///
    /// The session counts as closed only after [`close`](Connection::close).
    /// A session the server has dropped stays open from the caller's point of
    /// view, so pending work surfaces the driver's error on commit instead of
    /// vanishing.
    pub struct TokioPostgresConnection {
        client: RefCell<Option<Client>>,
        runtime: Arc<Runtime>,
        block: Block,
    }

    impl TokioPostgresConnection {
        fn with_client<R>(&self, f: impl FnOnce(&Client) -> TxResult<R>) -> TxResult<R> {
            let guard = self.client.borrow();
            let client = guard.as_ref().ok_or(TxError::Closed)?;
            f(client)
        }

        fn ensure_begun(&self, client: &Client) -> TxResult<()> {
            self.block.ensure_begun(|begin| {
                self.runtime
                    .block_on(client.batch_execute(begin))
                    .map_err(TxError::backend)
            })
        }

        fn finish(&self, op: &str, sql: &str) -> TxResult<()> {
            self.with_client(|client| {
                self.block.end(sql, |sql| {
                    let start = Instant::now();
                    let res = self
                        .runtime
                        .block_on(client.batch_execute(sql))
                        .map_err(TxError::backend);
                    obs_record(op, start, 0, res.is_ok());
                    res
                })
            })
        }

        /// Whether a transaction has been begun on this session and not yet ended.
        pub fn in_transaction(&self) -> bool {
            self.block.is_open()
        }

        /// Whether the server side of the session is gone.
        pub fn is_session_lost(&self) -> bool {
            self.client
                .borrow()
                .as_ref()
                .is_some_and(|client| client.is_closed())
        }
    }

    impl Connection for TokioPostgresConnection {
        fn commit(&self) -> TxResult<()> {
            self.finish("commit", "COMMIT")
        }

        fn rollback(&self) -> TxResult<()> {
            self.finish("rollback", "ROLLBACK")
        }

        // The client is released even when the pending ROLLBACK fails.
        fn close(&self) -> TxResult<()> {
            let Some(client) = self.client.borrow_mut().take() else {
                return Ok(());
            };
            let start = Instant::now();
            let res = self.block.end("ROLLBACK", |sql| {
                self.runtime
                    .block_on(client.batch_execute(sql))
                    .map_err(TxError::backend)
            });
            // Dropping the client ends the spawned connection task.
            drop(client);
            obs_record("close", start, 0, res.is_ok());
            res
        }

        fn is_closed(&self) -> bool {
            self.client.borrow().is_none()
        }

        fn prepare_statement<'c>(
            &'c self,
            sql: &str,
        ) -> TxResult<Box<dyn PreparedStatement + 'c>> {
            let stmt = self.with_client(|client| {
                self.runtime
                    .block_on(client.prepare(sql))
                    .map_err(TxError::backend)
            })?;
            Ok(Box::new(TokioPostgresStatement {
                owner: self,
                sql: sql.to_string(),
                stmt: Some(stmt),
            }))
        }

        fn execute_batch(&self, sql: &str) -> TxResult<()> {
            self.with_client(|client| {
                self.ensure_begun(client)?;
                let start = Instant::now();
                let res = self
                    .runtime
                    .block_on(client.batch_execute(sql))
                    .map_err(TxError::backend);
                obs_record("execute_batch", start, 0, res.is_ok());
                res
            })
        }
    }

    /// A server-side prepared statement on a [`TokioPostgresConnection`].
    pub struct TokioPostgresStatement<'c> {
        owner: &'c TokioPostgresConnection,
        sql: String,
        stmt: Option<Statement>,
    }

    impl TokioPostgresStatement<'_> {
        fn run<R>(
            &self,
            params: &[ParamValue],
            f: impl FnOnce(&Runtime, &Client, &Statement, &[&(dyn ToSql + Sync)]) -> TxResult<R>,
        ) -> TxResult<R> {
            let stmt = self.stmt.as_ref().ok_or(TxError::Closed)?;
            let owner = self.owner;
            owner.with_client(|client| {
                owner.ensure_begun(client)?;
                let boxed = to_postgres_params(params);
                let refs: Vec<&(dyn ToSql + Sync)> = boxed
                    .iter()
                    .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                    .collect();
                f(&owner.runtime, client, stmt, &refs)
            })
        }
    }

    impl PreparedStatement for TokioPostgresStatement<'_> {
        fn sql(&self) -> &str {
            &self.sql
        }

        fn execute(&mut self, params: &[ParamValue]) -> TxResult<u64> {
            let start = Instant::now();
            let res = self.run(params, |rt, client, stmt, refs| {
                rt.block_on(client.execute(stmt, refs))
                    .map_err(TxError::backend)
            });
            let affected = res.as_ref().map(|n| *n as usize).unwrap_or(0);
            obs_record("execute", start, affected, res.is_ok());
            res
        }

        fn query(&mut self, params: &[ParamValue]) -> TxResult<Vec<Row>> {
            let start = Instant::now();
            let res = self.run(params, |rt, client, stmt, refs| {
                let rows = rt
                    .block_on(client.query(stmt, refs))
                    .map_err(TxError::backend)?;
                rows.iter().map(from_postgres_row).collect()
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

#[cfg(feature = "postgres-backend")]
pub use backend::{
    TokioPostgresConnection, TokioPostgresConnectionProvider, TokioPostgresStatement,
};
