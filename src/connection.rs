//! Database connection wrapper that runs query hooks.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    ExecResult, IsolationLevel, QueryResult, Statement, StreamTrait, TransactionError,
    TransactionTrait,
};
use tracing::{Instrument, Span};

use crate::config::ConnectionConfig;
use crate::context::QueryContext;
use crate::error::QueryError;
use crate::hook::{Hooks, QueryEvent, QueryHook, QueryKind};
use crate::tracing_hook::TracingHook;

/// A wrapper around SeaORM's `DatabaseConnection` that runs registered
/// [`QueryHook`]s around every statement.
///
/// `HookedConnection` implements `ConnectionTrait`, making it a drop-in
/// replacement for `DatabaseConnection`. Queries issued through the trait use
/// [`QueryContext::current()`]; use [`with_context`](Self::with_context) to
/// pass an explicit context carrying a deadline, a cancellation token or a
/// parent span.
///
/// Cloning is cheap: clones share the underlying connection.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm::Database;
/// use sea_orm_query_hooks::{QueryContext, TracingExt};
///
/// let db = Database::connect("postgres://localhost/mydb").await?.with_tracing();
///
/// // Parented to the current span
/// let users = Users::find().all(&db).await?;
///
/// // With an explicit context
/// let ctx = QueryContext::current().with_timeout(Duration::from_secs(2));
/// let users = Users::find().all(&db.with_context(ctx)).await?;
///
/// // Statements inside the transaction run through the hooks too
/// let txn = db.begin().await?;
/// let user = user.insert(&txn).await?;
/// txn.commit().await?;
/// ```
#[derive(Debug, Clone)]
pub struct HookedConnection {
    inner: Arc<DatabaseConnection>,
    config: Arc<ConnectionConfig>,
    hooks: Arc<Hooks>,
}

impl HookedConnection {
    /// Create a new hooked connection with the given configuration and no hooks.
    pub fn new(connection: DatabaseConnection, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(connection),
            config: Arc::new(config),
            hooks: Arc::new(Hooks::new()),
        }
    }

    /// Create a new hooked connection with default configuration and no hooks.
    pub fn wrap(connection: DatabaseConnection) -> Self {
        Self::new(connection, ConnectionConfig::default())
    }

    /// Register a hook. Hooks run in registration order.
    ///
    /// Clones made before this call keep their previous hook list.
    pub fn add_hook(&mut self, hook: impl QueryHook) -> &mut Self {
        Arc::make_mut(&mut self.hooks).push(Arc::new(hook));
        self
    }

    /// Builder form of [`add_hook`](Self::add_hook).
    pub fn with_hook(mut self, hook: impl QueryHook) -> Self {
        self.add_hook(hook);
        self
    }

    /// Bind an explicit context for the queries issued through the returned handle.
    pub fn with_context(&self, ctx: QueryContext) -> ContextualConnection<'_> {
        ContextualConnection {
            executor: Executor::Connection(&self.inner),
            pipeline: self.pipeline(),
            ctx,
        }
    }

    /// Begin a transaction whose statements run through the same hooks.
    ///
    /// The transaction keeps [`QueryContext::current()`] as its context.
    pub async fn begin(&self) -> Result<HookedTransaction, DbErr> {
        Ok(self.with_context(QueryContext::current()).begin().await?)
    }

    /// [`begin`](Self::begin) with an isolation level and access mode.
    pub async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<HookedTransaction, DbErr> {
        Ok(self
            .with_context(QueryContext::current())
            .begin_with_config(isolation_level, access_mode)
            .await?)
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    /// Get the connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The registered hooks.
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Consume the wrapper and return the inner `DatabaseConnection`.
    ///
    /// Fails and hands the wrapper back while clones of it are still alive.
    pub fn into_inner(self) -> Result<DatabaseConnection, Self> {
        let Self {
            inner,
            config,
            hooks,
        } = self;
        Arc::try_unwrap(inner).map_err(|inner| Self {
            inner,
            config,
            hooks,
        })
    }

    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            config: &self.config,
            hooks: &self.hooks,
            backend: self.inner.get_database_backend(),
        }
    }
}

impl From<DatabaseConnection> for HookedConnection {
    fn from(connection: DatabaseConnection) -> Self {
        Self::wrap(connection)
    }
}

impl AsRef<DatabaseConnection> for HookedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

/// The hooks and configuration shared by a connection and its transactions.
#[derive(Debug, Clone, Copy)]
struct Pipeline<'a> {
    config: &'a Arc<ConnectionConfig>,
    hooks: &'a Arc<Hooks>,
    backend: DbBackend,
}

impl Pipeline<'_> {
    /// Run one statement through the hooks.
    ///
    /// `dispatch` is only called if every `before_query` succeeded and the
    /// context was neither cancelled nor expired.
    async fn run<T, F, Fut>(
        self,
        ctx: &QueryContext,
        kind: QueryKind,
        stmt: &Statement,
        dispatch: F,
    ) -> Result<T, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let ctx = match self.config.default_timeout {
            Some(timeout) if ctx.deadline().is_none() => ctx.with_timeout(timeout),
            _ => ctx.clone(),
        };

        let event = QueryEvent::new(ctx, self.backend, kind, stmt);
        let event = self.hooks.before_query(event)?;
        let ctx = event.context();

        // Never dispatched, so nothing was timed
        let (result, elapsed) = match ctx.err() {
            Some(err) => (Err(err), Duration::ZERO),
            None => {
                if self.config.log_statements {
                    tracing::debug!(kind = %kind, sql = %stmt.sql, "Dispatching statement");
                } else {
                    tracing::debug!(kind = %kind, "Dispatching statement");
                }

                let span = ctx.span().unwrap_or_else(Span::none);
                let start = Instant::now();
                let result = ctx.run(dispatch().instrument(span)).await;
                (result, start.elapsed())
            }
        };

        if elapsed > self.config.slow_query_threshold {
            tracing::warn!(
                kind = %kind,
                duration_ms = millis(elapsed),
                threshold_ms = millis(self.config.slow_query_threshold),
                "Slow query detected"
            );
        }

        let event = event.finish(elapsed, result.as_ref().err());
        let hooked = self.hooks.after_query(&event);
        drop(event);

        match (result, hooked) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(source)) => Err(QueryError::Hook(source)),
            (Err(err), _) => {
                tracing::debug!(kind = %kind, error = %err, "Statement failed");
                Err(err)
            }
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// The SeaORM handle statements are dispatched on.
#[derive(Clone, Copy)]
enum Executor<'a> {
    Connection(&'a DatabaseConnection),
    Transaction(&'a DatabaseTransaction),
}

impl Executor<'_> {
    async fn execute(self, stmt: Statement) -> Result<ExecResult, DbErr> {
        match self {
            Executor::Connection(conn) => conn.execute(stmt).await,
            Executor::Transaction(txn) => txn.execute(stmt).await,
        }
    }

    async fn execute_unprepared(self, sql: &str) -> Result<ExecResult, DbErr> {
        match self {
            Executor::Connection(conn) => conn.execute_unprepared(sql).await,
            Executor::Transaction(txn) => txn.execute_unprepared(sql).await,
        }
    }

    async fn query_one(self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        match self {
            Executor::Connection(conn) => conn.query_one(stmt).await,
            Executor::Transaction(txn) => txn.query_one(stmt).await,
        }
    }

    async fn query_all(self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        match self {
            Executor::Connection(conn) => conn.query_all(stmt).await,
            Executor::Transaction(txn) => txn.query_all(stmt).await,
        }
    }

    /// Begin a transaction, or a savepoint inside an open one.
    async fn begin(
        self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, DbErr> {
        match self {
            Executor::Connection(conn) => conn.begin_with_config(isolation_level, access_mode).await,
            Executor::Transaction(txn) => txn.begin_with_config(isolation_level, access_mode).await,
        }
    }

    fn support_returning(self) -> bool {
        match self {
            Executor::Connection(conn) => conn.support_returning(),
            Executor::Transaction(txn) => txn.support_returning(),
        }
    }

    fn is_mock_connection(self) -> bool {
        match self {
            Executor::Connection(conn) => conn.is_mock_connection(),
            Executor::Transaction(txn) => txn.is_mock_connection(),
        }
    }
}

/// A [`HookedConnection`] or [`HookedTransaction`] bound to an explicit
/// [`QueryContext`].
///
/// The inherent methods return [`QueryError`] so callers can match on the
/// sentinel conditions; the `ConnectionTrait` implementation converts them to
/// `DbErr` for use with SeaORM entities.
#[derive(Clone)]
pub struct ContextualConnection<'a> {
    executor: Executor<'a>,
    pipeline: Pipeline<'a>,
    ctx: QueryContext,
}

impl ContextualConnection<'_> {
    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    /// Execute a statement that returns no rows.
    pub async fn exec(&self, stmt: Statement) -> Result<ExecResult, QueryError> {
        let executor = self.executor;
        let dispatched = stmt.clone();
        self.pipeline
            .run(&self.ctx, QueryKind::Execute, &stmt, move || async move {
                executor.execute(dispatched).await.map_err(QueryError::from)
            })
            .await
    }

    /// Execute raw SQL without preparing it.
    pub async fn exec_unprepared(&self, sql: &str) -> Result<ExecResult, QueryError> {
        let executor = self.executor;
        let stmt = Statement::from_string(self.pipeline.backend, sql);
        self.pipeline
            .run(&self.ctx, QueryKind::ExecuteUnprepared, &stmt, move || async move {
                executor.execute_unprepared(sql).await.map_err(QueryError::from)
            })
            .await
    }

    /// Fetch at most one row.
    pub async fn fetch_optional(&self, stmt: Statement) -> Result<Option<QueryResult>, QueryError> {
        let executor = self.executor;
        let dispatched = stmt.clone();
        self.pipeline
            .run(&self.ctx, QueryKind::QueryOne, &stmt, move || async move {
                executor.query_one(dispatched).await.map_err(QueryError::from)
            })
            .await
    }

    /// Fetch exactly one row, failing with [`QueryError::NotFound`] when there is none.
    pub async fn fetch_one(&self, stmt: Statement) -> Result<QueryResult, QueryError> {
        let executor = self.executor;
        let dispatched = stmt.clone();
        self.pipeline
            .run(&self.ctx, QueryKind::QueryOne, &stmt, move || async move {
                executor
                    .query_one(dispatched)
                    .await
                    .map_err(QueryError::from)
                    .and_then(|row| row.ok_or(QueryError::NotFound))
            })
            .await
    }

    /// Fetch every row.
    pub async fn fetch_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, QueryError> {
        let executor = self.executor;
        let dispatched = stmt.clone();
        self.pipeline
            .run(&self.ctx, QueryKind::QueryAll, &stmt, move || async move {
                executor.query_all(dispatched).await.map_err(QueryError::from)
            })
            .await
    }

    /// Begin a transaction, or a savepoint when this handle is already inside one.
    ///
    /// The transaction runs its statements through the same hooks, under this
    /// handle's context.
    pub async fn begin(&self) -> Result<HookedTransaction, QueryError> {
        self.begin_with_config(None, None).await
    }

    /// [`begin`](Self::begin) with an isolation level and access mode.
    pub async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<HookedTransaction, QueryError> {
        let inner = self.begin_unhooked(isolation_level, access_mode).await?;
        Ok(HookedTransaction {
            inner,
            config: self.pipeline.config.clone(),
            hooks: self.pipeline.hooks.clone(),
            ctx: self.ctx.clone(),
        })
    }

    /// Run `BEGIN` through the hooks and return the raw transaction.
    async fn begin_unhooked(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, QueryError> {
        let executor = self.executor;
        let stmt = Statement::from_string(self.pipeline.backend, "BEGIN");
        self.pipeline
            .run(&self.ctx, QueryKind::Begin, &stmt, move || async move {
                executor
                    .begin(isolation_level, access_mode)
                    .await
                    .map_err(QueryError::from)
            })
            .await
    }
}

impl fmt::Debug for ContextualConnection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextualConnection")
            .field("backend", &self.pipeline.backend)
            .field(
                "in_transaction",
                &matches!(self.executor, Executor::Transaction(_)),
            )
            .field("ctx", &self.ctx)
            .finish()
    }
}

#[async_trait]
impl ConnectionTrait for ContextualConnection<'_> {
    fn get_database_backend(&self) -> DbBackend {
        self.pipeline.backend
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        Ok(self.exec(stmt).await?)
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        Ok(self.exec_unprepared(sql).await?)
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        Ok(self.fetch_optional(stmt).await?)
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        Ok(self.fetch_all(stmt).await?)
    }

    fn support_returning(&self) -> bool {
        self.executor.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.executor.is_mock_connection()
    }
}

#[async_trait]
impl ConnectionTrait for HookedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        self.with_context(QueryContext::current()).execute(stmt).await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.with_context(QueryContext::current())
            .execute_unprepared(sql)
            .await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        self.with_context(QueryContext::current()).query_one(stmt).await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        self.with_context(QueryContext::current()).query_all(stmt).await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

/// Opening the stream runs through the hooks; `execute_time_ms` covers the
/// open only, not the rows consumed afterwards.
impl StreamTrait for HookedConnection {
    type Stream<'a> = <DatabaseConnection as StreamTrait>::Stream<'a>;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        let ctx = QueryContext::current();

        Box::pin(async move {
            let inner: &'a DatabaseConnection = &self.inner;
            let dispatched = stmt.clone();
            let stream = self
                .pipeline()
                .run(&ctx, QueryKind::Stream, &stmt, move || async move {
                    inner.stream(dispatched).await.map_err(QueryError::from)
                })
                .await?;
            Ok(stream)
        })
    }
}

/// SeaORM's transaction API.
///
/// `BEGIN`, `COMMIT` and `ROLLBACK` run through the hooks. The trait hands
/// out plain `DatabaseTransaction`s, so statements issued on them do not; use
/// [`HookedConnection::begin`] to hook those as well.
#[async_trait]
impl TransactionTrait for HookedConnection {
    async fn begin(&self) -> Result<DatabaseTransaction, DbErr> {
        Ok(self
            .with_context(QueryContext::current())
            .begin_unhooked(None, None)
            .await?)
    }

    async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, DbErr> {
        Ok(self
            .with_context(QueryContext::current())
            .begin_unhooked(isolation_level, access_mode)
            .await?)
    }

    async fn transaction<F, T, E>(&self, callback: F) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        self.transaction_with_config(callback, None, None).await
    }

    async fn transaction_with_config<F, T, E>(
        &self,
        callback: F,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        let txn = self
            .with_context(QueryContext::current())
            .begin_with_config(isolation_level, access_mode)
            .await
            .map_err(|err| TransactionError::Connection(err.into()))?;

        let outcome = callback(txn.inner()).await;
        match outcome {
            Ok(value) => {
                txn.commit().await.map_err(TransactionError::Connection)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = txn.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(TransactionError::Transaction(err))
            }
        }
    }
}

/// A transaction begun on a [`HookedConnection`].
///
/// Statements, the commit and the rollback run through the connection's hooks
/// under the context the transaction was begun with. Dropping the transaction
/// without committing rolls it back without notifying the hooks.
pub struct HookedTransaction {
    inner: DatabaseTransaction,
    config: Arc<ConnectionConfig>,
    hooks: Arc<Hooks>,
    ctx: QueryContext,
}

impl HookedTransaction {
    /// Bind a different context for the statements issued through the returned handle.
    pub fn with_context(&self, ctx: QueryContext) -> ContextualConnection<'_> {
        ContextualConnection {
            executor: Executor::Transaction(&self.inner),
            pipeline: self.pipeline(),
            ctx,
        }
    }

    /// The context the transaction was begun with.
    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    /// Get a reference to the underlying `DatabaseTransaction`.
    pub fn inner(&self) -> &DatabaseTransaction {
        &self.inner
    }

    /// Begin a nested transaction (a savepoint).
    pub async fn begin(&self) -> Result<HookedTransaction, DbErr> {
        Ok(self.with_context(self.ctx.clone()).begin().await?)
    }

    pub async fn commit(self) -> Result<(), DbErr> {
        Ok(self.end(QueryKind::Commit).await?)
    }

    pub async fn rollback(self) -> Result<(), DbErr> {
        Ok(self.end(QueryKind::Rollback).await?)
    }

    async fn end(self, kind: QueryKind) -> Result<(), QueryError> {
        let Self {
            inner,
            config,
            hooks,
            ctx,
        } = self;
        let pipeline = Pipeline {
            config: &config,
            hooks: &hooks,
            backend: inner.get_database_backend(),
        };

        let commit = kind == QueryKind::Commit;
        let sql = if commit { "COMMIT" } else { "ROLLBACK" };
        let stmt = Statement::from_string(pipeline.backend, sql);
        pipeline
            .run(&ctx, kind, &stmt, move || async move {
                let result = if commit {
                    inner.commit().await
                } else {
                    inner.rollback().await
                };
                result.map_err(QueryError::from)
            })
            .await
    }

    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            config: &self.config,
            hooks: &self.hooks,
            backend: self.inner.get_database_backend(),
        }
    }
}

impl fmt::Debug for HookedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedTransaction")
            .field("backend", &self.inner.get_database_backend())
            .field("hooks", &self.hooks)
            .field("ctx", &self.ctx)
            .finish()
    }
}

#[async_trait]
impl ConnectionTrait for HookedTransaction {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        self.with_context(self.ctx.clone()).execute(stmt).await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.with_context(self.ctx.clone())
            .execute_unprepared(sql)
            .await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        self.with_context(self.ctx.clone()).query_one(stmt).await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        self.with_context(self.ctx.clone()).query_all(stmt).await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

impl StreamTrait for HookedTransaction {
    type Stream<'a> = <DatabaseTransaction as StreamTrait>::Stream<'a>;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        Box::pin(async move {
            let inner: &'a DatabaseTransaction = &self.inner;
            let dispatched = stmt.clone();
            let stream = self
                .pipeline()
                .run(&self.ctx, QueryKind::Stream, &stmt, move || async move {
                    inner.stream(dispatched).await.map_err(QueryError::from)
                })
                .await?;
            Ok(stream)
        })
    }
}

/// Extension trait for wrapping a connection with the tracing hook in one call.
pub trait TracingExt {
    /// Wrap this connection and register [`TracingHook`].
    fn with_tracing(self) -> HookedConnection;

    /// Wrap this connection with custom configuration and register [`TracingHook`].
    fn with_tracing_config(self, config: ConnectionConfig) -> HookedConnection;
}

impl TracingExt for DatabaseConnection {
    fn with_tracing(self) -> HookedConnection {
        self.with_tracing_config(ConnectionConfig::default())
    }

    fn with_tracing_config(self, config: ConnectionConfig) -> HookedConnection {
        HookedConnection::new(self, config).with_hook(TracingHook)
    }
}
