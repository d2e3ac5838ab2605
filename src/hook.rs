//! Pre/post execution hooks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::{DbBackend, Statement};

use crate::context::QueryContext;
use crate::error::{HookError, QueryError};

/// Callbacks invoked around every operation of a
/// [`HookedConnection`](crate::HookedConnection).
///
/// For each operation the connection calls [`before_query`](Self::before_query)
/// exactly once before dispatching the statement, then
/// [`after_query`](Self::after_query) exactly once with the context that
/// `before_query` returned. Both run synchronously on the task issuing the
/// query.
///
/// # Example
///
/// ```rust
/// use sea_orm_query_hooks::{HookError, QueryContext, QueryEvent, QueryHook};
///
/// /// Refuses writes.
/// struct ReadOnly;
///
/// impl QueryHook for ReadOnly {
///     fn before_query(&self, event: &QueryEvent<'_>) -> Result<QueryContext, HookError> {
///         if event.sql().trim_start().to_uppercase().starts_with("SELECT") {
///             Ok(event.context().clone())
///         } else {
///             Err("connection is read-only".into())
///         }
///     }
///
///     fn after_query(&self, _event: &QueryEvent<'_>) -> Result<(), HookError> {
///         Ok(())
///     }
/// }
/// ```
pub trait QueryHook: Send + Sync + 'static {
    /// Called before the statement is dispatched.
    ///
    /// The returned context replaces the event's context for the rest of the
    /// operation. Returning an error aborts the operation.
    fn before_query(&self, event: &QueryEvent<'_>) -> Result<QueryContext, HookError>;

    /// Called once the statement has completed, failed, or been aborted.
    fn after_query(&self, event: &QueryEvent<'_>) -> Result<(), HookError>;
}

/// Kind of connection operation being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Execute,
    ExecuteUnprepared,
    QueryOne,
    QueryAll,
    /// Opening a row stream. The stream itself is consumed after the hooks ran.
    Stream,
    Begin,
    Commit,
    Rollback,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Execute => "execute",
            QueryKind::ExecuteUnprepared => "execute_unprepared",
            QueryKind::QueryOne => "query_one",
            QueryKind::QueryAll => "query_all",
            QueryKind::Stream => "stream",
            QueryKind::Begin => "begin",
            QueryKind::Commit => "commit",
            QueryKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a single operation, handed to hooks.
///
/// Before execution the duration is zero and there is no error.
#[derive(Debug, Clone)]
pub struct QueryEvent<'a> {
    context: QueryContext,
    backend: DbBackend,
    kind: QueryKind,
    statement: &'a Statement,
    execute_time: Duration,
    error: Option<&'a QueryError>,
}

impl<'a> QueryEvent<'a> {
    /// An event for an operation that has not run yet.
    pub fn new(
        context: QueryContext,
        backend: DbBackend,
        kind: QueryKind,
        statement: &'a Statement,
    ) -> Self {
        Self {
            context,
            backend,
            kind,
            statement,
            execute_time: Duration::ZERO,
            error: None,
        }
    }

    /// Complete the event with the measured duration and outcome.
    pub fn finish(self, execute_time: Duration, error: Option<&'a QueryError>) -> Self {
        Self {
            execute_time,
            error,
            ..self
        }
    }

    pub fn context(&self) -> &QueryContext {
        &self.context
    }

    pub fn backend(&self) -> DbBackend {
        self.backend
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn statement(&self) -> &'a Statement {
        self.statement
    }

    /// The SQL text of the statement.
    pub fn sql(&self) -> &'a str {
        &self.statement.sql
    }

    /// Time spent executing the statement; zero before execution or when the
    /// statement was never dispatched.
    pub fn execute_time(&self) -> Duration {
        self.execute_time
    }

    /// The error the operation failed with, if any.
    pub fn error(&self) -> Option<&'a QueryError> {
        self.error
    }

    fn set_context(&mut self, context: QueryContext) {
        self.context = context;
    }
}

/// Ordered list of hooks registered on a connection.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Arc<dyn QueryHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn QueryHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every `before_query` in order, threading the returned context.
    ///
    /// When a hook fails, the hooks that already ran see their `after_query`
    /// with the hook error, so whatever they started is closed.
    pub(crate) fn before_query<'a>(
        &self,
        mut event: QueryEvent<'a>,
    ) -> Result<QueryEvent<'a>, QueryError> {
        for (index, hook) in self.hooks.iter().enumerate() {
            match hook.before_query(&event) {
                Ok(context) => event.set_context(context),
                Err(source) => {
                    let err = QueryError::Hook(source);
                    let aborted = event.finish(Duration::ZERO, Some(&err));
                    self.notify(&self.hooks[..index], &aborted);
                    drop(aborted);
                    return Err(err);
                }
            }
        }
        Ok(event)
    }

    /// Run every `after_query` in order.
    ///
    /// All hooks run even if one fails; the first failure is returned.
    pub(crate) fn after_query(&self, event: &QueryEvent<'_>) -> Result<(), HookError> {
        let mut first_error = None;
        for hook in &self.hooks {
            if let Err(err) = hook.after_query(event) {
                tracing::warn!(
                    kind = %event.kind(),
                    error = %err,
                    "Query hook failed after execution"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn notify(&self, hooks: &[Arc<dyn QueryHook>], event: &QueryEvent<'_>) {
        for hook in hooks {
            if let Err(err) = hook.after_query(event) {
                tracing::warn!(
                    kind = %event.kind(),
                    error = %err,
                    "Query hook failed while unwinding an aborted query"
                );
            }
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").field("len", &self.hooks.len()).finish()
    }
}
