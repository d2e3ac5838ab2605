//! # sea-orm-query-hooks
//!
//! Pre/post execution hooks for SeaORM, with an OpenTelemetry-compatible
//! tracing hook that wraps every SQL operation in a client span.
//!
//! Every statement run through a [`HookedConnection`] goes through the same
//! lifecycle: each registered [`QueryHook`] sees it before dispatch, may
//! extend the [`QueryContext`] it runs under, and sees it again once it has
//! completed, failed or been aborted.
//!
//! ## Features
//!
//! - **Query hooks**: register any number of [`QueryHook`]s on a connection
//! - **Tracing**: [`TracingHook`] records the statement, its arguments, the
//!   execution time and a status code on a span per query
//! - **Explicit context**: deadlines, cancellation and parent spans travel
//!   with each query in a [`QueryContext`]
//! - **Drop-in**: [`HookedConnection`] implements `ConnectionTrait`,
//!   `StreamTrait` and `TransactionTrait`, so SeaORM entities work unchanged
//! - **Transactions**: statements inside a [`HookedTransaction`] run through
//!   the same hooks, as do `BEGIN`, `COMMIT` and `ROLLBACK`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sea_orm::Database;
//! use sea_orm_query_hooks::TracingExt;
//!
//! // Wrap your existing connection and register the tracing hook
//! let db = Database::connect("postgres://localhost/mydb").await?;
//! let db = db.with_tracing();
//!
//! // Use it exactly like a normal DatabaseConnection
//! let users = Users::find().all(&db).await?;
//! ```
//!
//! ## Explicit context
//!
//! ```rust,ignore
//! use sea_orm_query_hooks::QueryContext;
//!
//! let ctx = QueryContext::current()
//!     .with_timeout(Duration::from_millis(250))
//!     .with_cancellation(shutdown.child_token());
//!
//! match db.with_context(ctx).fetch_one(stmt).await {
//!     Err(QueryError::NotFound) => { /* ... */ }
//!     other => { /* ... */ }
//! }
//! ```
//!
//! ## Span status
//!
//! | Outcome | `status.code` |
//! |---------|---------------|
//! | success | `OK` |
//! | [`QueryError::NotFound`] or `DbErr::RecordNotFound` | `NOT_FOUND` |
//! | [`QueryError::Cancelled`] | `CANCELLED` |
//! | [`QueryError::DeadlineExceeded`] | `DEADLINE_EXCEEDED` |
//! | any other error | `UNKNOWN` |

mod config;
mod connection;
mod context;
mod error;
mod hook;
pub mod parser;
mod tracing_hook;

#[cfg(test)]
mod test_support;

pub use config::ConnectionConfig;
pub use connection::{ContextualConnection, HookedConnection, HookedTransaction, TracingExt};
pub use context::QueryContext;
pub use error::{HookError, QueryError};
pub use hook::{Hooks, QueryEvent, QueryHook, QueryKind};
pub use tracing_hook::{FormattedStatement, StatusCode, TracingHook};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ConnectionConfig, HookedConnection, HookedTransaction, QueryContext, QueryError,
        QueryHook, TracingExt, TracingHook,
    };
}
