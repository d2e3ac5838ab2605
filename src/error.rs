//! Errors produced by hooked database operations.

use sea_orm::DbErr;
use thiserror::Error;

/// Error returned by a [`QueryHook`](crate::QueryHook) callback.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error of a database operation run through a [`HookedConnection`](crate::HookedConnection).
///
/// The first three variants are sentinels: they are compared by variant, not
/// by message, when classifying the outcome of a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The query was expected to return a row but returned none
    #[error("no rows in result set")]
    NotFound,

    /// The query context was cancelled before the query completed
    #[error("context canceled")]
    Cancelled,

    /// The query context deadline passed before the query completed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// An error which came from the database itself
    #[error(transparent)]
    Db(#[from] DbErr),

    /// A registered hook refused to run the query
    #[error("query hook failed: {0}")]
    Hook(#[source] HookError),
}

impl QueryError {
    /// Whether this error means "no such row", either from this crate or from SeaORM.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound | Self::Db(DbErr::RecordNotFound(_)))
    }
}

impl From<QueryError> for DbErr {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Db(e) => e,
            QueryError::NotFound => DbErr::RecordNotFound(QueryError::NotFound.to_string()),
            other => DbErr::Custom(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(QueryError::NotFound.is_not_found());
        assert!(QueryError::Db(DbErr::RecordNotFound("user".to_string())).is_not_found());
        assert!(!QueryError::Cancelled.is_not_found());
        assert!(!QueryError::Db(DbErr::Custom("boom".to_string())).is_not_found());
    }

    #[test]
    fn test_into_db_err() {
        let err: DbErr = QueryError::NotFound.into();
        assert!(matches!(err, DbErr::RecordNotFound(msg) if msg == "no rows in result set"));

        let err: DbErr = QueryError::DeadlineExceeded.into();
        assert!(matches!(err, DbErr::Custom(msg) if msg == "context deadline exceeded"));

        let err: DbErr = QueryError::Db(DbErr::Custom("boom".to_string())).into();
        assert!(matches!(err, DbErr::Custom(msg) if msg == "boom"));
    }

    #[test]
    fn test_hook_error_message() {
        let err = QueryError::Hook("read-only replica".into());
        assert_eq!(err.to_string(), "query hook failed: read-only replica");
    }
}
