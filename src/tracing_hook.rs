//! Hook that wraps every query in a `tracing` span.

use std::fmt;
use std::sync::Arc;

use sea_orm::{DbBackend, DbErr, Statement, Value};
use tracing::{field, Span};

use crate::context::{QueryContext, SpanSlot};
use crate::error::{HookError, QueryError};
use crate::hook::{QueryEvent, QueryHook};
use crate::parser::ParsedSql;

/// Outcome of a query as recorded in the span's `status.code` field.
///
/// The numeric codes are the canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    DeadlineExceeded,
    NotFound,
}

impl StatusCode {
    /// Classify the outcome of a query.
    pub fn classify(error: Option<&QueryError>) -> Self {
        match error {
            None => StatusCode::Ok,
            Some(QueryError::NotFound | QueryError::Db(DbErr::RecordNotFound(_))) => {
                StatusCode::NotFound
            }
            Some(QueryError::Cancelled) => StatusCode::Cancelled,
            Some(QueryError::DeadlineExceeded) => StatusCode::DeadlineExceeded,
            Some(_) => StatusCode::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
        }
    }

    /// The numeric code, recorded as `status.code_num`.
    pub fn code(&self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::Unknown => 2,
            StatusCode::DeadlineExceeded => 4,
            StatusCode::NotFound => 5,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates a client span for every query and closes it when the query ends.
///
/// The span is a child of the context's ambient span (or of the current span
/// when the context has none) and records:
///
/// | Field | Description |
/// |-------|-------------|
/// | `otel.name` | Operation category, e.g. `SELECT users` |
/// | `otel.kind` | Always `client` |
/// | `sql` | Statement text followed by its arguments, e.g. `SELECT $1 [5]` |
/// | `db.system` | `postgresql`, `mysql` or `sqlite` |
/// | `db.operation` | `SELECT`, `INSERT`, ... |
/// | `db.sql.table` | Target table name (when detectable) |
/// | `execute_time_ms` | Execution time in whole milliseconds (when non-zero) |
/// | `status.code` | See [`StatusCode`] |
/// | `status.code_num` | Numeric form of `status.code` |
/// | `otel.status_code` | `OK` or `ERROR` |
/// | `otel.status_message` | The error text (on failure) |
///
/// The hook is stateless and never fails.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm::Database;
/// use sea_orm_query_hooks::{HookedConnection, TracingHook};
///
/// let db = Database::connect("postgres://localhost/mydb").await?;
/// let db = HookedConnection::from(db).with_hook(TracingHook);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHook;

/// The slot owning the span this hook started for a query.
struct QuerySpan(Arc<SpanSlot>);

macro_rules! query_span {
    ($($parent:tt)*) => {
        tracing::info_span!(
            $($parent)*
            "db.query",
            otel.name = field::Empty,
            otel.kind = "client",
            sql = field::Empty,
            db.system = field::Empty,
            db.operation = field::Empty,
            db.sql.table = field::Empty,
            execute_time_ms = field::Empty,
            status.code = field::Empty,
            status.code_num = field::Empty,
            otel.status_code = field::Empty,
            otel.status_message = field::Empty,
        )
    };
}

impl TracingHook {
    fn create_span(parent: Option<&Span>) -> Span {
        match parent {
            Some(parent) => query_span!(parent: parent,),
            None => query_span!(),
        }
    }
}

impl QueryHook for TracingHook {
    fn before_query(&self, event: &QueryEvent<'_>) -> Result<QueryContext, HookError> {
        let ctx = event.context();
        let span = Self::create_span(ctx.span().as_ref());
        if span.is_disabled() {
            return Ok(ctx.clone());
        }

        let parsed = ParsedSql::parse(event.sql());
        span.record("otel.name", parsed.span_name().as_str());
        span.record("db.system", db_system(event.backend()));
        span.record("db.operation", parsed.operation.as_str());
        if let Some(table) = &parsed.table {
            span.record("db.sql.table", table.as_str());
        }
        span.record("sql", field::display(FormattedStatement(event.statement())));

        // The slot holds the only handle, so taking it ends the span.
        let (ctx, slot) = ctx.with_span_slot(span);
        Ok(ctx.with_value(QuerySpan(slot)))
    }

    fn after_query(&self, event: &QueryEvent<'_>) -> Result<(), HookError> {
        let Some(span) = event.context().get::<QuerySpan>().and_then(|slot| slot.0.take()) else {
            return Ok(());
        };

        let error = event.error();
        let status = StatusCode::classify(error);
        span.record("status.code", status.as_str());
        span.record("status.code_num", i64::from(status.code()));
        match error {
            None => {
                span.record("otel.status_code", "OK");
            }
            Some(err) => {
                span.record("otel.status_code", "ERROR");
                span.record("otel.status_message", field::display(err));
            }
        }

        let execute_time = event.execute_time();
        if !execute_time.is_zero() {
            span.record(
                "execute_time_ms",
                i64::try_from(execute_time.as_millis()).unwrap_or(i64::MAX),
            );
        }

        drop(span);
        Ok(())
    }
}

fn db_system(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::Postgres => "postgresql",
        DbBackend::MySql => "mysql",
        DbBackend::Sqlite => "sqlite",
    }
}

/// Renders a statement as its SQL text followed by its arguments: `SELECT $1 [5 alice]`.
pub struct FormattedStatement<'a>(pub &'a Statement);

impl fmt::Display for FormattedStatement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.0.sql)?;
        if let Some(values) = &self.0.values {
            for (i, value) in values.0.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write_value(f, value)?;
            }
        }
        f.write_str("]")
    }
}

macro_rules! display_or_null {
    ($f:expr, $value:expr) => {
        match $value {
            Some(v) => write!($f, "{}", v),
            None => $f.write_str("NULL"),
        }
    };
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Bool(v) => display_or_null!(f, v),
        Value::TinyInt(v) => display_or_null!(f, v),
        Value::SmallInt(v) => display_or_null!(f, v),
        Value::Int(v) => display_or_null!(f, v),
        Value::BigInt(v) => display_or_null!(f, v),
        Value::TinyUnsigned(v) => display_or_null!(f, v),
        Value::SmallUnsigned(v) => display_or_null!(f, v),
        Value::Unsigned(v) => display_or_null!(f, v),
        Value::BigUnsigned(v) => display_or_null!(f, v),
        Value::Float(v) => display_or_null!(f, v),
        Value::Double(v) => display_or_null!(f, v),
        Value::String(v) => display_or_null!(f, v),
        Value::Char(v) => display_or_null!(f, v),
        Value::Bytes(Some(v)) => write!(f, "{:?}", v),
        Value::Bytes(None) => f.write_str("NULL"),
        #[allow(unreachable_patterns)]
        other => write!(f, "{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::hook::QueryKind;
    use crate::test_support::SpanRecorder;

    fn select_one() -> Statement {
        Statement::from_string(DbBackend::Postgres, "SELECT 1")
    }

    fn run_hook(ctx: QueryContext, stmt: &Statement, execute_time: Duration, error: Option<&QueryError>) {
        let event = QueryEvent::new(ctx, DbBackend::Postgres, QueryKind::QueryAll, stmt);
        let ctx = TracingHook.before_query(&event).unwrap();
        let event = QueryEvent::new(ctx, DbBackend::Postgres, QueryKind::QueryAll, stmt)
            .finish(execute_time, error);
        TracingHook.after_query(&event).unwrap();
    }

    #[test]
    fn test_classify() {
        assert_eq!(StatusCode::classify(None), StatusCode::Ok);
        assert_eq!(StatusCode::classify(Some(&QueryError::NotFound)), StatusCode::NotFound);
        assert_eq!(
            StatusCode::classify(Some(&QueryError::Db(DbErr::RecordNotFound("cake".to_string())))),
            StatusCode::NotFound
        );
        assert_eq!(StatusCode::classify(Some(&QueryError::Cancelled)), StatusCode::Cancelled);
        assert_eq!(
            StatusCode::classify(Some(&QueryError::DeadlineExceeded)),
            StatusCode::DeadlineExceeded
        );
        assert_eq!(
            StatusCode::classify(Some(&QueryError::Db(DbErr::Custom("boom".to_string())))),
            StatusCode::Unknown
        );
        assert_eq!(
            StatusCode::classify(Some(&QueryError::Hook("nope".into()))),
            StatusCode::Unknown
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::Ok.code(), 0);
        assert_eq!(StatusCode::Cancelled.code(), 1);
        assert_eq!(StatusCode::Unknown.code(), 2);
        assert_eq!(StatusCode::DeadlineExceeded.code(), 4);
        assert_eq!(StatusCode::NotFound.code(), 5);
    }

    #[test]
    fn test_formatted_statement() {
        assert_eq!(FormattedStatement(&select_one()).to_string(), "SELECT 1 []");

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM users WHERE id = $1 AND name = $2 AND deleted_at = $3",
            [5.into(), "alice".into(), Value::String(None)],
        );
        assert_eq!(
            FormattedStatement(&stmt).to_string(),
            "SELECT * FROM users WHERE id = $1 AND name = $2 AND deleted_at = $3 [5 alice NULL]"
        );
    }

    #[test]
    fn test_successful_query_span() {
        let (recorder, _guard) = SpanRecorder::install();

        run_hook(QueryContext::background(), &select_one(), Duration::from_millis(5), None);

        let spans = recorder.spans();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "db.query");
        assert_eq!(span.field("sql"), Some("SELECT 1 []"));
        assert_eq!(span.field("otel.kind"), Some("client"));
        assert_eq!(span.field("otel.name"), Some("SELECT"));
        assert_eq!(span.field("db.system"), Some("postgresql"));
        assert_eq!(span.field("status.code"), Some("OK"));
        assert_eq!(span.field("otel.status_code"), Some("OK"));
        assert_eq!(span.field("otel.status_message"), None);
        assert_eq!(span.field("execute_time_ms"), Some("5"));
        assert_eq!(span.field("status.code_num"), Some("0"));
        assert_eq!(span.closed, 1);
    }

    #[test]
    fn test_not_found_span_without_duration() {
        let (recorder, _guard) = SpanRecorder::install();

        let err = QueryError::NotFound;
        run_hook(QueryContext::background(), &select_one(), Duration::ZERO, Some(&err));

        let spans = recorder.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].field("status.code"), Some("NOT_FOUND"));
        assert_eq!(spans[0].field("otel.status_code"), Some("ERROR"));
        assert_eq!(spans[0].field("otel.status_message"), Some("no rows in result set"));
        assert_eq!(spans[0].field("execute_time_ms"), None);
        assert_eq!(spans[0].closed, 1);
    }

    #[test]
    fn test_error_statuses_carry_message() {
        let (recorder, _guard) = SpanRecorder::install();

        let errors = [
            (QueryError::Cancelled, "CANCELLED"),
            (QueryError::DeadlineExceeded, "DEADLINE_EXCEEDED"),
            (QueryError::Db(DbErr::Custom("relation does not exist".to_string())), "UNKNOWN"),
        ];
        for (err, _) in &errors {
            run_hook(QueryContext::background(), &select_one(), Duration::from_millis(1), Some(err));
        }

        let spans = recorder.spans();
        assert_eq!(spans.len(), errors.len());
        for (span, (err, code)) in spans.iter().zip(&errors) {
            assert_eq!(span.field("status.code"), Some(*code));
            assert_eq!(
                span.field("status.code_num"),
                Some(StatusCode::classify(Some(err)).code().to_string().as_str())
            );
            assert_eq!(span.field("otel.status_message"), Some(err.to_string().as_str()));
        }
    }

    #[test]
    fn test_span_is_child_of_ambient_span() {
        let (recorder, _guard) = SpanRecorder::install();

        let request = tracing::info_span!("http.request");
        run_hook(
            QueryContext::background().with_span(request.clone()),
            &select_one(),
            Duration::ZERO,
            None,
        );

        let spans = recorder.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].name, "db.query");
        assert_eq!(spans[1].parent, Some(0));
        assert_eq!(spans[0].closed, 0);
    }

    #[test]
    fn test_after_query_without_span_is_noop() {
        let (recorder, _guard) = SpanRecorder::install();

        let stmt = select_one();
        let event = QueryEvent::new(QueryContext::background(), DbBackend::Postgres, QueryKind::Execute, &stmt)
            .finish(Duration::from_millis(2), None);
        assert!(TracingHook.after_query(&event).is_ok());
        assert!(recorder.spans().is_empty());
    }

    #[test]
    fn test_span_ends_exactly_once() {
        let (recorder, _guard) = SpanRecorder::install();

        let stmt = select_one();
        let err = QueryError::Cancelled;
        let event = QueryEvent::new(QueryContext::background(), DbBackend::Postgres, QueryKind::Execute, &stmt);
        let ctx = TracingHook.before_query(&event).unwrap();
        drop(event);

        let finished = QueryEvent::new(ctx, DbBackend::Postgres, QueryKind::Execute, &stmt)
            .finish(Duration::from_millis(2), None);
        assert!(TracingHook.after_query(&finished).is_ok());

        let again = finished.finish(Duration::from_millis(9), Some(&err));
        assert!(TracingHook.after_query(&again).is_ok());
        drop(again);

        let spans = recorder.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].closed, 1);
        assert_eq!(spans[0].field("status.code"), Some("OK"));
        assert_eq!(spans[0].field("execute_time_ms"), Some("2"));
    }

    #[test]
    fn test_span_closes_when_after_query_returns() {
        let (recorder, _guard) = SpanRecorder::install();

        let request = tracing::info_span!("http.request");
        let stmt = select_one();
        let event = QueryEvent::new(
            QueryContext::background().with_span(request),
            DbBackend::Postgres,
            QueryKind::QueryOne,
            &stmt,
        );
        let ctx = TracingHook.before_query(&event).unwrap();
        assert_eq!(ctx.span().and_then(|s| s.metadata()).map(|m| m.name()), Some("db.query"));

        let finished = QueryEvent::new(ctx, DbBackend::Postgres, QueryKind::QueryOne, &stmt)
            .finish(Duration::from_millis(3), None);
        TracingHook.after_query(&finished).unwrap();

        // The event and its context are still alive here
        assert_eq!(recorder.named("db.query")[0].closed, 1);
        assert_eq!(
            finished.context().span().and_then(|s| s.metadata()).map(|m| m.name()),
            Some("http.request")
        );
    }

    #[test]
    fn test_large_duration_saturates() {
        let (recorder, _guard) = SpanRecorder::install();

        run_hook(QueryContext::background(), &select_one(), Duration::MAX, None);

        let spans = recorder.spans();
        assert_eq!(spans[0].field("execute_time_ms"), Some(i64::MAX.to_string().as_str()));
    }

    #[test]
    fn test_disabled_tracing_leaves_context_untouched() {
        let stmt = select_one();
        let event = QueryEvent::new(QueryContext::background(), DbBackend::Postgres, QueryKind::Execute, &stmt);
        let ctx = tracing::subscriber::with_default(tracing::subscriber::NoSubscriber::default(), || {
            TracingHook.before_query(&event).unwrap()
        });
        assert!(ctx.get::<QuerySpan>().is_none());
        assert!(ctx.span().is_none());
    }
}
