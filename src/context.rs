//! Per-operation context threaded through hooks and query execution.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::{pending, Future};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::error::QueryError;

type ValueMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// An immutable key/value carrier passed explicitly through a query.
///
/// Values are keyed by their type. Adding a value returns a new context and
/// leaves the original untouched, so a context can be shared freely between
/// the caller, the hooks and the running query.
///
/// Besides arbitrary values, a context carries the ambient [`Span`] that new
/// query spans are parented to, an optional deadline and an optional
/// cancellation token.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use sea_orm_query_hooks::QueryContext;
///
/// #[derive(Debug, PartialEq)]
/// struct RequestId(u64);
///
/// let ctx = QueryContext::background()
///     .with_value(RequestId(42))
///     .with_timeout(Duration::from_secs(5));
///
/// assert_eq!(ctx.get::<RequestId>(), Some(&RequestId(42)));
/// assert!(ctx.deadline().is_some());
/// ```
#[derive(Clone, Default)]
pub struct QueryContext {
    values: Arc<ValueMap>,
    span: Option<Arc<SpanSlot>>,
    deadline: Option<Instant>,
    cancellation: Option<CancellationToken>,
}

/// Holds an ambient span until it is taken.
///
/// Once taken, the span of the context the slot was derived from becomes
/// ambient again.
pub(crate) struct SpanSlot {
    span: Mutex<Option<Span>>,
    outer: Option<Arc<SpanSlot>>,
}

impl SpanSlot {
    fn span(&self) -> Option<Span> {
        let held = self.span.lock().unwrap_or_else(PoisonError::into_inner).clone();
        held.or_else(|| self.outer.as_ref().and_then(|outer| outer.span()))
    }

    /// Take the span out of the slot; only the first call gets it.
    pub(crate) fn take(&self) -> Option<Span> {
        self.span.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl QueryContext {
    /// An empty context: no values, no span, no deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context whose ambient span is the current `tracing` span.
    ///
    /// Used when a query is issued without an explicit context, e.g. through
    /// [`ConnectionTrait`](sea_orm::ConnectionTrait).
    pub fn current() -> Self {
        Self::background().with_span(Span::current())
    }

    /// Return a new context with `value` stored under its type.
    ///
    /// A previous value of the same type is shadowed in the new context only.
    pub fn with_value<T>(&self, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    /// Look up the value stored under type `T`.
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| (**value).downcast_ref::<T>())
    }

    /// Return a new context whose ambient span is `span`.
    ///
    /// Disabled spans are not stored, so a context built while no subscriber
    /// is interested carries no span at all.
    pub fn with_span(&self, span: Span) -> Self {
        if span.is_disabled() {
            return self.clone();
        }
        self.with_span_slot(span).0
    }

    /// Like [`with_span`](Self::with_span), also returning the slot that owns
    /// the span so the caller can end it with [`SpanSlot::take`].
    ///
    /// The returned context holds no other handle to `span`.
    pub(crate) fn with_span_slot(&self, span: Span) -> (Self, Arc<SpanSlot>) {
        let slot = Arc::new(SpanSlot {
            span: Mutex::new(Some(span)),
            outer: self.span.clone(),
        });
        let ctx = Self {
            span: Some(slot.clone()),
            ..self.clone()
        };
        (ctx, slot)
    }

    /// The ambient span, if any.
    pub fn span(&self) -> Option<Span> {
        self.span.as_ref().and_then(|slot| slot.span())
    }

    /// Return a new context that expires at `deadline`.
    ///
    /// An earlier existing deadline wins. Queries race the deadline on Tokio's
    /// timer, so the runtime driving them must have the time driver enabled
    /// (`Builder::enable_time`, or `enable_all`).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        ctx
    }

    /// Return a new context that expires `timeout` from now.
    ///
    /// Requires a Tokio runtime with the time driver enabled, see
    /// [`with_deadline`](Self::with_deadline).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The deadline after which queries under this context fail.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Return a new context that is cancelled when `token` is.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut ctx = self.clone();
        ctx.cancellation = Some(token);
        ctx
    }

    /// Whether the context's cancellation token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// The error a query under this context would fail with right now.
    ///
    /// Cancellation takes precedence over an expired deadline.
    pub fn err(&self) -> Option<QueryError> {
        if self.is_cancelled() {
            Some(QueryError::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(QueryError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    pub(crate) async fn run<T, F>(&self, fut: F) -> Result<T, QueryError>
    where
        F: Future<Output = Result<T, QueryError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let cancelled = async {
            match &self.cancellation {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = fut => result,
            () = cancelled => Err(QueryError::Cancelled),
            () = expired => Err(QueryError::DeadlineExceeded),
        }
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("values", &self.values.len())
            .field("span", &self.span())
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
