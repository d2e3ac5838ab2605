//! Basic example showing how to use sea-orm-query-hooks.
//!
//! Runs against SeaORM's mock backend, so no database is needed.
//!
//! Run with: cargo run --example basic

use std::collections::BTreeMap;
use std::time::Duration;

use sea_orm::{ConnectionTrait, DbBackend, MockDatabase, MockExecResult, Statement, Value};
use sea_orm_query_hooks::prelude::*;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Span fields are printed when each span closes
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sea_orm_query_hooks=debug".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE),
        )
        .init();

    let row = BTreeMap::from([("id", Value::Int(Some(1))), ("name", Value::from("alice"))]);
    let db = MockDatabase::new(DbBackend::Postgres)
        .append_query_results([vec![row], vec![]])
        .append_exec_results([MockExecResult {
            last_insert_id: 0,
            rows_affected: 1,
        }])
        .into_connection();

    // Option 1: one call wraps the connection and registers the tracing hook
    let db = db.with_tracing_config(ConnectionConfig::development());

    // Option 2: register hooks explicitly
    // let db = HookedConnection::from(db).with_hook(TracingHook);

    let stmt = Statement::from_sql_and_values(
        DbBackend::Postgres,
        r#"SELECT "id", "name" FROM "users" WHERE "id" = $1"#,
        [1.into()],
    );

    // Through ConnectionTrait: spans nest under the current span
    let request = tracing::info_span!("http.request", http.route = "/users/:id");
    let user = db.query_one(stmt.clone()).instrument(request).await?;
    tracing::info!(found = user.is_some(), "Looked up user");

    // With an explicit context: sentinel errors show up on the span status
    let ctx = QueryContext::current().with_timeout(Duration::from_secs(1));
    match db.with_context(ctx).fetch_one(stmt).await {
        Err(QueryError::NotFound) => tracing::info!("Second lookup found nothing"),
        Err(err) => return Err(err.into()),
        Ok(_) => tracing::info!("Second lookup found a row"),
    }

    // BEGIN, the update and COMMIT each get a span
    let txn = db.begin().await?;
    let update = Statement::from_sql_and_values(
        DbBackend::Postgres,
        r#"UPDATE "users" SET "name" = $1 WHERE "id" = $2"#,
        ["bob".into(), 1.into()],
    );
    txn.execute(update).await?;
    txn.commit().await?;

    Ok(())
}
