//! Persistence layer for the Conveyor scheduler.
//!
//! Provides the store contract consumed by the scheduler (repository
//! traits plus the scheduling lease) and its PostgreSQL implementation.
//! Every multi-replica coordination point lives here, in atomic SQL;
//! the scheduler itself holds no locks.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;

use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Schema migrations, embedded at build time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connect a scheduler replica to the shared database and bring the
/// schema up to date before the first tick runs against it.
///
/// An in-flight scheduling attempt issues its store calls sequentially
/// but also keeps a lease-renewal task alive, so the pool budgets two
/// connections per concurrent attempt, plus one for the tick loop.
pub async fn connect(database_url: &str, concurrent_attempts: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(concurrent_attempts * 2 + 1)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
