//! Database migrations and initialization.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Initialize the SQLite database with schema and pragmas.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    // The checkpoint has a single writer; one connection keeps commits serialized.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| Box::pin(async move { configure_pragmas_conn(conn).await }))
        .connect(&format!("sqlite:{}?mode=rwc", db_path))
        .await?;

    run_migrations(&pool).await?;

    info!(path = db_path, "Checkpoint database initialized");
    Ok(pool)
}

/// Layout version recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Apply the schema and stamp its version.
///
/// Statements are idempotent. A database stamped by a newer build is refused
/// rather than written with a layout it does not expect.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let (found,): (i64,) = sqlx::query_as("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    if found > SCHEMA_VERSION {
        return Err(sqlx::Error::Protocol(format!(
            "checkpoint schema version {} is newer than supported version {}",
            found, SCHEMA_VERSION
        )));
    }

    let schema_sql = include_str!("schema.sql");
    for statement in schema_sql.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }

    if found < SCHEMA_VERSION {
        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(pool)
            .await?;
        info!(from = found, to = SCHEMA_VERSION, "Checkpoint schema migrated");
    }
    Ok(())
}

/// Configure SQLite pragmas for durability.
async fn configure_pragmas_conn(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    use sqlx::Row;

    // journal_mode returns the actual mode set; must use fetch to get result
    let row = sqlx::query("PRAGMA journal_mode = WAL")
        .fetch_one(&mut *conn)
        .await?;
    let journal_mode: String = row.get(0);
    info!(journal_mode = %journal_mode, "SQLite journal mode configured");

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&mut *conn)
        .await?;
    // A commit must survive power loss before the sink sees the fill.
    sqlx::query("PRAGMA synchronous = FULL")
        .execute(&mut *conn)
        .await?;

    Ok(())
}
