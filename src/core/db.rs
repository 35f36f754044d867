use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection as SqliteConnection;
use tokio_rusqlite::Connection;

const DB_FILE_NAME: &str = "busysync.sqlite";

/// Open (or create) the sqlite database that lives inside `db_dir`.
pub async fn async_db(db_dir: &str) -> Result<Connection, Error> {
    let path = format!("{}/{}", db_dir.trim_end_matches('/'), DB_FILE_NAME);
    let db = Connection::open(path).await?;
    db.call(|conn| {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    })
    .await?;
    Ok(db)
}

pub fn initialize_db(conn: &mut SqliteConnection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS calendar_account (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            refresh_token TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS calendar (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL REFERENCES calendar_account(id) ON DELETE CASCADE,
            provider_calendar_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sync_enabled INTEGER NOT NULL DEFAULT 1,
            polling_mode INTEGER NOT NULL DEFAULT 0,
            channel_id TEXT,
            sync_cursor TEXT,
            last_synced_at INTEGER,
            UNIQUE(account_id, provider_calendar_id)
        );

        CREATE TABLE IF NOT EXISTS event_correlation (
            correlation_id TEXT PRIMARY KEY,
            calendar_id INTEGER NOT NULL REFERENCES calendar(id) ON DELETE CASCADE,
            provider_event_id TEXT,
            kind TEXT NOT NULL,
            created_by_system INTEGER NOT NULL,
            source_correlation_id TEXT,
            lifecycle_state TEXT NOT NULL,
            title TEXT,
            starts_at TEXT,
            ends_at TEXT,
            created_at INTEGER NOT NULL,
            last_observed_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS event_correlation_provider_idx
            ON event_correlation(calendar_id, provider_event_id);
        CREATE INDEX IF NOT EXISTS event_correlation_source_idx
            ON event_correlation(source_correlation_id);
        CREATE INDEX IF NOT EXISTS event_correlation_state_idx
            ON event_correlation(lifecycle_state, created_at);

        CREATE TABLE IF NOT EXISTS push_subscription (
            channel_id TEXT PRIMARY KEY,
            calendar_id INTEGER NOT NULL REFERENCES calendar(id) ON DELETE CASCADE,
            resource_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            failure_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            suspended_reason TEXT,
            next_attempt_at INTEGER,
            last_message_number INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS push_subscription_calendar_idx
            ON push_subscription(calendar_id, status);

        CREATE TABLE IF NOT EXISTS calendar_lock (
            calendar_id INTEGER PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        "#,
    )
}

/// Additive migrations for databases created by older builds.
pub fn migrate_db(conn: &mut SqliteConnection) -> Result<(), rusqlite::Error> {
    initialize_db(conn)?;

    let has_polling_mode: bool = conn
        .prepare("SELECT COUNT(*) FROM pragma_table_info('calendar') WHERE name = 'polling_mode'")?
        .query_row([], |row| row.get::<_, i64>(0))
        .map(|count| count > 0)?;
    if !has_polling_mode {
        conn.execute(
            "ALTER TABLE calendar ADD COLUMN polling_mode INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    Ok(())
}

/// Store an enum as its `as_str` text and parse it back with `FromStr`.
macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| rusqlite::types::FromSqlError::Other(e.into()))
            }
        }
    };
}
pub(crate) use sql_text_enum;

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
