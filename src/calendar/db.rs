use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tokio_rusqlite::Connection;

use super::{Calendar, CalendarAccount};
use crate::core::db::{from_millis, now_millis, to_millis};

const CALENDAR_COLUMNS: &str = "c.id, c.account_id, c.provider_calendar_id, c.name, \
    c.sync_enabled, c.polling_mode, c.channel_id, c.sync_cursor, c.last_synced_at";

fn row_to_calendar(row: &Row) -> rusqlite::Result<Calendar> {
    Ok(Calendar {
        id: row.get(0)?,
        account_id: row.get(1)?,
        provider_calendar_id: row.get(2)?,
        name: row.get(3)?,
        sync_enabled: row.get(4)?,
        polling_mode: row.get(5)?,
        channel_id: row.get(6)?,
        sync_cursor: row.get(7)?,
        last_synced_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
    })
}

async fn query_calendars(
    db: &Connection,
    sql: String,
    args: Vec<rusqlite::types::Value>,
) -> Result<Vec<Calendar>, Error> {
    let calendars = db
        .call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), row_to_calendar)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
    Ok(calendars)
}

pub async fn upsert_account(
    db: &Connection,
    account_id: &str,
    owner: &str,
    refresh_token: Option<String>,
) -> Result<(), Error> {
    let account_id = account_id.to_string();
    let owner = owner.to_string();
    db.call(move |conn| {
        conn.execute(
            "INSERT INTO calendar_account (id, owner, refresh_token, active, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(id) DO UPDATE SET
               owner = excluded.owner,
               refresh_token = COALESCE(excluded.refresh_token, calendar_account.refresh_token),
               active = 1",
            params![account_id, owner, refresh_token, now_millis()],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn get_account(db: &Connection, account_id: &str) -> Result<Option<CalendarAccount>, Error> {
    let account_id = account_id.to_string();
    let account = db
        .call(move |conn| {
            let account = conn
                .query_row(
                    "SELECT id, owner, active FROM calendar_account WHERE id = ?1",
                    [account_id],
                    |row| {
                        Ok(CalendarAccount {
                            id: row.get(0)?,
                            owner: row.get(1)?,
                            active: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(account)
        })
        .await?;
    Ok(account)
}

pub async fn get_refresh_token(db: &Connection, account_id: &str) -> Result<Option<String>, Error> {
    let account_id = account_id.to_string();
    let token = db
        .call(move |conn| {
            let token: Option<Option<String>> = conn
                .query_row(
                    "SELECT refresh_token FROM calendar_account WHERE id = ?1 AND active = 1",
                    [account_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(token.flatten())
        })
        .await?;
    Ok(token)
}

/// Insert a discovered calendar or refresh the name of a known one. A
/// calendar that reappears after being disabled is enabled again.
pub async fn upsert_calendar(
    db: &Connection,
    account_id: &str,
    provider_calendar_id: &str,
    name: &str,
) -> Result<Calendar, Error> {
    let account_id = account_id.to_string();
    let provider_calendar_id = provider_calendar_id.to_string();
    let name = name.to_string();
    let calendar = db
        .call(move |conn| {
            conn.execute(
                "INSERT INTO calendar (account_id, provider_calendar_id, name, sync_enabled)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(account_id, provider_calendar_id) DO UPDATE SET
                   name = excluded.name,
                   sync_enabled = 1",
                params![account_id, provider_calendar_id, name],
            )?;
            let calendar = conn.query_row(
                &format!(
                    "SELECT {} FROM calendar c WHERE c.account_id = ?1 AND c.provider_calendar_id = ?2",
                    CALENDAR_COLUMNS
                ),
                params![account_id, provider_calendar_id],
                row_to_calendar,
            )?;
            Ok(calendar)
        })
        .await?;
    Ok(calendar)
}

/// Disable every calendar of `account_id` not in `present`. Returns the
/// calendars that were disabled.
pub async fn disable_missing_calendars(
    db: &Connection,
    account_id: &str,
    present: Vec<String>,
) -> Result<Vec<Calendar>, Error> {
    let existing = list_calendars_for_account(db, account_id).await?;
    let mut disabled = Vec::new();
    for calendar in existing {
        if calendar.sync_enabled && !present.contains(&calendar.provider_calendar_id) {
            set_sync_enabled(db, calendar.id, false).await?;
            disabled.push(calendar);
        }
    }
    Ok(disabled)
}

pub async fn get_calendar(db: &Connection, calendar_id: i64) -> Result<Option<Calendar>, Error> {
    let calendars = query_calendars(
        db,
        format!("SELECT {} FROM calendar c WHERE c.id = ?1", CALENDAR_COLUMNS),
        vec![calendar_id.into()],
    )
    .await?;
    Ok(calendars.into_iter().next())
}

pub async fn list_calendars(db: &Connection) -> Result<Vec<Calendar>, Error> {
    query_calendars(
        db,
        format!("SELECT {} FROM calendar c ORDER BY c.id", CALENDAR_COLUMNS),
        vec![],
    )
    .await
}

pub async fn list_calendars_for_account(db: &Connection, account_id: &str) -> Result<Vec<Calendar>, Error> {
    query_calendars(
        db,
        format!(
            "SELECT {} FROM calendar c WHERE c.account_id = ?1 ORDER BY c.id",
            CALENDAR_COLUMNS
        ),
        vec![account_id.to_string().into()],
    )
    .await
}

pub async fn list_sync_enabled(db: &Connection) -> Result<Vec<Calendar>, Error> {
    query_calendars(
        db,
        format!(
            "SELECT {} FROM calendar c
             JOIN calendar_account a ON a.id = c.account_id
             WHERE c.sync_enabled = 1 AND a.active = 1
             ORDER BY c.id",
            CALENDAR_COLUMNS
        ),
        vec![],
    )
    .await
}

/// Every other sync-enabled calendar belonging to the same owner as
/// `source`. These receive placeholders for busy time on `source`.
pub async fn list_targets(db: &Connection, source: &Calendar) -> Result<Vec<Calendar>, Error> {
    query_calendars(
        db,
        format!(
            "SELECT {} FROM calendar c
             JOIN calendar_account a ON a.id = c.account_id
             WHERE c.sync_enabled = 1 AND a.active = 1 AND c.id != ?1
               AND a.owner = (SELECT owner FROM calendar_account WHERE id = ?2)
             ORDER BY c.id",
            CALENDAR_COLUMNS
        ),
        vec![source.id.into(), source.account_id.clone().into()],
    )
    .await
}

pub async fn set_sync_cursor(
    db: &Connection,
    calendar_id: i64,
    cursor: Option<String>,
    synced_at: DateTime<Utc>,
) -> Result<(), Error> {
    db.call(move |conn| {
        conn.execute(
            "UPDATE calendar SET sync_cursor = ?2, last_synced_at = ?3 WHERE id = ?1",
            params![calendar_id, cursor, to_millis(synced_at)],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn set_polling_mode(db: &Connection, calendar_id: i64, polling: bool) -> Result<(), Error> {
    db.call(move |conn| {
        conn.execute(
            "UPDATE calendar SET polling_mode = ?2 WHERE id = ?1",
            params![calendar_id, polling],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn set_channel(db: &Connection, calendar_id: i64, channel_id: Option<String>) -> Result<(), Error> {
    db.call(move |conn| {
        conn.execute(
            "UPDATE calendar SET channel_id = ?2 WHERE id = ?1",
            params![calendar_id, channel_id],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn set_sync_enabled(db: &Connection, calendar_id: i64, enabled: bool) -> Result<(), Error> {
    db.call(move |conn| {
        conn.execute(
            "UPDATE calendar SET sync_enabled = ?2 WHERE id = ?1",
            params![calendar_id, enabled],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

/// Removes the calendar along with its correlation records, subscriptions
/// and lease.
pub async fn delete_calendar(db: &Connection, calendar_id: i64) -> Result<(), Error> {
    db.call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM calendar_lock WHERE calendar_id = ?1", [calendar_id])?;
        tx.execute("DELETE FROM calendar WHERE id = ?1", [calendar_id])?;
        tx.commit()?;
        Ok(())
    })
    .await?;
    Ok(())
}
