//! Queries against the `event_correlation` table.
use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tokio_rusqlite::Connection;

use super::{CorrelationId, EventCorrelationRecord, EventKind, LifecycleState};
use crate::core::db::{from_millis, to_millis};
use crate::provider::EventTime;

const RECORD_COLUMNS: &str = "correlation_id, calendar_id, provider_event_id, kind, \
    created_by_system, source_correlation_id, lifecycle_state, title, starts_at, ends_at, \
    created_at, last_observed_at";

fn time_to_sql(time: &Option<EventTime>) -> Option<String> {
    time.as_ref().and_then(|t| serde_json::to_string(t).ok())
}

fn time_from_sql(value: Option<String>) -> Option<EventTime> {
    value.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_record(row: &Row) -> rusqlite::Result<EventCorrelationRecord> {
    Ok(EventCorrelationRecord {
        correlation_id: CorrelationId::from(row.get::<_, String>(0)?),
        calendar_id: row.get(1)?,
        provider_event_id: row.get(2)?,
        kind: row.get(3)?,
        created_by_system: row.get(4)?,
        source_correlation_id: row.get::<_, Option<String>>(5)?.map(CorrelationId::from),
        lifecycle_state: row.get(6)?,
        title: row.get(7)?,
        start: time_from_sql(row.get(8)?),
        end: time_from_sql(row.get(9)?),
        created_at: from_millis(row.get(10)?),
        last_observed_at: from_millis(row.get(11)?),
    })
}

async fn query_records(
    db: &Connection,
    sql: String,
    args: Vec<rusqlite::types::Value>,
) -> Result<Vec<EventCorrelationRecord>, Error> {
    let records = db
        .call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
    Ok(records)
}

pub async fn insert_record(db: &Connection, record: EventCorrelationRecord) -> Result<(), Error> {
    db.call(move |conn| {
        conn.execute(
            &format!(
                "INSERT INTO event_correlation ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                RECORD_COLUMNS
            ),
            params![
                record.correlation_id.as_str(),
                record.calendar_id,
                record.provider_event_id,
                record.kind,
                record.created_by_system,
                record.source_correlation_id.as_ref().map(|s| s.as_str()),
                record.lifecycle_state,
                record.title,
                time_to_sql(&record.start),
                time_to_sql(&record.end),
                to_millis(record.created_at),
                to_millis(record.last_observed_at),
            ],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn find_by_correlation_id(
    db: &Connection,
    correlation_id: &CorrelationId,
) -> Result<Option<EventCorrelationRecord>, Error> {
    let id = correlation_id.to_string();
    let record = db
        .call(move |conn| {
            let record = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM event_correlation WHERE correlation_id = ?1",
                        RECORD_COLUMNS
                    ),
                    [id],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await?;
    Ok(record)
}

pub async fn find_by_provider_event_id(
    db: &Connection,
    calendar_id: i64,
    provider_event_id: &str,
) -> Result<Option<EventCorrelationRecord>, Error> {
    let event_id = provider_event_id.to_string();
    let record = db
        .call(move |conn| {
            let record = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM event_correlation
                         WHERE calendar_id = ?1 AND provider_event_id = ?2
                         ORDER BY created_at DESC LIMIT 1",
                        RECORD_COLUMNS
                    ),
                    params![calendar_id, event_id],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await?;
    Ok(record)
}

/// Live (pending or materialized) placeholder for `source` on a calendar.
pub async fn list_placeholders_for_source(
    db: &Connection,
    source: &CorrelationId,
) -> Result<Vec<EventCorrelationRecord>, Error> {
    query_records(
        db,
        format!(
            "SELECT {} FROM event_correlation
             WHERE source_correlation_id = ?1 AND kind = ?2",
            RECORD_COLUMNS
        ),
        vec![
            source.to_string().into(),
            EventKind::PlaceholderBlock.as_str().to_string().into(),
        ],
    )
    .await
}

pub async fn list_records_for_calendar(
    db: &Connection,
    calendar_id: i64,
) -> Result<Vec<EventCorrelationRecord>, Error> {
    query_records(
        db,
        format!(
            "SELECT {} FROM event_correlation WHERE calendar_id = ?1 ORDER BY created_at",
            RECORD_COLUMNS
        ),
        vec![calendar_id.into()],
    )
    .await
}

pub async fn list_by_state(
    db: &Connection,
    state: LifecycleState,
) -> Result<Vec<EventCorrelationRecord>, Error> {
    query_records(
        db,
        format!(
            "SELECT {} FROM event_correlation WHERE lifecycle_state = ?1 ORDER BY created_at",
            RECORD_COLUMNS
        ),
        vec![state.as_str().to_string().into()],
    )
    .await
}

/// Placeholders whose source record no longer exists.
pub async fn list_dangling_placeholders(db: &Connection) -> Result<Vec<EventCorrelationRecord>, Error> {
    query_records(
        db,
        format!(
            "SELECT {} FROM event_correlation p
             WHERE p.kind = 'PlaceholderBlock'
               AND (p.source_correlation_id IS NULL OR NOT EXISTS (
                    SELECT 1 FROM event_correlation s
                    WHERE s.correlation_id = p.source_correlation_id
               ))",
            RECORD_COLUMNS
                .split(", ")
                .map(|c| format!("p.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        vec![],
    )
    .await
}

/// Transition every `Pending` record created before `cutoff` to `Failed`
/// and return them.
pub async fn fail_pending_before(
    db: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<EventCorrelationRecord>, Error> {
    let cutoff = to_millis(cutoff);
    let records = db
        .call(move |conn| {
            let tx = conn.transaction()?;
            let records = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM event_correlation
                     WHERE lifecycle_state = 'Pending' AND created_at < ?1",
                    RECORD_COLUMNS
                ))?;
                stmt.query_map([cutoff], row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?
            };
            tx.execute(
                "UPDATE event_correlation SET lifecycle_state = 'Failed'
                 WHERE lifecycle_state = 'Pending' AND created_at < ?1",
                [cutoff],
            )?;
            tx.commit()?;
            Ok(records)
        })
        .await?;
    Ok(records
        .into_iter()
        .map(|mut r| {
            r.lifecycle_state = LifecycleState::Failed;
            r
        })
        .collect())
}

pub async fn set_materialized(
    db: &Connection,
    correlation_id: &CorrelationId,
    provider_event_id: &str,
    observed_at: DateTime<Utc>,
) -> Result<(), Error> {
    let id = correlation_id.to_string();
    let event_id = provider_event_id.to_string();
    db.call(move |conn| {
        conn.execute(
            "UPDATE event_correlation
             SET provider_event_id = ?2, lifecycle_state = 'Materialized', last_observed_at = ?3
             WHERE correlation_id = ?1",
            params![id, event_id, to_millis(observed_at)],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn set_state(
    db: &Connection,
    correlation_id: &CorrelationId,
    state: LifecycleState,
) -> Result<(), Error> {
    let id = correlation_id.to_string();
    db.call(move |conn| {
        conn.execute(
            "UPDATE event_correlation SET lifecycle_state = ?2 WHERE correlation_id = ?1",
            params![id, state],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn update_times(
    db: &Connection,
    correlation_id: &CorrelationId,
    start: Option<EventTime>,
    end: Option<EventTime>,
) -> Result<(), Error> {
    let id = correlation_id.to_string();
    db.call(move |conn| {
        conn.execute(
            "UPDATE event_correlation SET starts_at = ?2, ends_at = ?3 WHERE correlation_id = ?1",
            params![id, time_to_sql(&start), time_to_sql(&end)],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn touch_observed(
    db: &Connection,
    correlation_ids: Vec<CorrelationId>,
    observed_at: DateTime<Utc>,
) -> Result<(), Error> {
    if correlation_ids.is_empty() {
        return Ok(());
    }
    db.call(move |conn| {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE event_correlation SET last_observed_at = ?2 WHERE correlation_id = ?1",
            )?;
            for id in correlation_ids {
                stmt.execute(params![id.as_str(), to_millis(observed_at)])?;
            }
        }
        tx.commit()?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn delete_record(db: &Connection, correlation_id: &CorrelationId) -> Result<(), Error> {
    let id = correlation_id.to_string();
    db.call(move |conn| {
        conn.execute("DELETE FROM event_correlation WHERE correlation_id = ?1", [id])?;
        Ok(())
    })
    .await?;
    Ok(())
}
