use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tokio_rusqlite::Connection;

use super::{PushSubscription, SubscriptionStatus};
use crate::core::db::{from_millis, now_millis, to_millis};

const SUBSCRIPTION_COLUMNS: &str = "channel_id, calendar_id, resource_id, expires_at, \
    failure_count, status, suspended_reason, next_attempt_at, last_message_number";

fn row_to_subscription(row: &Row) -> rusqlite::Result<PushSubscription> {
    Ok(PushSubscription {
        channel_id: row.get(0)?,
        calendar_id: row.get(1)?,
        resource_id: row.get(2)?,
        expires_at: from_millis(row.get(3)?),
        failure_count: row.get(4)?,
        status: row.get(5)?,
        suspended_reason: row.get(6)?,
        next_attempt_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        last_message_number: row.get(8)?,
    })
}

async fn query_subscriptions(
    db: &Connection,
    sql: String,
    args: Vec<rusqlite::types::Value>,
) -> Result<Vec<PushSubscription>, Error> {
    let subscriptions = db
        .call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), row_to_subscription)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
    Ok(subscriptions)
}

pub async fn insert_subscription(db: &Connection, subscription: PushSubscription) -> Result<(), Error> {
    db.call(move |conn| {
        conn.execute(
            &format!(
                "INSERT INTO push_subscription ({}, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                SUBSCRIPTION_COLUMNS
            ),
            params![
                subscription.channel_id,
                subscription.calendar_id,
                subscription.resource_id,
                to_millis(subscription.expires_at),
                subscription.failure_count,
                subscription.status,
                subscription.suspended_reason,
                subscription.next_attempt_at.map(to_millis),
                subscription.last_message_number,
                now_millis(),
            ],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn get_subscription(db: &Connection, channel_id: &str) -> Result<Option<PushSubscription>, Error> {
    let channel_id = channel_id.to_string();
    let subscription = db
        .call(move |conn| {
            let subscription = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM push_subscription WHERE channel_id = ?1",
                        SUBSCRIPTION_COLUMNS
                    ),
                    [channel_id],
                    row_to_subscription,
                )
                .optional()?;
            Ok(subscription)
        })
        .await?;
    Ok(subscription)
}

pub async fn list_subscriptions(db: &Connection) -> Result<Vec<PushSubscription>, Error> {
    query_subscriptions(
        db,
        format!(
            "SELECT {} FROM push_subscription ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        ),
        vec![],
    )
    .await
}

pub async fn list_by_status(
    db: &Connection,
    status: SubscriptionStatus,
) -> Result<Vec<PushSubscription>, Error> {
    query_subscriptions(
        db,
        format!(
            "SELECT {} FROM push_subscription WHERE status = ?1 ORDER BY expires_at",
            SUBSCRIPTION_COLUMNS
        ),
        vec![status.as_str().to_string().into()],
    )
    .await
}

pub async fn list_for_calendar(db: &Connection, calendar_id: i64) -> Result<Vec<PushSubscription>, Error> {
    query_subscriptions(
        db,
        format!(
            "SELECT {} FROM push_subscription WHERE calendar_id = ?1",
            SUBSCRIPTION_COLUMNS
        ),
        vec![calendar_id.into()],
    )
    .await
}

pub async fn set_status(
    db: &Connection,
    channel_id: &str,
    status: SubscriptionStatus,
    reason: Option<String>,
) -> Result<(), Error> {
    let channel_id = channel_id.to_string();
    db.call(move |conn| {
        conn.execute(
            "UPDATE push_subscription SET status = ?2, suspended_reason = ?3 WHERE channel_id = ?1",
            params![channel_id, status, reason],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn set_failures(
    db: &Connection,
    channel_id: &str,
    failure_count: u32,
    next_attempt_at: Option<DateTime<Utc>>,
) -> Result<(), Error> {
    let channel_id = channel_id.to_string();
    db.call(move |conn| {
        conn.execute(
            "UPDATE push_subscription SET failure_count = ?2, next_attempt_at = ?3 WHERE channel_id = ?1",
            params![channel_id, failure_count, next_attempt_at.map(to_millis)],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

/// Record `message_number` as seen. Returns false when it is not newer
/// than the last one recorded for the channel.
pub async fn advance_message_number(
    db: &Connection,
    channel_id: &str,
    message_number: i64,
) -> Result<bool, Error> {
    let channel_id = channel_id.to_string();
    let changed = db
        .call(move |conn| {
            let changed = conn.execute(
                "UPDATE push_subscription SET last_message_number = ?2
                 WHERE channel_id = ?1 AND last_message_number < ?2",
                params![channel_id, message_number],
            )?;
            Ok(changed)
        })
        .await?;
    Ok(changed > 0)
}

pub async fn expire_lapsed(db: &Connection, now: DateTime<Utc>) -> Result<usize, Error> {
    let changed = db
        .call(move |conn| {
            let changed = conn.execute(
                "UPDATE push_subscription SET status = 'Expired'
                 WHERE status = 'Active' AND expires_at <= ?1",
                [to_millis(now)],
            )?;
            Ok(changed)
        })
        .await?;
    Ok(changed)
}

pub async fn delete_subscription(db: &Connection, channel_id: &str) -> Result<(), Error> {
    let channel_id = channel_id.to_string();
    db.call(move |conn| {
        conn.execute(
            "DELETE FROM push_subscription WHERE channel_id = ?1",
            [channel_id],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}
