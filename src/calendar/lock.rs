//! A lease stored in sqlite that keeps a single sync pass running per
//! calendar, across tasks and processes sharing the database. A lease
//! whose holder died is taken over once it expires.
use std::time::Duration;

use anyhow::{Error, Result};
use rusqlite::params;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::core::db::now_millis;

#[derive(Debug)]
pub struct CalendarLease {
    db: Connection,
    calendar_id: i64,
    holder: String,
}

impl CalendarLease {
    /// Returns `None` when another holder owns an unexpired lease.
    pub async fn acquire(db: &Connection, calendar_id: i64, ttl: Duration) -> Result<Option<Self>, Error> {
        let holder = Uuid::new_v4().to_string();
        let holder_id = holder.clone();
        let ttl_ms = ttl.as_millis() as i64;
        let acquired = db
            .call(move |conn| {
                let now = now_millis();
                let changed = conn.execute(
                    "INSERT INTO calendar_lock (calendar_id, holder, expires_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(calendar_id) DO UPDATE SET
                       holder = excluded.holder,
                       expires_at = excluded.expires_at
                     WHERE calendar_lock.expires_at <= ?4",
                    params![calendar_id, holder_id, now + ttl_ms, now],
                )?;
                Ok(changed > 0)
            })
            .await?;

        if !acquired {
            tracing::debug!("Lease for calendar {} is held elsewhere", calendar_id);
            return Ok(None);
        }
        Ok(Some(Self {
            db: db.clone(),
            calendar_id,
            holder,
        }))
    }

    /// Release the lease if it is still ours.
    pub async fn release(self) -> Result<(), Error> {
        let calendar_id = self.calendar_id;
        let holder = self.holder;
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM calendar_lock WHERE calendar_id = ?1 AND holder = ?2",
                    params![calendar_id, holder],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

pub async fn delete_expired_leases(db: &Connection) -> Result<usize, Error> {
    let deleted = db
        .call(|conn| {
            let deleted = conn.execute(
                "DELETE FROM calendar_lock WHERE expires_at <= ?1",
                [now_millis()],
            )?;
            Ok(deleted)
        })
        .await?;
    Ok(deleted)
}
