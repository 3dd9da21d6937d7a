//! Per-user notification feed.
//!
//! A notification is a named JSON payload; adding one replaces any earlier
//! notification with the same name for that user, so clients only ever see
//! the latest value (an unread count, a task's progress). Clients poll with
//! the largest timestamp they have seen and receive everything newer.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::Notification;
use crate::store::{Entity, Session};

/// Smallest step between two timestamps issued to the same user.
const TIMESTAMP_STEP: f64 = 1e-6;

/// Wire form of a notification.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NotificationView {
    pub name: String,
    pub data: serde_json::Value,
    pub timestamp: f64,
}

impl From<&Notification> for NotificationView {
    fn from(n: &Notification) -> Self {
        Self {
            name: n.name.clone(),
            data: n.data(),
            timestamp: n.timestamp,
        }
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Replace the `(user_id, name)` notification with a new payload.
///
/// Runs inside the caller's transaction. The new timestamp is strictly
/// greater than any timestamp already issued to the user, so a client
/// cursor never skips it.
pub async fn add_notification<T: Serialize + ?Sized>(
    session: &mut Session<'_>,
    user_id: i64,
    name: &str,
    data: &T,
) -> Result<Notification> {
    let payload_json = serde_json::to_string(data)?;

    let previous: Option<f64> =
        sqlx::query_scalar("SELECT MAX(timestamp) FROM notifications WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(session.conn())
            .await?;
    let timestamp = match previous {
        Some(prev) if prev + TIMESTAMP_STEP > now_secs() => prev + TIMESTAMP_STEP,
        _ => now_secs(),
    };

    let sql = format!(
        "DELETE FROM notifications WHERE user_id = ? AND name = ? RETURNING {}",
        Notification::COLUMNS
    );
    let replaced = sqlx::query(&sql)
        .bind(user_id)
        .bind(name)
        .fetch_all(session.conn())
        .await?;
    for row in &replaced {
        let old = Notification::from_row(row)?;
        session.track_deleted(&old);
    }

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO notifications (name, user_id, timestamp, payload_json) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(user_id)
    .bind(timestamp)
    .bind(&payload_json)
    .fetch_one(session.conn())
    .await?;

    let notification = Notification {
        id,
        name: name.to_string(),
        user_id,
        timestamp,
        payload_json,
    };
    session.track_added(&notification);
    Ok(notification)
}

/// Notifications for `user_id` newer than `since`, oldest first.
pub async fn poll(pool: &SqlitePool, user_id: i64, since: f64) -> Result<Vec<Notification>> {
    let sql = format!(
        "SELECT {} FROM notifications WHERE user_id = ? AND timestamp > ? ORDER BY timestamp ASC, id ASC",
        Notification::COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(since)
        .fetch_all(pool)
        .await?;
    let items = rows
        .iter()
        .map(Notification::from_row)
        .collect::<sqlx::Result<Vec<_>>>()?;
    Ok(items)
}
