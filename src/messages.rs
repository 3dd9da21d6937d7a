//! Private messages and the unread counter.
//!
//! Sending a message refreshes the recipient's `unread_message_count`
//! notification; reading the inbox resets it to 0.

use anyhow::Result;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};

use crate::models::{format_ts_iso, now_millis, page_offset, Message, Page, User, ValidationError};
use crate::notifications::add_notification;
use crate::posts::MAX_BODY_CHARS;
use crate::store::Store;

pub const UNREAD_MESSAGE_COUNT: &str = "unread_message_count";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageView {
    pub id: i64,
    pub sender: String,
    pub body: String,
    pub timestamp: String,
}

async fn unread_count(conn: &mut SqliteConnection, user_id: i64) -> Result<i64> {
    let n = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM messages
        WHERE recipient_id = ?
          AND timestamp > COALESCE((SELECT last_message_read_time FROM users WHERE id = ?), 0)
        "#,
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_one(conn)
    .await?;
    Ok(n)
}

/// Messages received since the user last read the inbox.
pub async fn new_messages(pool: &SqlitePool, user_id: i64) -> Result<i64> {
    let mut conn = pool.acquire().await?;
    unread_count(&mut *conn, user_id).await
}

pub async fn send_message(
    store: &Store,
    sender_id: i64,
    recipient: &User,
    body: &str,
) -> Result<Message> {
    let n = body.trim().chars().count();
    if n == 0 || n > MAX_BODY_CHARS {
        return Err(ValidationError::Invalid(format!(
            "message body must be 1 to {} characters",
            MAX_BODY_CHARS
        ))
        .into());
    }

    let mut message = Message {
        id: 0,
        sender_id,
        recipient_id: recipient.id,
        body: body.trim().to_string(),
        timestamp: now_millis(),
    };

    let mut session = store.begin().await?;
    message.id = sqlx::query_scalar(
        "INSERT INTO messages (sender_id, recipient_id, body, timestamp) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(message.sender_id)
    .bind(message.recipient_id)
    .bind(&message.body)
    .bind(message.timestamp)
    .fetch_one(session.conn())
    .await?;
    session.track_added(&message);

    let unread = unread_count(session.conn(), recipient.id).await?;
    add_notification(&mut session, recipient.id, UNREAD_MESSAGE_COUNT, &unread).await?;
    session.commit().await?;

    Ok(message)
}

/// A page of received messages, newest first. Marks the inbox read.
pub async fn received_messages(
    store: &Store,
    user: &User,
    page: i64,
    per_page: i64,
) -> Result<Page<MessageView>> {
    let read_at = now_millis();
    let mut session = store.begin().await?;
    sqlx::query("UPDATE users SET last_message_read_time = ? WHERE id = ?")
        .bind(read_at)
        .bind(user.id)
        .execute(session.conn())
        .await?;
    let mut read = user.clone();
    read.last_message_read_time = Some(read_at);
    session.track_updated(&read);
    add_notification(&mut session, user.id, UNREAD_MESSAGE_COUNT, &0).await?;
    session.commit().await?;

    let (page, offset) = page_offset(page, per_page);
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE recipient_id = ?")
        .bind(user.id)
        .fetch_one(store.pool())
        .await?;
    let rows = sqlx::query_as::<_, (i64, String, String, i64)>(
        r#"
        SELECT m.id, u.username, m.body, m.timestamp
        FROM messages m JOIN users u ON u.id = m.sender_id
        WHERE m.recipient_id = ?
        ORDER BY m.timestamp DESC, m.id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(user.id)
    .bind(per_page)
    .bind(offset)
    .fetch_all(store.pool())
    .await?;

    let items = rows
        .into_iter()
        .map(|(id, sender, body, timestamp)| MessageView {
            id,
            sender,
            body,
            timestamp: format_ts_iso(timestamp),
        })
        .collect();
    Ok(Page::new(items, page, per_page, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing;
    use crate::notifications::poll;
    use crate::users::get_user;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn unread_counter_tracks_inbox() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        let a = testing::user(&app, "a").await;
        let b = testing::user(&app, "b").await;
        let ub = get_user(app.pool(), b).await.unwrap().unwrap();

        send_message(&app.store, a, &ub, "one").await.unwrap();
        send_message(&app.store, a, &ub, "two").await.unwrap();
        send_message(&app.store, a, &ub, "three").await.unwrap();
        assert_eq!(new_messages(app.pool(), b).await.unwrap(), 3);

        let feed = poll(app.pool(), b, 0.0).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].name, UNREAD_MESSAGE_COUNT);
        assert_eq!(feed[0].data(), json!(3));

        let inbox = received_messages(&app.store, &ub, 1, 2).await.unwrap();
        assert_eq!(inbox.total, 3);
        assert_eq!(inbox.items[0].body, "three");
        assert_eq!(inbox.items[0].sender, "a");
        assert_eq!(inbox.next_page, Some(2));

        let feed = poll(app.pool(), b, 0.0).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].data(), json!(0));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        let a = testing::user(&app, "a").await;
        let b = testing::user(&app, "b").await;
        let ub = get_user(app.pool(), b).await.unwrap().unwrap();
        assert!(send_message(&app.store, a, &ub, " ").await.is_err());
        assert!(poll(app.pool(), b, 0.0).await.unwrap().is_empty());
    }
}
