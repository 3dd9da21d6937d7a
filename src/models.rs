//! Core data models stored in the primary database.
//!
//! Every row type implements [`Entity`] so writes made through a
//! [`Session`](crate::store::Session) can be tracked; [`Post`] additionally
//! implements [`Indexable`] and is mirrored into the search index.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::index_sync::{IndexDocument, Indexable};
use crate::store::Entity;

/// A registered account.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub about_me: Option<String>,
    pub last_seen: Option<i64>,
    pub last_message_read_time: Option<i64>,
}

impl User {
    /// Gravatar identicon URL keyed by the SHA-256 of the lower-cased email.
    pub fn avatar(&self, size: u32) -> String {
        let digest = hex::encode(Sha256::digest(self.email.trim().to_lowercase().as_bytes()));
        format!(
            "https://www.gravatar.com/avatar/{}?d=identicon&s={}",
            digest, size
        )
    }
}

impl Entity for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static str =
        "id, username, email, password_hash, about_me, last_seen, last_message_read_time";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            about_me: row.try_get("about_me")?,
            last_seen: row.try_get("last_seen")?,
            last_message_read_time: row.try_get("last_message_read_time")?,
        })
    }
}

/// A short public post. The body is the searchable field.
#[derive(Debug, Clone, Serialize)]
pub struct Post {
    pub id: i64,
    pub body: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub user_id: i64,
    pub language: Option<String>,
}

impl Entity for Post {
    const TABLE: &'static str = "posts";
    const COLUMNS: &'static str = "id, body, timestamp, user_id, language";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            body: row.try_get("body")?,
            timestamp: row.try_get("timestamp")?,
            user_id: row.try_get("user_id")?,
            language: row.try_get("language")?,
        })
    }

    fn index_document(&self) -> Option<IndexDocument> {
        Some(IndexDocument::of(self))
    }
}

impl Indexable for Post {
    const INDEX: &'static str = "post";
    const SEARCHABLE: &'static [&'static str] = &["body"];

    fn doc_id(&self) -> i64 {
        self.id
    }

    fn searchable_value(&self, field: &str) -> Option<serde_json::Value> {
        match field {
            "body" => Some(serde_json::Value::String(self.body.clone())),
            _ => None,
        }
    }
}

/// A private message between two users.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub body: String,
    pub timestamp: i64,
}

impl Entity for Message {
    const TABLE: &'static str = "messages";
    const COLUMNS: &'static str = "id, sender_id, recipient_id, body, timestamp";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            sender_id: row.try_get("sender_id")?,
            recipient_id: row.try_get("recipient_id")?,
            body: row.try_get("body")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

/// A named, timestamped payload for one user. At most one row per
/// `(user_id, name)` is live at any time.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    /// Seconds since the epoch; doubles as the polling cursor.
    pub timestamp: f64,
    pub payload_json: String,
}

impl Notification {
    pub fn data(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload_json).unwrap_or(serde_json::Value::Null)
    }
}

impl Entity for Notification {
    const TABLE: &'static str = "notifications";
    const COLUMNS: &'static str = "id, name, user_id, timestamp, payload_json";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            user_id: row.try_get("user_id")?,
            timestamp: row.try_get("timestamp")?,
            payload_json: row.try_get("payload_json")?,
        })
    }
}

/// A background job launched by a user. The id is the job queue's job id.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub user_id: i64,
    pub complete: bool,
}

impl Entity for Task {
    const TABLE: &'static str = "tasks";
    const COLUMNS: &'static str = "id, name, description, user_id, complete";

    fn key(&self) -> String {
        self.id.clone()
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            user_id: row.try_get("user_id")?,
            complete: row.try_get("complete")?,
        })
    }
}

/// Rejected user input. The HTTP layer maps each variant to a status code.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub next_page: Option<i64>,
    pub prev_page: Option<i64>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: i64, per_page: i64, total: i64) -> Self {
        let next_page = if page * per_page < total {
            Some(page + 1)
        } else {
            None
        };
        let prev_page = if page > 1 { Some(page - 1) } else { None };
        Self {
            items,
            page,
            per_page,
            total,
            next_page,
            prev_page,
        }
    }
}

/// Clamp a 1-based page number and return the row offset for it.
pub fn page_offset(page: i64, per_page: i64) -> (i64, i64) {
    let page = page.max(1);
    (page, (page - 1) * per_page)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render unix milliseconds as ISO-8601 UTC with a `Z` suffix.
pub fn format_ts_iso(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_timestamps_carry_z_suffix() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_ts_iso(1_500), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn page_links() {
        let p: Page<i32> = Page::new(vec![1, 2], 1, 2, 5);
        assert_eq!(p.next_page, Some(2));
        assert_eq!(p.prev_page, None);

        let last: Page<i32> = Page::new(vec![5], 3, 2, 5);
        assert_eq!(last.next_page, None);
        assert_eq!(last.prev_page, Some(2));
    }

    #[test]
    fn page_offset_clamps_to_first_page() {
        assert_eq!(page_offset(0, 10), (1, 0));
        assert_eq!(page_offset(3, 10), (3, 20));
    }

    #[test]
    fn avatar_is_case_insensitive() {
        let mut u = User {
            id: 1,
            username: "susan".into(),
            email: "Susan@Example.com".into(),
            password_hash: String::new(),
            about_me: None,
            last_seen: None,
            last_message_read_time: None,
        };
        let a = u.avatar(128);
        u.email = "susan@example.com".into();
        assert_eq!(a, u.avatar(128));
        assert!(a.ends_with("?d=identicon&s=128"));
    }

    #[test]
    fn post_index_document_has_searchable_fields_only() {
        let post = Post {
            id: 7,
            body: "hola amigo".into(),
            timestamp: 0,
            user_id: 1,
            language: Some("es".into()),
        };
        let doc = post.index_document().unwrap();
        assert_eq!(doc.index, "post");
        assert_eq!(doc.id, 7);
        assert_eq!(doc.fields.len(), 1);
        assert_eq!(doc.fields["body"], "hola amigo");
    }

    #[test]
    fn non_indexable_entities_have_no_document() {
        let m = Message {
            id: 1,
            sender_id: 1,
            recipient_id: 2,
            body: "hi".into(),
            timestamp: 0,
        };
        assert!(m.index_document().is_none());
    }
}
