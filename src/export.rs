//! Export a user's posts as a JSON email attachment.
//!
//! Runs in the worker as the `export_posts` job. Produces `posts.json`:
//!
//! ```json
//! {
//!     "posts": [
//!         { "body": "...", "timestamp": "2024-01-01T00:00:00.000Z" }
//!     ]
//! }
//! ```
//!
//! Posts are ordered oldest first; progress is reported after each post.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::email::export_posts_email;
use crate::models::{format_ts_iso, Post};
use crate::store::Entity;
use crate::users::get_user;
use crate::worker::{Job, JobContext};

pub const EXPORT_POSTS: &str = "export_posts";

#[derive(Serialize)]
struct ExportData {
    posts: Vec<ExportPost>,
}

#[derive(Serialize)]
struct ExportPost {
    body: String,
    timestamp: String,
}

/// Serialize with 4-space indentation.
fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8(buf)?)
}

async fn user_posts_oldest_first(pool: &SqlitePool, user_id: i64) -> Result<Vec<Post>> {
    let sql = format!(
        "SELECT {} FROM posts WHERE user_id = ? ORDER BY timestamp ASC, id ASC",
        Post::COLUMNS
    );
    let rows = sqlx::query(&sql).bind(user_id).fetch_all(pool).await?;
    let posts = rows
        .iter()
        .map(Post::from_row)
        .collect::<sqlx::Result<Vec<_>>>()?;
    Ok(posts)
}

pub struct ExportPostsJob;

#[async_trait]
impl Job for ExportPostsJob {
    fn name(&self) -> &str {
        EXPORT_POSTS
    }

    async fn run(&self, ctx: &JobContext, _args: Value) -> Result<()> {
        let app = &ctx.app;
        let user = get_user(app.pool(), ctx.user_id)
            .await?
            .with_context(|| format!("user {} not found", ctx.user_id))?;

        ctx.set_progress(0).await?;

        let posts = user_posts_oldest_first(app.pool(), user.id).await?;
        let total = posts.len() as i64;
        let mut data = ExportData {
            posts: Vec::with_capacity(posts.len()),
        };

        for (i, post) in posts.into_iter().enumerate() {
            data.posts.push(ExportPost {
                body: post.body,
                timestamp: format_ts_iso(post.timestamp),
            });
            ctx.set_progress(100 * (i as i64 + 1) / total).await?;
        }

        let json = to_pretty_json(&data)?;
        let email = export_posts_email(app.mailer.sender(), &user, json);
        app.mailer.send(&email).await?;

        tracing::info!(user_id = user.id, posts = total, "posts exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_json_uses_four_spaces() {
        let data = ExportData {
            posts: vec![ExportPost {
                body: "hi".into(),
                timestamp: format_ts_iso(0),
            }],
        };
        let json = to_pretty_json(&data).unwrap();
        assert!(json.starts_with("{\n    \"posts\": [\n        {\n            \"body\": \"hi\""));
        assert!(json.contains("\"timestamp\": \"1970-01-01T00:00:00.000Z\""));
    }

    #[test]
    fn empty_export_is_valid_json() {
        let json = to_pretty_json(&ExportData { posts: vec![] }).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["posts"].as_array().unwrap().len(), 0);
    }
}
