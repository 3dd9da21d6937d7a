//! Posts and timelines.
//!
//! Every write goes through a tracked [`Session`](crate::store::Session),
//! which is how posts reach the search index.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::{format_ts_iso, now_millis, page_offset, Page, Post, ValidationError};
use crate::store::{Entity, Store};

pub const MAX_BODY_CHARS: usize = 140;
/// Longest language code stored on a post.
pub const MAX_LANGUAGE_CHARS: usize = 5;

/// A post as rendered in listings.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PostView {
    pub id: i64,
    pub body: String,
    pub timestamp: String,
    pub author: String,
    pub language: Option<String>,
}

fn validate_body(body: &str) -> Result<(), ValidationError> {
    let n = body.trim().chars().count();
    if n == 0 {
        return Err(ValidationError::Invalid("post body is required".into()));
    }
    if n > MAX_BODY_CHARS {
        return Err(ValidationError::Invalid(format!(
            "post body is limited to {} characters",
            MAX_BODY_CHARS
        )));
    }
    Ok(())
}

/// Language recorded for a new post.
///
/// An explicit code from the client wins when it fits the column; otherwise
/// the body is run through detection and only a reliable guess is kept.
pub fn resolve_language(body: &str, explicit: Option<&str>) -> Option<String> {
    let explicit = explicit
        .map(str::trim)
        .filter(|l| !l.is_empty() && l.chars().count() <= MAX_LANGUAGE_CHARS);
    match explicit {
        Some(code) => Some(code.to_string()),
        None => detect_language(body),
    }
}

/// ISO 639-3 code of the body's language, or `None` when unsure.
pub fn detect_language(body: &str) -> Option<String> {
    let info = whatlang::detect(body)?;
    if !info.is_reliable() {
        return None;
    }
    let code = info.lang().code();
    (code.chars().count() <= MAX_LANGUAGE_CHARS).then(|| code.to_string())
}

pub async fn create_post(
    store: &Store,
    user_id: i64,
    body: &str,
    language: Option<&str>,
) -> Result<Post> {
    validate_body(body)?;
    let mut post = Post {
        id: 0,
        body: body.trim().to_string(),
        timestamp: now_millis(),
        user_id,
        language: resolve_language(body, language),
    };

    let mut session = store.begin().await?;
    post.id = sqlx::query_scalar(
        "INSERT INTO posts (body, timestamp, user_id, language) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(&post.body)
    .bind(post.timestamp)
    .bind(post.user_id)
    .bind(&post.language)
    .fetch_one(session.conn())
    .await?;
    session.track_added(&post);
    session.commit().await?;

    tracing::debug!(post_id = post.id, user_id, "post created");
    Ok(post)
}

pub async fn get_post(pool: &SqlitePool, id: i64) -> Result<Option<Post>> {
    let sql = format!("SELECT {} FROM posts WHERE id = ?", Post::COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(Post::from_row).transpose()?)
}

pub async fn update_post(store: &Store, id: i64, body: &str) -> Result<Post> {
    validate_body(body)?;
    let Some(mut post) = get_post(store.pool(), id).await? else {
        return Err(ValidationError::NotFound(format!("post {} not found", id)).into());
    };
    post.body = body.trim().to_string();

    let mut session = store.begin().await?;
    sqlx::query("UPDATE posts SET body = ? WHERE id = ?")
        .bind(&post.body)
        .bind(id)
        .execute(session.conn())
        .await?;
    session.track_updated(&post);
    session.commit().await?;
    Ok(post)
}

pub async fn delete_post(store: &Store, id: i64) -> Result<()> {
    let Some(post) = get_post(store.pool(), id).await? else {
        return Err(ValidationError::NotFound(format!("post {} not found", id)).into());
    };

    let mut session = store.begin().await?;
    sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(id)
        .execute(session.conn())
        .await?;
    session.track_deleted(&post);
    session.commit().await?;
    Ok(())
}

const VIEW_SELECT: &str = "SELECT p.id, p.body, p.timestamp, p.language, u.username \
     FROM posts p JOIN users u ON u.id = p.user_id";

async fn page_of_views(
    pool: &SqlitePool,
    filter: &str,
    user_id: Option<i64>,
    page: i64,
    per_page: i64,
) -> Result<Page<PostView>> {
    let (page, offset) = page_offset(page, per_page);

    let count_sql = format!("SELECT COUNT(*) FROM posts p {}", filter);
    let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
    let list_sql = format!(
        "{} {} ORDER BY p.timestamp DESC, p.id DESC LIMIT ? OFFSET ?",
        VIEW_SELECT, filter
    );
    let mut list = sqlx::query_as::<_, (i64, String, i64, Option<String>, String)>(&list_sql);

    if let Some(id) = user_id {
        let binds = filter.matches('?').count();
        for _ in 0..binds {
            count = count.bind(id);
            list = list.bind(id);
        }
    }

    let total = count.fetch_one(pool).await?;
    let rows = list.bind(per_page).bind(offset).fetch_all(pool).await?;

    let items = rows
        .into_iter()
        .map(|(id, body, timestamp, language, author)| PostView {
            id,
            body,
            timestamp: format_ts_iso(timestamp),
            author,
            language,
        })
        .collect();
    Ok(Page::new(items, page, per_page, total))
}

/// Posts of followed users plus the user's own, newest first.
pub async fn followed_posts(
    pool: &SqlitePool,
    user_id: i64,
    page: i64,
    per_page: i64,
) -> Result<Page<PostView>> {
    page_of_views(
        pool,
        "WHERE p.user_id = ? OR p.user_id IN (SELECT followed_id FROM followers WHERE follower_id = ?)",
        Some(user_id),
        page,
        per_page,
    )
    .await
}

pub async fn user_posts(
    pool: &SqlitePool,
    user_id: i64,
    page: i64,
    per_page: i64,
) -> Result<Page<PostView>> {
    page_of_views(pool, "WHERE p.user_id = ?", Some(user_id), page, per_page).await
}

/// Every post, newest first.
pub async fn explore(pool: &SqlitePool, page: i64, per_page: i64) -> Result<Page<PostView>> {
    page_of_views(pool, "", None, page, per_page).await
}

/// Render posts returned by a search, keeping their order.
pub async fn views_of(pool: &SqlitePool, posts: Vec<Post>) -> Result<Vec<PostView>> {
    let mut out = Vec::with_capacity(posts.len());
    for post in posts {
        let author: Option<String> = sqlx::query_scalar("SELECT username FROM users WHERE id = ?")
            .bind(post.user_id)
            .fetch_optional(pool)
            .await?;
        out.push(PostView {
            id: post.id,
            body: post.body,
            timestamp: format_ts_iso(post.timestamp),
            author: author.unwrap_or_default(),
            language: post.language,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing;
    use crate::users::follow;
    use tempfile::TempDir;

    #[tokio::test]
    async fn body_length_is_enforced() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        let u = testing::user(&app, "susan").await;

        assert!(create_post(&app.store, u, "   ", None).await.is_err());
        let long = "x".repeat(MAX_BODY_CHARS + 1);
        assert!(create_post(&app.store, u, &long, None).await.is_err());
        let max = "é".repeat(MAX_BODY_CHARS);
        assert!(create_post(&app.store, u, &max, None).await.is_ok());
    }

    #[test]
    fn language_prefers_short_explicit_code() {
        assert_eq!(resolve_language("anything", Some(" es ")), Some("es".into()));
        assert_eq!(resolve_language("1234 5678", Some("")), None);
        assert_eq!(resolve_language("1234 5678", Some("klingon")), None);
    }

    #[test]
    fn language_is_detected_from_body() {
        let french = "Bonjour à tous, je suis très content de vous retrouver ici \
                      aujourd'hui pour parler de la pluie et du beau temps.";
        assert_eq!(detect_language(french), Some("fra".into()));
        assert_eq!(resolve_language(french, Some("português")), Some("fra".into()));
        assert_eq!(detect_language("1234 5678"), None);
    }

    #[tokio::test]
    async fn created_post_stores_detected_language() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        let u = testing::user(&app, "susan").await;

        let spanish = "Hola a todos, hoy quiero contaros que estoy muy contento de estar aquí \
                       con vosotros y con toda mi familia.";
        let post = create_post(&app.store, u, spanish, None).await.unwrap();
        assert_eq!(post.language.as_deref(), Some("spa"));
        let stored = get_post(app.pool(), post.id).await.unwrap().unwrap();
        assert_eq!(stored.language.as_deref(), Some("spa"));

        let numbers = create_post(&app.store, u, "42 42 42", None).await.unwrap();
        assert_eq!(numbers.language, None);
    }

    #[tokio::test]
    async fn timelines_and_pagination() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        let a = testing::user(&app, "a").await;
        let b = testing::user(&app, "b").await;
        let c = testing::user(&app, "c").await;

        for (user, body) in [(a, "a1"), (b, "b1"), (c, "c1"), (b, "b2"), (a, "a2")] {
            create_post(&app.store, user, body, None).await.unwrap();
        }
        follow(app.pool(), a, b).await.unwrap();

        let feed = followed_posts(app.pool(), a, 1, 10).await.unwrap();
        let bodies: Vec<_> = feed.items.iter().map(|p| p.body.as_str()).collect();
        assert_eq!(bodies, vec!["a2", "b2", "b1", "a1"]);
        assert_eq!(feed.total, 4);

        let mine = user_posts(app.pool(), b, 1, 10).await.unwrap();
        assert_eq!(mine.total, 2);
        assert!(mine.items.iter().all(|p| p.author == "b"));

        let first = explore(app.pool(), 1, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.total, 5);
        assert_eq!(first.next_page, Some(2));
        let last = explore(app.pool(), 3, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].body, "a1");
        assert_eq!(last.next_page, None);
    }

    #[tokio::test]
    async fn writes_flow_into_search() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        let u = testing::user(&app, "susan").await;

        let post = create_post(&app.store, u, "hola amigo", Some("es")).await.unwrap();
        let (hits, total) = app
            .search
            .search::<Post>(app.pool(), "amigo", 1, 10)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].id, post.id);

        update_post(&app.store, post.id, "buenos dias").await.unwrap();
        let (_, total) = app.search.search::<Post>(app.pool(), "amigo", 1, 10).await.unwrap();
        assert_eq!(total, 0);
        let (hits, _) = app.search.search::<Post>(app.pool(), "dias", 1, 10).await.unwrap();
        assert_eq!(hits[0].body, "buenos dias");

        delete_post(&app.store, post.id).await.unwrap();
        let (hits, total) = app.search.search::<Post>(app.pool(), "dias", 1, 10).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(total, 0);
    }
}
