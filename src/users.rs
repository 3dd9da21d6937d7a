//! Accounts, profiles and the follower graph.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::auth::{hash_password, verify_password};
use crate::models::{format_ts_iso, now_millis, User, ValidationError};
use crate::store::{Entity, Store};

/// Public view of a user.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: i64,
    pub username: String,
    pub about_me: Option<String>,
    pub last_seen: Option<String>,
    pub avatar: String,
    pub followers: i64,
    pub following: i64,
}

async fn fetch_one_by(pool: &SqlitePool, column: &str, value: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?", User::COLUMNS, column);
    let row = sqlx::query(&sql).bind(value).fetch_optional(pool).await?;
    Ok(row.as_ref().map(User::from_row).transpose()?)
}

pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", User::COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(User::from_row).transpose()?)
}

pub async fn find_by_username(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    fetch_one_by(pool, "username", username).await
}

pub async fn find_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    fetch_one_by(pool, "email", email).await
}

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Invalid(format!("{} is required", field)));
    }
    Ok(())
}

pub async fn create_user(
    store: &Store,
    username: &str,
    email: &str,
    password: &str,
) -> Result<User> {
    let username = username.trim();
    let email = email.trim();
    require("username", username)?;
    require("email", email)?;
    require("password", password)?;
    if !email.contains('@') {
        return Err(ValidationError::Invalid("email is not valid".into()).into());
    }

    if find_by_username(store.pool(), username).await?.is_some() {
        return Err(ValidationError::Conflict("please use a different username".into()).into());
    }
    if find_by_email(store.pool(), email).await?.is_some() {
        return Err(
            ValidationError::Conflict("please use a different email address".into()).into(),
        );
    }

    let mut user = User {
        id: 0,
        username: username.to_string(),
        email: email.to_string(),
        password_hash: hash_password(password)?,
        about_me: None,
        last_seen: Some(now_millis()),
        last_message_read_time: None,
    };

    let mut session = store.begin().await?;
    user.id = sqlx::query_scalar(
        "INSERT INTO users (username, email, password_hash, last_seen) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.last_seen)
    .fetch_one(session.conn())
    .await?;
    session.track_added(&user);
    session.commit().await?;

    tracing::info!(user_id = user.id, username = %user.username, "user registered");
    Ok(user)
}

/// The user whose credentials match, if any.
pub async fn authenticate(pool: &SqlitePool, username: &str, password: &str) -> Result<Option<User>> {
    let user = find_by_username(pool, username).await?;
    Ok(user.filter(|u| verify_password(&u.password_hash, password)))
}

pub async fn set_password(store: &Store, user_id: i64, password: &str) -> Result<()> {
    require("password", password)?;
    let Some(mut user) = get_user(store.pool(), user_id).await? else {
        return Err(ValidationError::NotFound("user not found".into()).into());
    };
    user.password_hash = hash_password(password)?;

    let mut session = store.begin().await?;
    sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(&user.password_hash)
        .bind(user_id)
        .execute(session.conn())
        .await?;
    session.track_updated(&user);
    session.commit().await?;
    Ok(())
}

pub async fn update_profile(
    store: &Store,
    user_id: i64,
    username: &str,
    about_me: Option<&str>,
) -> Result<User> {
    let username = username.trim();
    require("username", username)?;
    if about_me.is_some_and(|a| a.chars().count() > 140) {
        return Err(ValidationError::Invalid("about_me is limited to 140 characters".into()).into());
    }
    let Some(mut user) = get_user(store.pool(), user_id).await? else {
        return Err(ValidationError::NotFound("user not found".into()).into());
    };
    if username != user.username && find_by_username(store.pool(), username).await?.is_some() {
        return Err(ValidationError::Conflict("please use a different username".into()).into());
    }

    user.username = username.to_string();
    user.about_me = about_me.map(str::to_string);

    let mut session = store.begin().await?;
    sqlx::query("UPDATE users SET username = ?, about_me = ? WHERE id = ?")
        .bind(&user.username)
        .bind(&user.about_me)
        .bind(user_id)
        .execute(session.conn())
        .await?;
    session.track_updated(&user);
    session.commit().await?;
    Ok(user)
}

pub async fn touch_last_seen(pool: &SqlitePool, user_id: i64) -> Result<()> {
    sqlx::query("UPDATE users SET last_seen = ? WHERE id = ?")
        .bind(now_millis())
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn is_following(pool: &SqlitePool, follower_id: i64, followed_id: i64) -> Result<bool> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM followers WHERE follower_id = ? AND followed_id = ?",
    )
    .bind(follower_id)
    .bind(followed_id)
    .fetch_one(pool)
    .await?;
    Ok(n > 0)
}

/// Idempotent; following yourself is refused.
pub async fn follow(pool: &SqlitePool, follower_id: i64, followed_id: i64) -> Result<()> {
    if follower_id == followed_id {
        return Err(ValidationError::Invalid("you cannot follow yourself".into()).into());
    }
    sqlx::query("INSERT OR IGNORE INTO followers (follower_id, followed_id) VALUES (?, ?)")
        .bind(follower_id)
        .bind(followed_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn unfollow(pool: &SqlitePool, follower_id: i64, followed_id: i64) -> Result<()> {
    if follower_id == followed_id {
        return Err(ValidationError::Invalid("you cannot unfollow yourself".into()).into());
    }
    sqlx::query("DELETE FROM followers WHERE follower_id = ? AND followed_id = ?")
        .bind(follower_id)
        .bind(followed_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn profile(pool: &SqlitePool, user: &User) -> Result<Profile> {
    let followers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM followers WHERE followed_id = ?")
        .bind(user.id)
        .fetch_one(pool)
        .await?;
    let following: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM followers WHERE follower_id = ?")
        .bind(user.id)
        .fetch_one(pool)
        .await?;
    Ok(Profile {
        id: user.id,
        username: user.username.clone(),
        about_me: user.about_me.clone(),
        last_seen: user.last_seen.map(format_ts_iso),
        avatar: user.avatar(128),
        followers,
        following,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing;
    use tempfile::TempDir;

    fn kind(e: &anyhow::Error) -> &'static str {
        match e.downcast_ref::<ValidationError>() {
            Some(ValidationError::Invalid(_)) => "invalid",
            Some(ValidationError::Conflict(_)) => "conflict",
            Some(ValidationError::NotFound(_)) => "not_found",
            None => "other",
        }
    }

    #[tokio::test]
    async fn register_and_authenticate() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;

        let u = create_user(&app.store, "susan", "susan@example.com", "cat")
            .await
            .unwrap();
        assert!(u.id > 0);
        assert!(authenticate(app.pool(), "susan", "cat").await.unwrap().is_some());
        assert!(authenticate(app.pool(), "susan", "dog").await.unwrap().is_none());
        assert!(authenticate(app.pool(), "nobody", "cat").await.unwrap().is_none());

        set_password(&app.store, u.id, "dog").await.unwrap();
        assert!(authenticate(app.pool(), "susan", "dog").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicates_and_blanks_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        create_user(&app.store, "susan", "susan@example.com", "cat")
            .await
            .unwrap();

        let e = create_user(&app.store, "susan", "other@example.com", "x")
            .await
            .unwrap_err();
        assert_eq!(kind(&e), "conflict");
        let e = create_user(&app.store, "john", "susan@example.com", "x")
            .await
            .unwrap_err();
        assert_eq!(kind(&e), "conflict");
        let e = create_user(&app.store, " ", "a@b", "x").await.unwrap_err();
        assert_eq!(kind(&e), "invalid");
    }

    #[tokio::test]
    async fn padded_names_are_trimmed_before_uniqueness_checks() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        create_user(&app.store, "susan", "susan@example.com", "cat")
            .await
            .unwrap();

        let e = create_user(&app.store, "susan ", "other@example.com", "x")
            .await
            .unwrap_err();
        assert_eq!(kind(&e), "conflict");
        let e = create_user(&app.store, "john", " susan@example.com", "x")
            .await
            .unwrap_err();
        assert_eq!(kind(&e), "conflict");

        let john = create_user(&app.store, "  john ", " john@example.com ", "x")
            .await
            .unwrap();
        assert_eq!(john.username, "john");
        assert_eq!(john.email, "john@example.com");

        let e = update_profile(&app.store, john.id, " susan", None)
            .await
            .unwrap_err();
        assert_eq!(kind(&e), "conflict");
        let u = update_profile(&app.store, john.id, " johnny ", None)
            .await
            .unwrap();
        assert_eq!(u.username, "johnny");
        assert!(find_by_username(app.pool(), "johnny").await.unwrap().is_some());
        let u = update_profile(&app.store, john.id, "johnny ", None)
            .await
            .unwrap();
        assert_eq!(u.username, "johnny");
    }

    #[tokio::test]
    async fn follow_is_idempotent_and_not_reflexive() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        let a = testing::user(&app, "a").await;
        let b = testing::user(&app, "b").await;

        follow(app.pool(), a, b).await.unwrap();
        follow(app.pool(), a, b).await.unwrap();
        assert!(is_following(app.pool(), a, b).await.unwrap());
        assert!(!is_following(app.pool(), b, a).await.unwrap());

        let ua = get_user(app.pool(), a).await.unwrap().unwrap();
        let ub = get_user(app.pool(), b).await.unwrap().unwrap();
        assert_eq!(profile(app.pool(), &ua).await.unwrap().following, 1);
        assert_eq!(profile(app.pool(), &ub).await.unwrap().followers, 1);

        assert_eq!(kind(&follow(app.pool(), a, a).await.unwrap_err()), "invalid");

        unfollow(app.pool(), a, b).await.unwrap();
        unfollow(app.pool(), a, b).await.unwrap();
        assert!(!is_following(app.pool(), a, b).await.unwrap());
    }

    #[tokio::test]
    async fn profile_rename_checks_uniqueness() {
        let tmp = TempDir::new().unwrap();
        let app = testing::context(tmp.path()).await;
        let a = testing::user(&app, "a").await;
        testing::user(&app, "b").await;

        let e = update_profile(&app.store, a, "b", None).await.unwrap_err();
        assert_eq!(kind(&e), "conflict");

        let u = update_profile(&app.store, a, "a", Some("hello")).await.unwrap();
        assert_eq!(u.about_me.as_deref(), Some("hello"));
        let u = update_profile(&app.store, a, "alice", None).await.unwrap();
        assert_eq!(u.username, "alice");
        assert!(find_by_username(app.pool(), "alice").await.unwrap().is_some());
    }
}
