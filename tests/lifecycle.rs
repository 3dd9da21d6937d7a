//! End-to-end tests of the commit → index, task → notification and
//! worker → email paths, driven through the library API.

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use microblog::app::AppContext;
use microblog::config::Config;
use microblog::db;
use microblog::email::Email;
use microblog::export::EXPORT_POSTS;
use microblog::index_sync::IndexSync;
use microblog::messages::{received_messages, send_message, UNREAD_MESSAGE_COUNT};
use microblog::migrate::{create_primary_schema, run_migrations};
use microblog::models::Post;
use microblog::notifications::{add_notification, poll};
use microblog::posts::{create_post, delete_post, update_post};
use microblog::queue::JobStatus;
use microblog::search_index::MemoryIndex;
use microblog::store::{ChangeSet, PreCommitObserver, Store};
use microblog::tasks::{get_task, launch_task, task_progress, TASK_PROGRESS};
use microblog::users::create_user;
use microblog::worker::{Job, JobContext, JobRegistry, Worker};

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir, search_backend: &str) -> Config {
    let root = tmp.path();
    let config_content = format!(
        r#"
[db]
path = "{root}/microblog.sqlite"

[server]
bind = "127.0.0.1:0"

[app]
secret_key = "lifecycle-secret"
posts_per_page = 10

[search]
backend = "{backend}"
path = "{root}/search.sqlite"

[queue]
path = "{root}/queue.sqlite"
poll_interval_ms = 10

[mail]
transport = "outbox"
outbox_dir = "{root}/outbox"
"#,
        root = root.display(),
        backend = search_backend,
    );
    toml::from_str(&config_content).unwrap()
}

async fn app_with(tmp: &TempDir, search_backend: &str) -> AppContext {
    let cfg = test_config(tmp, search_backend);
    run_migrations(&cfg).await.unwrap();
    AppContext::build(cfg).await.unwrap()
}

async fn register(app: &AppContext, name: &str) -> microblog::models::User {
    create_user(
        &app.store,
        name,
        &format!("{}@example.com", name),
        "correct horse",
    )
    .await
    .unwrap()
}

async fn search_ids(app: &AppContext, q: &str) -> (Vec<i64>, i64) {
    let (posts, total) = app
        .search
        .search::<Post>(app.pool(), q, 1, 10)
        .await
        .unwrap();
    (posts.iter().map(|p| p.id).collect(), total)
}

fn outbox(tmp: &TempDir) -> Vec<Email> {
    let dir = tmp.path().join("outbox");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    entries
        .map(|e| {
            let raw = std::fs::read_to_string(e.unwrap().path()).unwrap();
            serde_json::from_str(&raw).unwrap()
        })
        .collect()
}

struct Exploding;

#[async_trait]
impl Job for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    async fn run(&self, ctx: &JobContext, _args: Value) -> anyhow::Result<()> {
        ctx.set_progress(50).await?;
        bail!("upstream unavailable")
    }
}

struct Crashing;

#[async_trait]
impl Job for Crashing {
    fn name(&self) -> &str {
        "crashing"
    }

    async fn run(&self, _ctx: &JobContext, _args: Value) -> anyhow::Result<()> {
        panic!("worker thread crashed")
    }
}

struct VetoEverything;

impl PreCommitObserver for VetoEverything {
    fn before_commit(&self, changes: &ChangeSet) -> anyhow::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        bail!("writes are frozen")
    }
}

// ─── Index sync ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_committed_post_is_searchable() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "sqlite").await;
    let user = register(&app, "susan").await;

    let post = create_post(&app.store, user.id, "hola amigo", Some("es"))
        .await
        .unwrap();

    assert_eq!(search_ids(&app, "amigo").await, (vec![post.id], 1));
}

#[tokio::test]
async fn test_rolled_back_post_is_not_searchable() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "sqlite").await;
    let user = register(&app, "susan").await;

    let mut session = app.store.begin().await.unwrap();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO posts (body, timestamp, user_id) VALUES ('zanzibar', 0, ?) RETURNING id",
    )
    .bind(user.id)
    .fetch_one(session.conn())
    .await
    .unwrap();
    session.track_added(&Post {
        id,
        body: "zanzibar".into(),
        timestamp: 0,
        user_id: user.id,
        language: None,
    });
    session.rollback().await.unwrap();

    assert_eq!(search_ids(&app, "zanzibar").await, (vec![], 0));
}

#[tokio::test]
async fn test_update_and_delete_propagate_to_index() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "sqlite").await;
    let user = register(&app, "susan").await;

    let post = create_post(&app.store, user.id, "original walrus", None)
        .await
        .unwrap();
    update_post(&app.store, post.id, "edited narwhal").await.unwrap();

    assert_eq!(search_ids(&app, "walrus").await, (vec![], 0));
    assert_eq!(search_ids(&app, "narwhal").await, (vec![post.id], 1));

    delete_post(&app.store, post.id).await.unwrap();
    assert_eq!(search_ids(&app, "narwhal").await, (vec![], 0));
}

#[tokio::test]
async fn test_pre_commit_veto_rolls_back_without_indexing() {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("veto.sqlite"))
        .await
        .unwrap();
    create_primary_schema(&pool).await.unwrap();
    sqlx::query("INSERT INTO users (username, email, password_hash) VALUES ('u', 'u@x', 'x')")
        .execute(&pool)
        .await
        .unwrap();

    let index = Arc::new(MemoryIndex::new());
    let mut store = Store::new(pool);
    store.register_pre_commit(Arc::new(VetoEverything));
    store.register_post_commit(Arc::new(IndexSync::new(Some(index.clone()))));

    let err = create_post(&store, 1, "frozen text", None).await.unwrap_err();
    assert!(err.to_string().contains("writes are frozen"));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert!(index.is_empty());
}

// ─── Notifications ──────────────────────────────────────────────────

#[tokio::test]
async fn test_notification_replace_semantics() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "memory").await;
    let user = register(&app, "susan").await;

    for count in [3, 0] {
        let mut session = app.store.begin().await.unwrap();
        add_notification(&mut session, user.id, UNREAD_MESSAGE_COUNT, &count)
            .await
            .unwrap();
        session.commit().await.unwrap();
    }

    let items = poll(app.pool(), user.id, 0.0).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, UNREAD_MESSAGE_COUNT);
    assert_eq!(items[0].data(), json!(0));
}

#[tokio::test]
async fn test_poll_cursor_is_strict() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "memory").await;
    let user = register(&app, "susan").await;

    let mut session = app.store.begin().await.unwrap();
    let first = add_notification(&mut session, user.id, "a", &1).await.unwrap();
    let second = add_notification(&mut session, user.id, "b", &2).await.unwrap();
    session.commit().await.unwrap();
    assert!(second.timestamp > first.timestamp);

    let after_first = poll(app.pool(), user.id, first.timestamp).await.unwrap();
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_first[0].name, "b");
    assert!(poll(app.pool(), user.id, second.timestamp)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_messages_drive_unread_counter() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "memory").await;
    let susan = register(&app, "susan").await;
    let john = register(&app, "john").await;

    send_message(&app.store, john.id, &susan, "hi").await.unwrap();
    send_message(&app.store, john.id, &susan, "again").await.unwrap();

    let items = poll(app.pool(), susan.id, 0.0).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].data(), json!(2));

    let page = received_messages(&app.store, &susan, 1, 10).await.unwrap();
    assert_eq!(page.total, 2);

    let items = poll(app.pool(), susan.id, 0.0).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].data(), json!(0));
}

// ─── Tasks and worker ───────────────────────────────────────────────

#[tokio::test]
async fn test_progress_100_completes_task_once() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "memory").await;
    let user = register(&app, "susan").await;

    let task = launch_task(&app, user.id, EXPORT_POSTS, "Exporting posts...", json!({}))
        .await
        .unwrap();
    microblog::tasks::set_task_progress(&app, &task.id, 100)
        .await
        .unwrap();

    assert!(get_task(app.pool(), &task.id).await.unwrap().unwrap().complete);
    let progress: Vec<_> = poll(app.pool(), user.id, 0.0)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.name == TASK_PROGRESS)
        .collect();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].data()["progress"], json!(100));
    assert_eq!(progress[0].data()["task_id"], json!(task.id));
}

#[tokio::test]
async fn test_progress_session_survives_commit_from_another_process() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "memory").await;
    let other = AppContext::build(test_config(&tmp, "memory")).await.unwrap();
    let user = register(&app, "susan").await;

    let task = launch_task(&app, user.id, EXPORT_POSTS, "Exporting posts...", json!({}))
        .await
        .unwrap();

    // Read first, like the progress report does, then let a second
    // connection pool try to commit before this session writes.
    let mut session = app.store.begin().await.unwrap();
    let complete: bool = sqlx::query_scalar("SELECT complete FROM tasks WHERE id = ?")
        .bind(&task.id)
        .fetch_one(session.conn())
        .await
        .unwrap();
    assert!(!complete);

    let user_id = user.id;
    let writer = tokio::spawn(async move {
        create_post(&other.store, user_id, "written meanwhile", None).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    add_notification(
        &mut session,
        user.id,
        TASK_PROGRESS,
        &json!({ "task_id": task.id, "progress": 50 }),
    )
    .await
    .unwrap();
    session.commit().await.unwrap();

    let post = writer.await.unwrap().unwrap();
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE id = ?")
        .bind(post.id)
        .fetch_one(app.pool())
        .await
        .unwrap();
    assert_eq!(stored, 1);

    let (finish, _) = tokio::join!(
        microblog::tasks::set_task_progress(&app, &task.id, 100),
        async {
            let other = AppContext::build(test_config(&tmp, "memory")).await.unwrap();
            create_post(&other.store, user_id, "racing the final report", None)
                .await
                .unwrap();
        }
    );
    finish.unwrap();
    assert!(get_task(app.pool(), &task.id).await.unwrap().unwrap().complete);
}

#[tokio::test]
async fn test_evicted_job_counts_as_complete() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "memory").await;
    let user = register(&app, "susan").await;

    let task = launch_task(&app, user.id, EXPORT_POSTS, "x", json!({}))
        .await
        .unwrap();
    assert_eq!(task_progress(app.queue.as_ref(), &task).await.unwrap(), 0);

    app.queue
        .finish(&task.id, JobStatus::Finished, None)
        .await
        .unwrap();
    app.queue.purge_expired(0).await.unwrap();

    assert_eq!(task_progress(app.queue.as_ref(), &task).await.unwrap(), 100);
}

#[tokio::test]
async fn test_failing_and_crashing_jobs_complete_their_tasks() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "memory").await;
    let user = register(&app, "susan").await;

    let failing = launch_task(&app, user.id, "exploding", "x", json!({}))
        .await
        .unwrap();
    let crashing = launch_task(&app, user.id, "crashing", "y", json!({}))
        .await
        .unwrap();

    let mut registry = JobRegistry::new();
    registry.register(Arc::new(Exploding));
    registry.register(Arc::new(Crashing));
    let worker = Worker::new(app.clone(), registry);
    assert_eq!(worker.run(true).await.unwrap(), 2);

    for task in [&failing, &crashing] {
        assert!(get_task(app.pool(), &task.id).await.unwrap().unwrap().complete);
        let job = app.queue.fetch(&task.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress(), Some(100));
    }
}

#[tokio::test]
async fn test_export_posts_job_mails_archive() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, "memory").await;
    let user = register(&app, "susan").await;
    create_post(&app.store, user.id, "first post", None)
        .await
        .unwrap();
    create_post(&app.store, user.id, "second post", None)
        .await
        .unwrap();

    let task = launch_task(&app, user.id, EXPORT_POSTS, "Exporting posts...", json!({}))
        .await
        .unwrap();
    let worker = Worker::new(app.clone(), JobRegistry::with_builtins());
    assert_eq!(worker.run(true).await.unwrap(), 1);

    assert!(get_task(app.pool(), &task.id).await.unwrap().unwrap().complete);
    assert_eq!(
        app.queue.fetch(&task.id).await.unwrap().status,
        JobStatus::Finished
    );

    let mails = outbox(&tmp);
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].recipients, vec!["susan@example.com".to_string()]);
    let attachment = &mails[0].attachments[0];
    assert_eq!(attachment.filename, "posts.json");
    assert_eq!(attachment.content_type, "application/json");

    let archive: Value = serde_json::from_str(&attachment.data).unwrap();
    let bodies: Vec<&str> = archive["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["body"].as_str().unwrap())
        .collect();
    assert_eq!(bodies, vec!["first post", "second post"]);
}
