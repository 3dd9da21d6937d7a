//! Task lifecycle.
//!
//! A [`Task`] row mirrors one queued job for the user who launched it. The
//! job reports progress from the worker process through
//! [`set_task_progress`], which is the only code that marks a task
//! complete. Readers go through [`task_progress`], which treats a job the
//! queue has already evicted as finished.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::app::AppContext;
use crate::models::Task;
use crate::notifications::add_notification;
use crate::queue::{JobQueue, QueueError};
use crate::store::Entity;

/// Name of the notification carrying `{task_id, progress}`.
pub const TASK_PROGRESS: &str = "task_progress";

/// An in-progress task as reported to its owner.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskView {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub progress: i64,
}

/// Queue `name` for `user_id` and record the task.
///
/// Callers that must not run two copies of a job check
/// [`tasks_in_progress`] first.
pub async fn launch_task(
    app: &AppContext,
    user_id: i64,
    name: &str,
    description: &str,
    args: Value,
) -> Result<Task> {
    let job_id = app.queue.enqueue(name, user_id, args).await?;

    let task = Task {
        id: job_id,
        name: name.to_string(),
        description: Some(description.to_string()),
        user_id,
        complete: false,
    };

    let mut session = app.store.begin().await?;
    sqlx::query(
        "INSERT INTO tasks (id, name, description, user_id, complete) VALUES (?, ?, ?, ?, 0)",
    )
    .bind(&task.id)
    .bind(&task.name)
    .bind(&task.description)
    .bind(task.user_id)
    .execute(session.conn())
    .await?;
    session.track_added(&task);
    session.commit().await?;

    tracing::info!(task_id = %task.id, name, user_id, "task launched");
    Ok(task)
}

/// Incomplete tasks of a user, optionally only those named `name`.
pub async fn tasks_in_progress(
    pool: &SqlitePool,
    user_id: i64,
    name: Option<&str>,
) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE user_id = ? AND complete = 0 AND (? IS NULL OR name = ?) ORDER BY rowid",
        Task::COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(name)
        .bind(name)
        .fetch_all(pool)
        .await?;
    let tasks = rows
        .iter()
        .map(Task::from_row)
        .collect::<sqlx::Result<Vec<_>>>()?;
    Ok(tasks)
}

pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?", Task::COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(Task::from_row).transpose()?)
}

/// Best-effort progress read. An evicted job counts as 100, a job that has
/// not reported yet as 0.
pub async fn task_progress(queue: &dyn JobQueue, task: &Task) -> Result<i64> {
    match queue.fetch(&task.id).await {
        Ok(job) => Ok(job.progress().unwrap_or(0)),
        Err(QueueError::NoSuchJob(_)) => Ok(100),
        Err(e) => Err(e.into()),
    }
}

/// In-progress tasks of a user with their current progress.
pub async fn task_views(app: &AppContext, user_id: i64) -> Result<Vec<TaskView>> {
    let tasks = tasks_in_progress(app.pool(), user_id, None).await?;
    let mut views = Vec::with_capacity(tasks.len());
    for task in tasks {
        let progress = task_progress(app.queue.as_ref(), &task).await?;
        views.push(TaskView {
            id: task.id,
            name: task.name,
            description: task.description,
            progress,
        });
    }
    Ok(views)
}

/// Record progress for a running job.
///
/// Stores `progress` in the job's queue metadata, then in one transaction
/// replaces the owner's `task_progress` notification and, at 100 or more,
/// marks the task complete. Calling it again with the same value is
/// harmless.
pub async fn set_task_progress(app: &AppContext, job_id: &str, progress: i64) -> Result<()> {
    match app.queue.set_meta(job_id, "progress", json!(progress)).await {
        Ok(()) => {}
        Err(QueueError::NoSuchJob(_)) => {
            tracing::warn!(job_id, "job no longer in queue; progress not stored there");
        }
        Err(e) => return Err(e.into()),
    }

    let mut session = app.store.begin().await?;
    let sql = format!("SELECT {} FROM tasks WHERE id = ?", Task::COLUMNS);
    let row = sqlx::query(&sql)
        .bind(job_id)
        .fetch_optional(session.conn())
        .await?;
    let Some(mut task) = row.as_ref().map(Task::from_row).transpose()? else {
        tracing::warn!(job_id, progress, "progress reported for unknown task");
        session.rollback().await?;
        return Ok(());
    };

    add_notification(
        &mut session,
        task.user_id,
        TASK_PROGRESS,
        &json!({ "task_id": job_id, "progress": progress }),
    )
    .await?;

    if progress >= 100 && !task.complete {
        sqlx::query("UPDATE tasks SET complete = 1 WHERE id = ?")
            .bind(job_id)
            .execute(session.conn())
            .await?;
        task.complete = true;
        session.track_updated(&task);
    }

    session.commit().await?;
    tracing::debug!(job_id, progress, "task progress recorded");
    Ok(())
}
