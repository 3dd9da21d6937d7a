//! Shared application context.
//!
//! One [`AppContext`] is built per process (`serve`, `worker`, the CLI
//! commands) and cloned into handlers and jobs. Building it wires the
//! [`IndexSync`] bridge into the store as a post-commit observer, so every
//! committed session keeps the search index current.

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::email::Mailer;
use crate::index_sync::IndexSync;
use crate::queue::{JobQueue, SqliteQueue};
use crate::search_index::create_index;
use crate::store::Store;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub queue: Arc<dyn JobQueue>,
    pub search: Arc<IndexSync>,
    pub mailer: Arc<Mailer>,
}

impl AppContext {
    /// Open every backing service named by the configuration.
    ///
    /// Schemas are expected to exist already (`microblog init`).
    pub async fn build(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let index = create_index(&config.search).await?;
        let search = Arc::new(IndexSync::new(index));
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteQueue::open(&config.queue.path).await?);
        let mailer = Arc::new(Mailer::from_config(&config.mail)?);

        let mut store = Store::new(pool);
        store.register_post_commit(search.clone());

        tracing::debug!(
            db = %config.db.path.display(),
            queue = %config.queue.path.display(),
            search = search.is_enabled(),
            "application context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            queue,
            search,
            mailer,
        })
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        self.store.pool()
    }
}
