//! Primary store with explicit transactional hooks.
//!
//! Writes go through a [`Session`], a thin wrapper over a SQLite
//! transaction that records which entities were created, modified or
//! deleted. On [`Session::commit`] the recorded [`ChangeSet`] is frozen and
//! handed to the registered observers:
//!
//! ```text
//!   track_added / track_updated / track_deleted
//!                    │
//!                    ▼
//!              ChangeSet (frozen)
//!                    │
//!      PreCommitObserver::before_commit  ── Err ──▶ rollback, nothing else runs
//!                    │ Ok
//!                    ▼
//!               COMMIT ──────────────────── Err ──▶ error, no post-commit
//!                    │ Ok
//!                    ▼
//!      PostCommitObserver::after_commit(&ChangeSet)
//! ```
//!
//! A session dropped without `commit` rolls back and fires no observer.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::index_sync::IndexDocument;

/// A row type that can be tracked by a [`Session`].
pub trait Entity: Sized + Send + Unpin {
    /// Table the entity lives in.
    const TABLE: &'static str;
    /// Column list used by generic `SELECT`s.
    const COLUMNS: &'static str;

    /// Primary key rendered as text.
    fn key(&self) -> String;

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self>;

    /// Search document for this entity. Only indexable types return `Some`.
    fn index_document(&self) -> Option<IndexDocument> {
        None
    }
}

/// Snapshot of one entity touched in a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub table: &'static str,
    pub key: String,
    pub document: Option<IndexDocument>,
}

impl TrackedEntity {
    fn of<E: Entity>(entity: &E) -> Self {
        Self {
            table: E::TABLE,
            key: entity.key(),
            document: entity.index_document(),
        }
    }
}

type EntityKey = (&'static str, String);

/// Entities created, modified and deleted within one transaction.
///
/// The three sets are disjoint: an entity created and then modified stays
/// created, one created and then deleted is dropped entirely, and one
/// modified and then deleted is reported as deleted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    added: BTreeMap<EntityKey, TrackedEntity>,
    updated: BTreeMap<EntityKey, TrackedEntity>,
    deleted: BTreeMap<EntityKey, TrackedEntity>,
}

impl ChangeSet {
    pub fn added(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.added.values()
    }

    pub fn updated(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.updated.values()
    }

    pub fn deleted(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.deleted.values()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    fn record_added(&mut self, tracked: TrackedEntity) {
        let k = (tracked.table, tracked.key.clone());
        // A reused key after a delete in the same transaction is a new row.
        self.deleted.remove(&k);
        self.updated.remove(&k);
        self.added.insert(k, tracked);
    }

    fn record_updated(&mut self, tracked: TrackedEntity) {
        let k = (tracked.table, tracked.key.clone());
        if self.deleted.contains_key(&k) {
            return;
        }
        if let Some(slot) = self.added.get_mut(&k) {
            *slot = tracked;
        } else {
            self.updated.insert(k, tracked);
        }
    }

    fn record_deleted(&mut self, tracked: TrackedEntity) {
        let k = (tracked.table, tracked.key.clone());
        if self.added.remove(&k).is_some() {
            return;
        }
        self.updated.remove(&k);
        self.deleted.insert(k, tracked);
    }
}

/// Runs before the transaction commits. Returning an error aborts the
/// commit and rolls the transaction back.
pub trait PreCommitObserver: Send + Sync {
    fn before_commit(&self, changes: &ChangeSet) -> Result<()>;
}

/// Runs after a successful commit. Observers cannot fail the commit; they
/// log and swallow their own errors.
#[async_trait]
pub trait PostCommitObserver: Send + Sync {
    async fn after_commit(&self, changes: &ChangeSet);
}

/// Handle to the primary database plus its registered commit observers.
///
/// Observers are registered while the store is being assembled (before it
/// is shared behind an `Arc`).
pub struct Store {
    pool: SqlitePool,
    pre_commit: Vec<Arc<dyn PreCommitObserver>>,
    post_commit: Vec<Arc<dyn PostCommitObserver>>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            pre_commit: Vec::new(),
            post_commit: Vec::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn register_pre_commit(&mut self, observer: Arc<dyn PreCommitObserver>) {
        self.pre_commit.push(observer);
    }

    pub fn register_post_commit(&mut self, observer: Arc<dyn PostCommitObserver>) {
        self.post_commit.push(observer);
    }

    /// Start a tracked transaction.
    ///
    /// The write lock is taken up front (`BEGIN IMMEDIATE`) so a session that
    /// reads before it writes cannot lose its snapshot to a commit from
    /// another process; concurrent writers wait out the busy timeout instead.
    pub async fn begin(&self) -> Result<Session<'_>> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Session {
            store: self,
            tx,
            changes: ChangeSet::default(),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// One primary-store transaction with change tracking.
pub struct Session<'s> {
    store: &'s Store,
    tx: Transaction<'static, Sqlite>,
    changes: ChangeSet,
}

impl<'s> Session<'s> {
    /// Connection to run statements on inside this transaction.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub fn track_added<E: Entity>(&mut self, entity: &E) {
        self.changes.record_added(TrackedEntity::of(entity));
    }

    pub fn track_updated<E: Entity>(&mut self, entity: &E) {
        self.changes.record_updated(TrackedEntity::of(entity));
    }

    pub fn track_deleted<E: Entity>(&mut self, entity: &E) {
        self.changes.record_deleted(TrackedEntity::of(entity));
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Commit the transaction and notify observers.
    ///
    /// Returns the change set that was handed to the post-commit observers.
    pub async fn commit(self) -> Result<ChangeSet> {
        let Session { store, tx, changes } = self;

        for observer in &store.pre_commit {
            if let Err(e) = observer.before_commit(&changes) {
                tracing::debug!(error = %e, "pre-commit observer rejected transaction");
                tx.rollback().await?;
                return Err(e);
            }
        }

        tx.commit().await?;

        for observer in &store.post_commit {
            observer.after_commit(&changes).await;
        }

        Ok(changes)
    }

    /// Discard every write made in this session. No observer runs.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
