//! Index sync bridge.
//!
//! Keeps the full-text search index eventually consistent with the primary
//! store. [`IndexSync`] is registered as a post-commit observer on the
//! [`Store`](crate::store::Store); after every successful commit it turns
//! the transaction's [`ChangeSet`] into an [`IndexMutationBatch`] and applies
//! it. Call sites never touch the index directly.
//!
//! Deleted entities are removed from the index, so a search never returns a
//! row that no longer exists after its deletion commits.
//!
//! When the index is not configured every operation is a no-op, and index
//! errors are logged and swallowed: the primary write has already
//! succeeded and nothing retries the failed mutation.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::search_index::SearchIndex;
use crate::store::{ChangeSet, Entity, PostCommitObserver};

/// Largest page a search will fetch. Row lookup binds every hit id twice,
/// so this also bounds the statement's parameter count.
pub const MAX_PER_PAGE: i64 = 100;

/// Capability marker for entities mirrored into the search index.
pub trait Indexable: Entity {
    /// Index (per entity type) the documents are stored under.
    const INDEX: &'static str;
    /// Names of the fields copied into the index.
    const SEARCHABLE: &'static [&'static str];

    /// Integer primary key, used as the document id.
    fn doc_id(&self) -> i64;

    fn searchable_value(&self, field: &str) -> Option<Value>;
}

/// The searchable fields of one entity, addressed by index name and id.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub index: &'static str,
    pub id: i64,
    pub fields: Map<String, Value>,
}

impl IndexDocument {
    pub fn of<T: Indexable>(entity: &T) -> Self {
        let mut fields = Map::new();
        for field in T::SEARCHABLE {
            let value = entity.searchable_value(field).unwrap_or(Value::Null);
            fields.insert((*field).to_string(), value);
        }
        Self {
            index: T::INDEX,
            id: entity.doc_id(),
            fields,
        }
    }
}

/// Index mutations derived from one committed transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexMutationBatch {
    pub upserts: Vec<IndexDocument>,
    pub removals: Vec<IndexDocument>,
}

impl IndexMutationBatch {
    /// Keep only indexable entities: created and modified ones are
    /// upserted, deleted ones removed.
    pub fn from_changes(changes: &ChangeSet) -> Self {
        let upserts = changes
            .added()
            .chain(changes.updated())
            .filter_map(|t| t.document.clone())
            .collect();
        let removals = changes
            .deleted()
            .filter_map(|t| t.document.clone())
            .collect();
        Self { upserts, removals }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Result of applying a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
}

/// Bridge between the primary store and the search index.
pub struct IndexSync {
    index: Option<Arc<dyn SearchIndex>>,
}

impl IndexSync {
    pub fn new(index: Option<Arc<dyn SearchIndex>>) -> Self {
        Self { index }
    }

    pub fn disabled() -> Self {
        Self { index: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.index.is_some()
    }

    /// Apply a batch, logging and skipping every mutation that fails.
    pub async fn apply(&self, batch: &IndexMutationBatch) -> ApplyReport {
        let mut report = ApplyReport::default();
        let Some(index) = &self.index else {
            return report;
        };

        for doc in &batch.upserts {
            match index.index(doc.index, doc.id, &doc.fields).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        index = doc.index,
                        id = doc.id,
                        error = %e,
                        "search index upsert failed; index may lag the store"
                    );
                }
            }
        }

        for doc in &batch.removals {
            match index.delete(doc.index, doc.id).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        index = doc.index,
                        id = doc.id,
                        error = %e,
                        "search index removal failed; index may lag the store"
                    );
                }
            }
        }

        report
    }

    /// Full-text search over one entity type.
    ///
    /// Returns the page of entities in relevance order together with the
    /// total number of hits the index reported. `per_page` is capped at
    /// [`MAX_PER_PAGE`]; a failing index query yields an empty page.
    pub async fn search<T: Indexable>(
        &self,
        pool: &SqlitePool,
        expression: &str,
        page: i64,
        per_page: i64,
    ) -> Result<(Vec<T>, i64)> {
        let Some(index) = &self.index else {
            return Ok((Vec::new(), 0));
        };
        if expression.trim().is_empty() || per_page < 1 {
            return Ok((Vec::new(), 0));
        }

        let per_page = per_page.min(MAX_PER_PAGE);
        let page = page.max(1);
        let from = (page - 1) * per_page;
        let hits = match index.query(T::INDEX, expression, from, per_page).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(index = T::INDEX, error = %e, "search index query failed");
                return Ok((Vec::new(), 0));
            }
        };

        if hits.total == 0 || hits.ids.is_empty() {
            return Ok((Vec::new(), hits.total));
        }

        let rows = fetch_in_order::<T>(pool, &hits.ids).await?;
        Ok((rows, hits.total))
    }

    /// Re-upsert every row of an entity type. Returns the number of
    /// documents written.
    pub async fn reindex<T: Indexable>(&self, pool: &SqlitePool) -> Result<usize> {
        let Some(index) = &self.index else {
            bail!("search index is not configured");
        };

        const BATCH: i64 = 500;
        let sql = format!(
            "SELECT {} FROM {} WHERE id > ? ORDER BY id LIMIT ?",
            T::COLUMNS,
            T::TABLE
        );

        let mut last_id = i64::MIN;
        let mut written = 0usize;
        loop {
            let rows = sqlx::query(&sql)
                .bind(last_id)
                .bind(BATCH)
                .fetch_all(pool)
                .await?;
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                let entity = T::from_row(row)?;
                let doc = IndexDocument::of(&entity);
                index.index(doc.index, doc.id, &doc.fields).await?;
                last_id = doc.id;
                written += 1;
            }
        }

        tracing::info!(index = T::INDEX, documents = written, "reindex complete");
        Ok(written)
    }
}

#[async_trait]
impl PostCommitObserver for IndexSync {
    async fn after_commit(&self, changes: &ChangeSet) {
        if self.index.is_none() {
            return;
        }
        let batch = IndexMutationBatch::from_changes(changes);
        if batch.is_empty() {
            return;
        }
        let report = self.apply(&batch).await;
        tracing::debug!(
            applied = report.applied,
            failed = report.failed,
            "index mutation batch applied"
        );
    }
}

/// Load rows by id, ordered to match `ids` (the index's relevance order).
/// Ids with no matching row are skipped.
async fn fetch_in_order<T: Indexable>(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<T>> {
    let placeholders = vec!["?"; ids.len()].join(", ");
    let positions = (0..ids.len())
        .map(|i| format!("WHEN ? THEN {}", i))
        .collect::<Vec<_>>()
        .join(" ");
    let sql = format!(
        "SELECT {} FROM {} WHERE id IN ({}) ORDER BY CASE id {} END",
        T::COLUMNS,
        T::TABLE,
        placeholders,
        positions
    );

    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(*id);
    }
    for id in ids {
        query = query.bind(*id);
    }

    let rows = query.fetch_all(pool).await?;
    let entities = rows
        .iter()
        .map(T::from_row)
        .collect::<sqlx::Result<Vec<T>>>()?;
    Ok(entities)
}
