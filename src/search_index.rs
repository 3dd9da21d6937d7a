//! Full-text search index backends.
//!
//! The index is an external service keyed by `(index name, integer id)`.
//! [`SearchIndex`] is the seam; the configured backend is built by
//! [`create_index`]:
//!
//! | Backend | Type | Notes |
//! |---------|------|-------|
//! | `disabled` | - | no index; search returns nothing, writes are skipped |
//! | `memory` | [`MemoryIndex`] | in-process term matching, lost on restart |
//! | `sqlite` | [`SqliteFtsIndex`] | FTS5 table in its own database file |
//! | `elasticsearch` | [`ElasticsearchIndex`] | REST API over `reqwest` |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{SearchBackend, SearchConfig};
use crate::db;

/// One page of hits: ids in relevance order plus the total hit count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHits {
    pub ids: Vec<i64>,
    pub total: i64,
}

/// A document store supporting upsert, delete and paginated free-text query.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Insert or replace a document.
    async fn index(&self, index: &str, id: i64, fields: &Map<String, Value>) -> Result<()>;

    /// Remove a document. Removing a missing document succeeds.
    async fn delete(&self, index: &str, id: i64) -> Result<()>;

    /// Match `expression` against every field of the documents in `index`.
    async fn query(&self, index: &str, expression: &str, from: i64, size: i64)
        -> Result<SearchHits>;
}

/// Build the configured backend. `Ok(None)` means search is disabled.
pub async fn create_index(config: &SearchConfig) -> Result<Option<Arc<dyn SearchIndex>>> {
    match config.backend {
        SearchBackend::Disabled => Ok(None),
        SearchBackend::Memory => Ok(Some(Arc::new(MemoryIndex::new()))),
        SearchBackend::Sqlite => {
            let Some(path) = &config.path else {
                bail!("search.path is required for the sqlite backend");
            };
            Ok(Some(Arc::new(SqliteFtsIndex::open(path).await?)))
        }
        SearchBackend::Elasticsearch => {
            let Some(url) = &config.url else {
                bail!("search.url is required for the elasticsearch backend");
            };
            Ok(Some(Arc::new(ElasticsearchIndex::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?)))
        }
    }
}

/// Lower-cased alphanumeric terms of a text.
fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn field_text(fields: &Map<String, Value>) -> String {
    fields
        .values()
        .filter_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ============ In-memory ============

/// In-process index for development and tests.
///
/// Scores a document by how many times the query terms occur in it; ties
/// are broken by ascending id.
pub struct MemoryIndex {
    docs: RwLock<HashMap<(String, i64), Vec<String>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: &str, id: i64) -> bool {
        self.docs
            .read()
            .map(|d| d.contains_key(&(index.to_string(), id)))
            .unwrap_or(false)
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn index(&self, index: &str, id: i64, fields: &Map<String, Value>) -> Result<()> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| anyhow::anyhow!("memory index lock poisoned"))?;
        docs.insert((index.to_string(), id), terms(&field_text(fields)));
        Ok(())
    }

    async fn delete(&self, index: &str, id: i64) -> Result<()> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| anyhow::anyhow!("memory index lock poisoned"))?;
        docs.remove(&(index.to_string(), id));
        Ok(())
    }

    async fn query(
        &self,
        index: &str,
        expression: &str,
        from: i64,
        size: i64,
    ) -> Result<SearchHits> {
        let wanted = terms(expression);
        if wanted.is_empty() {
            return Ok(SearchHits::default());
        }
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow::anyhow!("memory index lock poisoned"))?;

        let mut scored: Vec<(i64, usize)> = docs
            .iter()
            .filter(|((name, _), _)| name == index)
            .filter_map(|((_, id), doc_terms)| {
                let score = doc_terms.iter().filter(|t| wanted.contains(t)).count();
                (score > 0).then_some((*id, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let total = scored.len() as i64;
        let ids = scored
            .into_iter()
            .skip(from.max(0) as usize)
            .take(size.max(0) as usize)
            .map(|(id, _)| id)
            .collect();
        Ok(SearchHits { ids, total })
    }
}

// ============ SQLite FTS5 ============

/// FTS5-backed index stored in its own SQLite file.
pub struct SqliteFtsIndex {
    pool: SqlitePool,
}

impl SqliteFtsIndex {
    /// Open (creating if needed) the index database.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        create_fts_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn create_fts_schema(pool: &SqlitePool) -> Result<()> {
    // FTS5 CREATE is not idempotent natively, so we check first
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='search_documents'",
    )
    .fetch_one(pool)
    .await?;

    if !exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE search_documents USING fts5(
                index_name UNINDEXED,
                doc_id UNINDEXED,
                fields_json UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Turn free text into an FTS5 query: every term quoted, any term matches.
fn fts_expression(expression: &str) -> Option<String> {
    let quoted: Vec<String> = terms(expression)
        .into_iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if quoted.is_empty() {
        None
    } else {
        Some(quoted.join(" OR "))
    }
}

#[async_trait]
impl SearchIndex for SqliteFtsIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn index(&self, index: &str, id: i64, fields: &Map<String, Value>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM search_documents WHERE index_name = ? AND doc_id = ?")
            .bind(index)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO search_documents (index_name, doc_id, fields_json, content) VALUES (?, ?, ?, ?)",
        )
        .bind(index)
        .bind(id)
        .bind(serde_json::to_string(fields)?)
        .bind(field_text(fields))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, index: &str, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM search_documents WHERE index_name = ? AND doc_id = ?")
            .bind(index)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        index: &str,
        expression: &str,
        from: i64,
        size: i64,
    ) -> Result<SearchHits> {
        let Some(fts) = fts_expression(expression) else {
            return Ok(SearchHits::default());
        };

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM search_documents WHERE search_documents MATCH ? AND index_name = ?",
        )
        .bind(&fts)
        .bind(index)
        .fetch_one(&self.pool)
        .await?;

        if total == 0 {
            return Ok(SearchHits::default());
        }

        let rows = sqlx::query(
            r#"
            SELECT doc_id
            FROM search_documents
            WHERE search_documents MATCH ? AND index_name = ?
            ORDER BY rank, doc_id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&fts)
        .bind(index)
        .bind(size)
        .bind(from)
        .fetch_all(&self.pool)
        .await?;

        let ids = rows.iter().map(|row| row.get::<i64, _>("doc_id")).collect();
        Ok(SearchHits { ids, total })
    }
}

// ============ Elasticsearch ============

/// Elasticsearch REST client.
///
/// Documents live at `/{index}/_doc/{id}`; queries use `multi_match` over
/// all fields with `from`/`size` pagination.
pub struct ElasticsearchIndex {
    base_url: String,
    client: reqwest::Client,
}

impl ElasticsearchIndex {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn doc_url(&self, index: &str, id: i64) -> String {
        format!("{}/{}/_doc/{}", self.base_url, index, id)
    }
}

/// Parse `hits.hits[]._id` and `hits.total` out of a search response.
/// `total` is an object (`{"value": n}`) on 7.x+ and a bare number before.
fn parse_hits(body: &Value) -> Result<SearchHits> {
    let hits = body
        .get("hits")
        .ok_or_else(|| anyhow::anyhow!("search response has no hits"))?;

    let total = match hits.get("total") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(obj) => obj.get("value").and_then(Value::as_i64).unwrap_or(0),
        None => 0,
    };

    let ids = hits
        .get("hits")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|h| h.get("_id"))
                .filter_map(|id| match id {
                    Value::String(s) => s.parse::<i64>().ok(),
                    Value::Number(n) => n.as_i64(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(SearchHits { ids, total })
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn index(&self, index: &str, id: i64, fields: &Map<String, Value>) -> Result<()> {
        let resp = self
            .client
            .put(self.doc_url(index, id))
            .json(fields)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("elasticsearch index error ({}): {}", status, body);
        }
        Ok(())
    }

    async fn delete(&self, index: &str, id: i64) -> Result<()> {
        let resp = self.client.delete(self.doc_url(index, id)).send().await?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        bail!("elasticsearch delete error ({}): {}", status, body);
    }

    async fn query(
        &self,
        index: &str,
        expression: &str,
        from: i64,
        size: i64,
    ) -> Result<SearchHits> {
        let body = json!({
            "query": { "multi_match": { "query": expression, "fields": ["*"] } },
            "from": from,
            "size": size,
        });
        let resp = self
            .client
            .post(format!("{}/{}/_search", self.base_url, index))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        // Nothing has been indexed yet.
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(SearchHits::default());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("elasticsearch search error ({}): {}", status, text);
        }

        let json: Value = resp.json().await?;
        parse_hits(&json)
    }
}
