//! Search index backends and atomic publication.
//!
//! Each backend (keyword FTS, optional vector) writes rows tagged with a
//! generation number. A build writes the next generation alongside the
//! currently published one, then flips the `published_generation` pointer in
//! `index_state`. Readers resolve the pointer inside the same SQL statement
//! they query with, so a query never observes a half-built index.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::HarnessError;
use crate::models::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Keyword,
    Vector,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Keyword => "keyword",
            BackendKind::Vector => "vector",
        }
    }
}

/// A candidate from one backend, before cross-backend normalization. The
/// raw score is only comparable to other scores from the same backend.
#[derive(Debug, Clone)]
pub struct BackendHit {
    pub path: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub raw_score: f64,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Write all documents as `generation`, returning the payload size in
    /// bytes. Must not touch any other generation.
    async fn build(
        &self,
        pool: &SqlitePool,
        project_id: &str,
        docs: &[Document],
        generation: i64,
    ) -> Result<i64>;

    /// Top-k candidates from the published generation.
    async fn search(
        &self,
        pool: &SqlitePool,
        project_id: &str,
        query: &str,
        k: i64,
    ) -> Result<Vec<BackendHit>>;

    /// Drop every generation except `keep`.
    async fn sweep(&self, pool: &SqlitePool, project_id: &str, keep: i64) -> Result<()>;
}

/// SQLite FTS5 backend with porter stemming.
pub struct KeywordBackend;

#[async_trait]
impl SearchBackend for KeywordBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Keyword
    }

    async fn build(
        &self,
        pool: &SqlitePool,
        project_id: &str,
        docs: &[Document],
        generation: i64,
    ) -> Result<i64> {
        let mut size: i64 = 0;
        for doc in docs {
            sqlx::query(
                "INSERT INTO docs_fts (project_id, generation, path, url, title, body) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(project_id)
            .bind(generation)
            .bind(&doc.path)
            .bind(&doc.url)
            .bind(&doc.title)
            .bind(&doc.body)
            .execute(pool)
            .await
            .context("inserting into docs_fts")?;
            size += (doc.title.len() + doc.body.len()) as i64;
        }
        Ok(size)
    }

    async fn search(
        &self,
        pool: &SqlitePool,
        project_id: &str,
        query: &str,
        k: i64,
    ) -> Result<Vec<BackendHit>> {
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT path, title, url,
                   snippet(docs_fts, 5, '[', ']', '…', 16) AS snip,
                   rank
            FROM docs_fts
            WHERE project_id = ?1
              AND generation = (
                  SELECT published_generation FROM index_state
                  WHERE project_id = ?1 AND backend = 'keyword'
              )
              AND docs_fts MATCH ?2
            ORDER BY rank
            LIMIT ?3
            "#,
        )
        .bind(project_id)
        .bind(&match_expr)
        .bind(k)
        .fetch_all(pool)
        .await
        .context("querying docs_fts")?;

        Ok(rows
            .iter()
            .map(|row| BackendHit {
                path: row.get("path"),
                title: row.get("title"),
                url: row.get("url"),
                snippet: row.get("snip"),
                // FTS5 rank is negative bm25; flip so larger is better.
                raw_score: -row.get::<f64, _>("rank"),
            })
            .collect())
    }

    async fn sweep(&self, pool: &SqlitePool, project_id: &str, keep: i64) -> Result<()> {
        sqlx::query("DELETE FROM docs_fts WHERE project_id = ? AND generation != ?")
            .bind(project_id)
            .bind(keep)
            .execute(pool)
            .await
            .context("sweeping docs_fts")?;
        Ok(())
    }
}

/// Quote every token so user input can never produce an FTS5 syntax error.
/// Tokens are ANDed, which is the FTS5 default for adjacent terms.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// Brute-force cosine scan over stored embeddings. Fine for the tens of
/// thousands of documents a docs site produces.
pub struct VectorBackend {
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
}

impl VectorBackend {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EmbeddingConfig) -> Self {
        VectorBackend { provider, config }
    }

    /// Title plus a bounded body prefix; whole bodies blow past embedding
    /// model context windows.
    fn embed_input(doc: &Document) -> String {
        format!("{}\n{}", doc.title, truncate_chars(&doc.body, 2000))
    }
}

#[async_trait]
impl SearchBackend for VectorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vector
    }

    async fn build(
        &self,
        pool: &SqlitePool,
        project_id: &str,
        docs: &[Document],
        generation: i64,
    ) -> Result<i64> {
        let texts: Vec<String> = docs.iter().map(Self::embed_input).collect();
        let vectors = embedding::embed_texts(&self.provider, &self.config, &texts).await?;

        let mut size: i64 = 0;
        for (doc, vector) in docs.iter().zip(&vectors) {
            let blob = embedding::vec_to_blob(vector);
            size += blob.len() as i64;
            sqlx::query(
                "INSERT INTO doc_vectors (project_id, generation, path, title, url, snippet, embedding) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(project_id)
            .bind(generation)
            .bind(&doc.path)
            .bind(&doc.title)
            .bind(&doc.url)
            .bind(truncate_chars(&doc.body, 200))
            .bind(&blob)
            .execute(pool)
            .await
            .context("inserting into doc_vectors")?;
        }
        info!(
            project = project_id,
            docs = docs.len(),
            model = self.provider.model_name(),
            "vector index built"
        );
        Ok(size)
    }

    async fn search(
        &self,
        pool: &SqlitePool,
        project_id: &str,
        query: &str,
        k: i64,
    ) -> Result<Vec<BackendHit>> {
        let query_vec = embedding::embed_query(&self.provider, &self.config, query).await?;

        let rows = sqlx::query(
            r#"
            SELECT path, title, url, snippet, embedding
            FROM doc_vectors
            WHERE project_id = ?1
              AND generation = (
                  SELECT published_generation FROM index_state
                  WHERE project_id = ?1 AND backend = 'vector'
              )
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
        .context("querying doc_vectors")?;

        let mut hits: Vec<BackendHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = embedding::blob_to_vec(&blob);
                BackendHit {
                    path: row.get("path"),
                    title: row.get("title"),
                    url: row.get("url"),
                    snippet: row.get("snippet"),
                    raw_score: embedding::cosine_similarity(&query_vec, &vec) as f64,
                }
            })
            .collect();
        hits.sort_by(|a, b| b.raw_score.total_cmp(&a.raw_score));
        hits.truncate(k.max(0) as usize);
        Ok(hits)
    }

    async fn sweep(&self, pool: &SqlitePool, project_id: &str, keep: i64) -> Result<()> {
        sqlx::query("DELETE FROM doc_vectors WHERE project_id = ? AND generation != ?")
            .bind(project_id)
            .bind(keep)
            .execute(pool)
            .await
            .context("sweeping doc_vectors")?;
        Ok(())
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RebuildOutcome {
    Built { generation: i64, doc_count: usize },
    /// Another build for the same (project, backend) was already in flight.
    Coalesced,
}

/// Owns the backends and serializes builds per (project, backend).
pub struct IndexManager {
    backends: Vec<Arc<dyn SearchBackend>>,
    building: Mutex<HashSet<(String, BackendKind)>>,
}

impl IndexManager {
    pub fn new(backends: Vec<Arc<dyn SearchBackend>>) -> Self {
        IndexManager {
            backends,
            building: Mutex::new(HashSet::new()),
        }
    }

    pub fn backend(&self, kind: BackendKind) -> Option<&Arc<dyn SearchBackend>> {
        self.backends.iter().find(|b| b.kind() == kind)
    }

    pub fn backends(&self) -> &[Arc<dyn SearchBackend>] {
        &self.backends
    }

    /// Rebuild one backend's index from the documents table. Concurrent
    /// requests for the same (project, backend) coalesce: the second caller
    /// returns immediately and relies on the in-flight build.
    pub async fn rebuild(
        &self,
        pool: &SqlitePool,
        project_id: &str,
        kind: BackendKind,
    ) -> Result<RebuildOutcome, HarnessError> {
        let backend = self
            .backend(kind)
            .ok_or_else(|| HarnessError::Build(format!("no {} backend configured", kind.as_str())))?;

        let key = (project_id.to_string(), kind);
        {
            let mut building = self.building.lock().unwrap_or_else(|e| e.into_inner());
            if !building.insert(key.clone()) {
                debug!(project = project_id, backend = kind.as_str(), "build coalesced");
                return Ok(RebuildOutcome::Coalesced);
            }
        }

        let result = self.rebuild_inner(pool, project_id, backend).await;

        let mut building = self.building.lock().unwrap_or_else(|e| e.into_inner());
        building.remove(&key);
        result
    }

    async fn rebuild_inner(
        &self,
        pool: &SqlitePool,
        project_id: &str,
        backend: &Arc<dyn SearchBackend>,
    ) -> Result<RebuildOutcome, HarnessError> {
        let kind = backend.kind();
        let published = published_generation(pool, project_id, kind)
            .await
            .map_err(HarnessError::Other)?;
        let generation = published + 1;

        let docs = crate::store::all_documents(pool, project_id)
            .await
            .map_err(HarnessError::Other)?;

        let size_bytes = match backend.build(pool, project_id, &docs, generation).await {
            Ok(size) => size,
            Err(e) => {
                // Leave the published generation untouched; drop the
                // partial one.
                if let Err(sweep_err) = backend.sweep(pool, project_id, published).await {
                    warn!(project = project_id, error = %sweep_err, "failed to drop partial index generation");
                }
                return Err(HarnessError::Build(format!(
                    "{} index build failed: {}",
                    kind.as_str(),
                    e
                )));
            }
        };

        sqlx::query(
            r#"
            INSERT INTO index_state (project_id, backend, published_generation, built_at, doc_count, size_bytes)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_id, backend) DO UPDATE SET
                published_generation = excluded.published_generation,
                built_at = excluded.built_at,
                doc_count = excluded.doc_count,
                size_bytes = excluded.size_bytes
            "#,
        )
        .bind(project_id)
        .bind(kind.as_str())
        .bind(generation)
        .bind(Utc::now().to_rfc3339())
        .bind(docs.len() as i64)
        .bind(size_bytes)
        .execute(pool)
        .await
        .map_err(HarnessError::Db)?;

        backend
            .sweep(pool, project_id, generation)
            .await
            .map_err(HarnessError::Other)?;

        info!(
            project = project_id,
            backend = kind.as_str(),
            generation,
            docs = docs.len(),
            "index published"
        );
        Ok(RebuildOutcome::Built {
            generation,
            doc_count: docs.len(),
        })
    }
}

/// The currently published generation, or 0 if the backend has never built.
pub async fn published_generation(
    pool: &SqlitePool,
    project_id: &str,
    kind: BackendKind,
) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT published_generation FROM index_state WHERE project_id = ? AND backend = ?",
    )
    .bind(project_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(g,)| g).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlDefaults;
    use crate::models::{ProjectConfig, ProjectConfigPatch};
    use tokio::sync::Notify;

    fn test_config() -> ProjectConfig {
        ProjectConfig::resolve(ProjectConfigPatch::default(), &CrawlDefaults::default()).unwrap()
    }

    fn doc(path: &str, title: &str, body: &str) -> Document {
        Document {
            project_id: "p".to_string(),
            path: path.to_string(),
            url: format!("https://docs.test/{}", path),
            title: title.to_string(),
            body: body.to_string(),
            word_count: body.split_whitespace().count() as i64,
            scraped_at: Utc::now(),
        }
    }

    async fn seeded_pool(docs: &[Document]) -> SqlitePool {
        let pool = crate::db::connect_memory().await.unwrap();
        crate::store::create_project(&pool, "p", "https://docs.test", &test_config())
            .await
            .unwrap();
        for d in docs {
            crate::store::upsert_document(&pool, d).await.unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn keyword_build_and_search() {
        let pool = seeded_pool(&[
            doc("install", "Installation", "install the binary with cargo and verify"),
            doc("config", "Configuration", "settings live in a toml file with sections"),
        ])
        .await;
        let manager = IndexManager::new(vec![Arc::new(KeywordBackend)]);

        let outcome = manager.rebuild(&pool, "p", BackendKind::Keyword).await.unwrap();
        assert!(matches!(
            outcome,
            RebuildOutcome::Built { generation: 1, doc_count: 2 }
        ));

        let backend = manager.backend(BackendKind::Keyword).unwrap();
        let hits = backend.search(&pool, "p", "cargo install", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "install");
        assert!(hits[0].raw_score > 0.0);
        assert!(hits[0].snippet.contains('['));
    }

    #[tokio::test]
    async fn unpublished_generation_is_invisible() {
        let pool = seeded_pool(&[doc("a", "Alpha", "alpha words to find")]).await;
        let backend = KeywordBackend;

        // Built but never published: no index_state row points at it.
        backend.build(&pool, "p", &[doc("a", "Alpha", "alpha words to find")], 1)
            .await
            .unwrap();
        let hits = backend.search(&pool, "p", "alpha", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn rebuild_bumps_generation_and_sweeps() {
        let pool = seeded_pool(&[doc("a", "Alpha", "alpha body words here")]).await;
        let manager = IndexManager::new(vec![Arc::new(KeywordBackend)]);

        manager.rebuild(&pool, "p", BackendKind::Keyword).await.unwrap();
        let outcome = manager.rebuild(&pool, "p", BackendKind::Keyword).await.unwrap();
        assert!(matches!(outcome, RebuildOutcome::Built { generation: 2, .. }));

        let stale: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM docs_fts WHERE project_id = 'p' AND generation != 2")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stale.0, 0);

        let hits = manager
            .backend(BackendKind::Keyword)
            .unwrap()
            .search(&pool, "p", "alpha", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn missing_backend_is_a_build_error() {
        let pool = seeded_pool(&[]).await;
        let manager = IndexManager::new(vec![Arc::new(KeywordBackend)]);
        let err = manager.rebuild(&pool, "p", BackendKind::Vector).await.unwrap_err();
        assert!(matches!(err, HarnessError::Build(_)));
    }

    struct GatedBackend {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl SearchBackend for GatedBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Keyword
        }
        async fn build(&self, _: &SqlitePool, _: &str, _: &[Document], _: i64) -> Result<i64> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(0)
        }
        async fn search(&self, _: &SqlitePool, _: &str, _: &str, _: i64) -> Result<Vec<BackendHit>> {
            Ok(Vec::new())
        }
        async fn sweep(&self, _: &SqlitePool, _: &str, _: i64) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_rebuilds_coalesce() {
        let pool = seeded_pool(&[]).await;
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let manager = Arc::new(IndexManager::new(vec![Arc::new(GatedBackend {
            entered: entered.clone(),
            release: release.clone(),
        })]));

        let m1 = manager.clone();
        let p1 = pool.clone();
        let first = tokio::spawn(async move { m1.rebuild(&p1, "p", BackendKind::Keyword).await });
        // Wait for the first build to hold the lock before racing it.
        entered.notified().await;
        let second = manager.rebuild(&pool, "p", BackendKind::Keyword).await.unwrap();
        assert_eq!(second, RebuildOutcome::Coalesced);

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, RebuildOutcome::Built { .. }));
    }

    #[test]
    fn match_expr_sanitizes() {
        assert_eq!(fts_match_expr("hello world"), Some("\"hello\" \"world\"".to_string()));
        assert_eq!(fts_match_expr("a\"b"), Some("\"ab\"".to_string()));
        assert_eq!(fts_match_expr("  \"  "), None);
        assert_eq!(fts_match_expr(""), None);
    }
}
