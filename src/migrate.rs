//! Schema migrations. Every statement is idempotent so `run` can be called
//! unconditionally at startup.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            base_url TEXT NOT NULL,
            config_json TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'created',
            last_error TEXT,
            created_at TEXT NOT NULL,
            last_scraped_at TEXT,
            last_scrape_duration_ms INTEGER,
            pages_scraped INTEGER NOT NULL DEFAULT 0,
            page_errors INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating projects table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            project_id TEXT NOT NULL,
            path TEXT NOT NULL,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            word_count INTEGER NOT NULL,
            scraped_at TEXT NOT NULL,
            PRIMARY KEY (project_id, path)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating documents table")?;

    // FTS5 virtual tables do not support IF NOT EXISTS on all builds, so
    // check sqlite_master first.
    let fts_exists: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'docs_fts'")
            .fetch_optional(pool)
            .await?;
    if fts_exists.is_none() {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE docs_fts USING fts5(
                project_id UNINDEXED,
                generation UNINDEXED,
                path UNINDEXED,
                url UNINDEXED,
                title,
                body,
                tokenize = 'porter unicode61'
            )
            "#,
        )
        .execute(pool)
        .await
        .context("creating docs_fts table")?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS doc_vectors (
            project_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            path TEXT NOT NULL,
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            snippet TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (project_id, generation, path)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating doc_vectors table")?;

    // One row per (project, backend). `published_generation` is the pointer
    // readers dereference inside their own query; bumping it is the atomic
    // publish step.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_state (
            project_id TEXT NOT NULL,
            backend TEXT NOT NULL,
            published_generation INTEGER NOT NULL DEFAULT 0,
            built_at TEXT,
            doc_count INTEGER NOT NULL DEFAULT 0,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (project_id, backend)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating index_state table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_project ON documents(project_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_doc_vectors_project_gen ON doc_vectors(project_id, generation)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run(&pool).await.unwrap();
        run(&pool).await.unwrap();

        sqlx::query("INSERT INTO docs_fts (project_id, generation, path, url, title, body) VALUES ('p', 1, 'a', 'u', 'Title', 'hello world')")
            .execute(&pool)
            .await
            .unwrap();
        let hits: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM docs_fts WHERE docs_fts MATCH 'hello'")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
