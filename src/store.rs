//! Project and document persistence.
//!
//! All project rows go through here; the lifecycle manager owns state
//! transitions but delegates the SQL to this module.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{HarnessError, LifecycleError};
use crate::models::{
    Document, DocumentMeta, DocumentPage, Project, ProjectConfig, ProjectState, ProjectStats,
};

pub async fn create_project(
    pool: &SqlitePool,
    id: &str,
    base_url: &str,
    config: &ProjectConfig,
) -> Result<Project, HarnessError> {
    let existing = sqlx::query("SELECT id FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(HarnessError::Db)?;
    if existing.is_some() {
        return Err(LifecycleError::ProjectExists(id.to_string()).into());
    }

    let config_json = serde_json::to_string(config)
        .map_err(|e| HarnessError::Other(e.into()))?;
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO projects (id, base_url, config_json, state, created_at) VALUES (?, ?, ?, 'created', ?)",
    )
    .bind(id)
    .bind(base_url)
    .bind(&config_json)
    .bind(now.to_rfc3339())
    .execute(pool)
    .await
    .map_err(HarnessError::Db)?;

    Ok(Project {
        id: id.to_string(),
        base_url: base_url.to_string(),
        config: config.clone(),
        state: ProjectState::Created,
        last_error: None,
        created_at: now,
        last_scraped_at: None,
        last_scrape_duration_ms: None,
        pages_scraped: 0,
        page_errors: 0,
    })
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Project, HarnessError> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(HarnessError::Db)?
        .ok_or_else(|| LifecycleError::ProjectNotFound(id.to_string()))?;
    project_from_row(&row)
}

pub async fn update_project_config(
    pool: &SqlitePool,
    id: &str,
    config: &ProjectConfig,
) -> Result<(), HarnessError> {
    let config_json = serde_json::to_string(config)
        .map_err(|e| HarnessError::Other(e.into()))?;
    let updated = sqlx::query("UPDATE projects SET config_json = ? WHERE id = ?")
        .bind(&config_json)
        .bind(id)
        .execute(pool)
        .await
        .map_err(HarnessError::Db)?;
    if updated.rows_affected() == 0 {
        return Err(LifecycleError::ProjectNotFound(id.to_string()).into());
    }
    Ok(())
}

pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>, HarnessError> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(HarnessError::Db)?;
    rows.iter().map(project_from_row).collect()
}

/// Delete a project and everything hanging off it: documents, every index
/// generation, and the publication pointers.
pub async fn delete_project(pool: &SqlitePool, id: &str) -> Result<(), HarnessError> {
    let mut tx = pool.begin().await.map_err(HarnessError::Db)?;
    let deleted = sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(HarnessError::Db)?;
    if deleted.rows_affected() == 0 {
        return Err(LifecycleError::ProjectNotFound(id.to_string()).into());
    }
    for stmt in [
        "DELETE FROM documents WHERE project_id = ?",
        "DELETE FROM docs_fts WHERE project_id = ?",
        "DELETE FROM doc_vectors WHERE project_id = ?",
        "DELETE FROM index_state WHERE project_id = ?",
    ] {
        sqlx::query(stmt)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(HarnessError::Db)?;
    }
    tx.commit().await.map_err(HarnessError::Db)?;
    Ok(())
}

pub async fn set_state(
    pool: &SqlitePool,
    id: &str,
    state: ProjectState,
    last_error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE projects SET state = ?, last_error = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(last_error)
        .bind(id)
        .execute(pool)
        .await
        .context("updating project state")?;
    Ok(())
}

pub async fn record_scrape_result(
    pool: &SqlitePool,
    id: &str,
    pages_scraped: u32,
    page_errors: u32,
    duration_ms: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE projects SET last_scraped_at = ?, last_scrape_duration_ms = ?, pages_scraped = ?, page_errors = ? WHERE id = ?",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(duration_ms)
    .bind(pages_scraped as i64)
    .bind(page_errors as i64)
    .bind(id)
    .execute(pool)
    .await
    .context("recording scrape result")?;
    Ok(())
}

/// Insert or replace a document; re-scraping the same path overwrites the
/// previous capture wholesale.
pub async fn upsert_document(pool: &SqlitePool, doc: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (project_id, path, url, title, body, word_count, scraped_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (project_id, path) DO UPDATE SET
            url = excluded.url,
            title = excluded.title,
            body = excluded.body,
            word_count = excluded.word_count,
            scraped_at = excluded.scraped_at
        "#,
    )
    .bind(&doc.project_id)
    .bind(&doc.path)
    .bind(&doc.url)
    .bind(&doc.title)
    .bind(&doc.body)
    .bind(doc.word_count)
    .bind(doc.scraped_at.to_rfc3339())
    .execute(pool)
    .await
    .context("upserting document")?;
    Ok(())
}

/// Remove documents that a completed full re-scrape did not visit. Returns
/// the number pruned.
pub async fn prune_unvisited(
    pool: &SqlitePool,
    project_id: &str,
    visited_paths: &[String],
) -> Result<u64> {
    let existing: Vec<(String,)> =
        sqlx::query_as("SELECT path FROM documents WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(pool)
            .await?;
    let visited: std::collections::HashSet<&str> =
        visited_paths.iter().map(|s| s.as_str()).collect();

    let mut pruned = 0;
    for (path,) in existing {
        if !visited.contains(path.as_str()) {
            sqlx::query("DELETE FROM documents WHERE project_id = ? AND path = ?")
                .bind(project_id)
                .bind(&path)
                .execute(pool)
                .await?;
            pruned += 1;
        }
    }
    Ok(pruned)
}

pub async fn list_documents(
    pool: &SqlitePool,
    project_id: &str,
    page: i64,
    limit: i64,
) -> Result<DocumentPage, HarnessError> {
    // 404 for unknown projects, not an empty listing.
    get_project(pool, project_id).await?;

    let page = page.max(1);
    let limit = limit.clamp(1, 200);
    let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await
        .map_err(HarnessError::Db)?;

    let rows = sqlx::query(
        "SELECT path, title, url, word_count, scraped_at FROM documents WHERE project_id = ? ORDER BY path LIMIT ? OFFSET ?",
    )
    .bind(project_id)
    .bind(limit)
    .bind((page - 1) * limit)
    .fetch_all(pool)
    .await
    .map_err(HarnessError::Db)?;

    let documents = rows
        .iter()
        .map(|row| {
            Ok(DocumentMeta {
                path: row.get("path"),
                title: row.get("title"),
                url: row.get("url"),
                word_count: row.get("word_count"),
                scraped_at: parse_ts(&row.get::<String, _>("scraped_at"))?,
            })
        })
        .collect::<Result<Vec<_>, HarnessError>>()?;

    let pages = if total.0 == 0 {
        0
    } else {
        (total.0 + limit - 1) / limit
    };
    Ok(DocumentPage {
        documents,
        total: total.0,
        page,
        limit,
        pages,
    })
}

pub async fn get_document(
    pool: &SqlitePool,
    project_id: &str,
    path: &str,
) -> Result<Option<Document>, HarnessError> {
    let row = sqlx::query("SELECT * FROM documents WHERE project_id = ? AND path = ?")
        .bind(project_id)
        .bind(path)
        .fetch_optional(pool)
        .await
        .map_err(HarnessError::Db)?;
    row.map(|r| document_from_row(&r)).transpose()
}

/// Every document in a project, body included, for index builds.
pub async fn all_documents(pool: &SqlitePool, project_id: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents WHERE project_id = ? ORDER BY path")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| document_from_row(r).map_err(anyhow::Error::from))
        .collect()
}

pub async fn project_stats(pool: &SqlitePool, project_id: &str) -> Result<ProjectStats> {
    let (page_count, total_words): (i64, Option<i64>) = sqlx::query_as(
        "SELECT COUNT(*), SUM(word_count) FROM documents WHERE project_id = ?",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;

    let (index_size_bytes,): (Option<i64>,) =
        sqlx::query_as("SELECT SUM(size_bytes) FROM index_state WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(pool)
            .await?;

    Ok(ProjectStats {
        page_count,
        total_words: total_words.unwrap_or(0),
        index_size_bytes: index_size_bytes.unwrap_or(0),
    })
}

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Project, HarnessError> {
    let config_json: String = row.get("config_json");
    let config: ProjectConfig = serde_json::from_str(&config_json)
        .map_err(|e| HarnessError::Other(anyhow::anyhow!("corrupt project config: {}", e)))?;
    let state_str: String = row.get("state");
    let state = ProjectState::parse(&state_str)
        .ok_or_else(|| HarnessError::Other(anyhow::anyhow!("unknown project state: {}", state_str)))?;

    Ok(Project {
        id: row.get("id"),
        base_url: row.get("base_url"),
        config,
        state,
        last_error: row.get("last_error"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        last_scraped_at: row
            .get::<Option<String>, _>("last_scraped_at")
            .map(|s| parse_ts(&s))
            .transpose()?,
        last_scrape_duration_ms: row.get("last_scrape_duration_ms"),
        pages_scraped: row.get("pages_scraped"),
        page_errors: row.get("page_errors"),
    })
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document, HarnessError> {
    Ok(Document {
        project_id: row.get("project_id"),
        path: row.get("path"),
        url: row.get("url"),
        title: row.get("title"),
        body: row.get("body"),
        word_count: row.get("word_count"),
        scraped_at: parse_ts(&row.get::<String, _>("scraped_at"))?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, HarnessError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarnessError::Other(anyhow::anyhow!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlDefaults;
    use crate::models::ProjectConfigPatch;

    fn test_config() -> ProjectConfig {
        ProjectConfig::resolve(ProjectConfigPatch::default(), &CrawlDefaults::default()).unwrap()
    }

    fn doc(project: &str, path: &str, body: &str) -> Document {
        Document {
            project_id: project.to_string(),
            path: path.to_string(),
            url: format!("https://docs.test/{}", path),
            title: path.to_string(),
            body: body.to_string(),
            word_count: body.split_whitespace().count() as i64,
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn project_round_trip() {
        let pool = crate::db::connect_memory().await.unwrap();
        let created = create_project(&pool, "rustdocs", "https://docs.test", &test_config())
            .await
            .unwrap();
        assert_eq!(created.state, ProjectState::Created);

        let loaded = get_project(&pool, "rustdocs").await.unwrap();
        assert_eq!(loaded.base_url, "https://docs.test");
        assert_eq!(loaded.config, created.config);

        let err = create_project(&pool, "rustdocs", "https://x", &test_config())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Lifecycle(LifecycleError::ProjectExists(_))
        ));
    }

    #[tokio::test]
    async fn upsert_replaces_by_path() {
        let pool = crate::db::connect_memory().await.unwrap();
        create_project(&pool, "p", "https://docs.test", &test_config())
            .await
            .unwrap();

        upsert_document(&pool, &doc("p", "guide", "old content here")).await.unwrap();
        upsert_document(&pool, &doc("p", "guide", "new content here entirely"))
            .await
            .unwrap();

        let loaded = get_document(&pool, "p", "guide").await.unwrap().unwrap();
        assert!(loaded.body.contains("new content"));

        let listing = list_documents(&pool, "p", 1, 10).await.unwrap();
        assert_eq!(listing.total, 1);
    }

    #[tokio::test]
    async fn prune_removes_only_unvisited() {
        let pool = crate::db::connect_memory().await.unwrap();
        create_project(&pool, "p", "https://docs.test", &test_config())
            .await
            .unwrap();
        upsert_document(&pool, &doc("p", "keep", "stays around")).await.unwrap();
        upsert_document(&pool, &doc("p", "drop", "goes away")).await.unwrap();

        let pruned = prune_unvisited(&pool, "p", &["keep".to_string()]).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(get_document(&pool, "p", "drop").await.unwrap().is_none());
        assert!(get_document(&pool, "p", "keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_cascades() {
        let pool = crate::db::connect_memory().await.unwrap();
        create_project(&pool, "p", "https://docs.test", &test_config())
            .await
            .unwrap();
        upsert_document(&pool, &doc("p", "a", "body words")).await.unwrap();

        delete_project(&pool, "p").await.unwrap();
        let err = get_project(&pool, "p").await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Lifecycle(LifecycleError::ProjectNotFound(_))
        ));
        let docs: Vec<(String,)> = sqlx::query_as("SELECT path FROM documents WHERE project_id = 'p'")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn pagination_math() {
        let pool = crate::db::connect_memory().await.unwrap();
        create_project(&pool, "p", "https://docs.test", &test_config())
            .await
            .unwrap();
        for i in 0..5 {
            upsert_document(&pool, &doc("p", &format!("page-{}", i), "some words"))
                .await
                .unwrap();
        }

        let first = list_documents(&pool, "p", 1, 2).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        assert_eq!(first.total, 5);
        assert_eq!(first.pages, 3);

        let last = list_documents(&pool, "p", 3, 2).await.unwrap();
        assert_eq!(last.documents.len(), 1);
    }
}
