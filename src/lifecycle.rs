//! Project lifecycle orchestration.
//!
//! The manager owns the state machine (created → scraping → ready/error/
//! cancelled), concurrency limits, cancellation, and the handoff from a
//! finished crawl to index rebuilds and notifications. It is the only
//! writer of project state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::crawler::{self, CrawlEvent, CrawlJob, CrawlStats};
use crate::error::{HarnessError, LifecycleError};
use crate::extract;
use crate::fetch::Fetcher;
use crate::index::{BackendKind, IndexManager};
use crate::models::{
    Document, Project, ProjectConfig, ProjectConfigPatch, ProjectState, ProjectStats,
    ScrapeProgress,
};
use crate::notify::{NotificationSink, ScrapeEventPayload};
use crate::store;

struct ActiveJob {
    cancel: Arc<AtomicBool>,
    progress: Arc<Mutex<ScrapeProgress>>,
}

/// Snapshot returned by the status operation.
#[derive(Debug, Serialize)]
pub struct ProjectStatus {
    #[serde(flatten)]
    pub project: Project,
    pub stats: ProjectStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ScrapeProgress>,
}

pub struct LifecycleManager {
    pool: SqlitePool,
    config: Arc<Config>,
    fetcher: Arc<dyn Fetcher>,
    index: Arc<IndexManager>,
    sink: Arc<dyn NotificationSink>,
    scrape_permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<String, ActiveJob>>>,
}

impl LifecycleManager {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        fetcher: Arc<dyn Fetcher>,
        index: Arc<IndexManager>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let permits = config.crawl.max_concurrent_scrapes.max(1);
        LifecycleManager {
            pool,
            config,
            fetcher,
            index,
            sink,
            scrape_permits: Arc::new(Semaphore::new(permits)),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn index(&self) -> &Arc<IndexManager> {
        &self.index
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub async fn create_project(
        &self,
        id: &str,
        base_url: &str,
        patch: ProjectConfigPatch,
    ) -> Result<Project, HarnessError> {
        validate_project_id(id)?;
        let parsed = Url::parse(base_url)
            .map_err(|e| HarnessError::Config(format!("invalid base_url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HarnessError::Config(
                "base_url must be an http or https URL".into(),
            ));
        }

        let config = ProjectConfig::resolve(patch, &self.config.crawl)?;
        if config.vector_index && self.index.backend(BackendKind::Vector).is_none() {
            return Err(HarnessError::Config(
                "vector_index requires an embedding provider to be configured".into(),
            ));
        }

        let project = store::create_project(&self.pool, id, parsed.as_str(), &config).await?;
        info!(project = id, base_url = %parsed, "project created");
        Ok(project)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, HarnessError> {
        store::list_projects(&self.pool).await
    }

    /// Apply a config patch to an existing project. Rejected while a
    /// scrape is running; the change takes effect on the next scrape.
    pub async fn update_project(
        &self,
        id: &str,
        patch: ProjectConfigPatch,
    ) -> Result<Project, HarnessError> {
        if self.active.lock().unwrap_or_else(|e| e.into_inner()).contains_key(id) {
            return Err(LifecycleError::ScrapeInProgress(id.to_string()).into());
        }
        let mut project = store::get_project(&self.pool, id).await?;
        let config = project.config.merged(patch)?;
        if config.vector_index && self.index.backend(BackendKind::Vector).is_none() {
            return Err(HarnessError::Config(
                "vector_index requires an embedding provider to be configured".into(),
            ));
        }
        store::update_project_config(&self.pool, id, &config).await?;
        info!(project = id, "project config updated");
        project.config = config;
        Ok(project)
    }

    pub async fn delete_project(&self, id: &str) -> Result<(), HarnessError> {
        if self.active.lock().unwrap_or_else(|e| e.into_inner()).contains_key(id) {
            return Err(LifecycleError::ScrapeInProgress(id.to_string()).into());
        }
        store::delete_project(&self.pool, id).await?;
        info!(project = id, "project deleted");
        Ok(())
    }

    /// Kick off a scrape in the background. Returns once the job is
    /// registered; progress is observable through [`status`](Self::status).
    pub async fn start_scrape(
        self: &Arc<Self>,
        id: &str,
        full: bool,
    ) -> Result<JoinHandle<()>, HarnessError> {
        let project = store::get_project(&self.pool, id).await?;
        if !project.state.allows_scrape() {
            return Err(LifecycleError::ScrapeInProgress(id.to_string()).into());
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(Mutex::new(ScrapeProgress {
            message: "queued".to_string(),
            ..Default::default()
        }));
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(id) {
                return Err(LifecycleError::ScrapeInProgress(id.to_string()).into());
            }
            active.insert(
                id.to_string(),
                ActiveJob {
                    cancel: cancel.clone(),
                    progress: progress.clone(),
                },
            );
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.run_scrape(project, full, cancel, progress).await;
        });
        Ok(handle)
    }

    /// Request cancellation of a running scrape. The crawler observes the
    /// flag at its next frontier step; partial results are kept and indexed.
    pub fn cancel_scrape(&self, id: &str) -> Result<(), LifecycleError> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(id) {
            Some(job) => {
                job.cancel.store(true, Ordering::Relaxed);
                info!(project = id, "cancellation requested");
                Ok(())
            }
            None => Err(LifecycleError::NoActiveScrape(id.to_string())),
        }
    }

    pub async fn status(&self, id: &str) -> Result<ProjectStatus, HarnessError> {
        let project = store::get_project(&self.pool, id).await?;
        let stats = store::project_stats(&self.pool, id)
            .await
            .map_err(HarnessError::Other)?;
        let progress = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active
                .get(id)
                .map(|job| job.progress.lock().unwrap_or_else(|e| e.into_inner()).clone())
        };
        Ok(ProjectStatus {
            project,
            stats,
            progress,
        })
    }

    async fn run_scrape(
        self: Arc<Self>,
        project: Project,
        full: bool,
        cancel: Arc<AtomicBool>,
        progress: Arc<Mutex<ScrapeProgress>>,
    ) {
        let id = project.id.clone();
        let started = Instant::now();

        // Global throughput cap; FIFO, so queued scrapes start in order.
        let permit = match self.scrape_permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                self.abort_queued(&id, "scrape queue shut down").await;
                return;
            }
        };

        if let Err(e) = store::set_state(&self.pool, &id, ProjectState::Scraping, None).await {
            error!(project = %id, error = %e, "failed to enter scraping state");
            self.active.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            drop(permit);
            return;
        }
        {
            let mut p = progress.lock().unwrap_or_else(|e| e.into_inner());
            p.message = "crawling".to_string();
        }

        let (stats, visited_paths) = self.crawl_and_persist(&project, &cancel, &progress).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let outcome = self
            .settle(&project, full, &stats, visited_paths, &progress)
            .await;

        let (state, error_message) = match outcome {
            Ok(state) => (state, None),
            Err(msg) => (ProjectState::Error, Some(msg)),
        };

        if let Err(e) =
            store::set_state(&self.pool, &id, state, error_message.as_deref()).await
        {
            error!(project = %id, error = %e, "failed to record final state");
        }
        if let Err(e) = store::record_scrape_result(
            &self.pool,
            &id,
            stats.pages_written,
            stats.errors,
            duration_ms,
        )
        .await
        {
            error!(project = %id, error = %e, "failed to record scrape result");
        }

        self.active.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        drop(permit);

        info!(
            project = %id,
            state = state.as_str(),
            pages = stats.pages_written,
            errors = stats.errors,
            duration_ms,
            "scrape finished"
        );

        let event = if state == ProjectState::Error {
            "scrape_error"
        } else {
            "scrape_complete"
        };
        self.sink
            .notify(ScrapeEventPayload {
                event,
                project_id: id,
                status: state,
                pages_scraped: stats.pages_written,
                errors: stats.errors,
                duration_ms,
                error_message,
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Run the crawler and persist pages as they arrive. Returns crawl
    /// stats plus the set of document paths written this run.
    async fn crawl_and_persist(
        &self,
        project: &Project,
        cancel: &Arc<AtomicBool>,
        progress: &Arc<Mutex<ScrapeProgress>>,
    ) -> (CrawlStats, Vec<String>) {
        let base_url = match Url::parse(&project.base_url) {
            Ok(u) => u,
            Err(e) => {
                error!(project = %project.id, error = %e, "stored base_url is unparseable");
                return (CrawlStats::default(), Vec::new());
            }
        };

        let job = CrawlJob {
            base_url,
            config: project.config.clone(),
            min_words: self.config.crawl.min_words,
            max_retries: self.config.crawl.max_retries,
            user_agent: self.config.crawl.user_agent.clone(),
            cancel: cancel.clone(),
        };

        let (tx, mut rx) = mpsc::channel::<CrawlEvent>(64);
        let fetcher = self.fetcher.clone();
        let crawl_task = tokio::spawn(async move { crawler::crawl(fetcher, job, tx).await });

        let mut visited_paths = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                CrawlEvent::Page { url, page, .. } => {
                    let path = extract::url_to_slug(&url);
                    let doc = Document {
                        project_id: project.id.clone(),
                        path: path.clone(),
                        url: url.to_string(),
                        title: page.title,
                        body: page.body,
                        word_count: page.word_count,
                        scraped_at: Utc::now(),
                    };
                    if let Err(e) = store::upsert_document(&self.pool, &doc).await {
                        error!(project = %project.id, path = %path, error = %e, "failed to persist page");
                    } else {
                        visited_paths.push(path);
                    }
                }
                CrawlEvent::PageError { url, error } => {
                    warn!(project = %project.id, url = %url, error = %error, "page failed");
                    let mut p = progress.lock().unwrap_or_else(|e| e.into_inner());
                    p.message = format!("error on {}", url);
                }
                CrawlEvent::Progress {
                    pages_fetched,
                    pages_written,
                    errors,
                } => {
                    let mut p = progress.lock().unwrap_or_else(|e| e.into_inner());
                    p.pages_fetched = pages_fetched;
                    p.pages_written = pages_written;
                    p.errors = errors;
                }
            }
        }

        let stats = match crawl_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(project = %project.id, error = %e, "crawl task panicked");
                CrawlStats::default()
            }
        };
        (stats, visited_paths)
    }

    /// Decide the terminal state and rebuild indexes. Cancelled scrapes
    /// keep and index their partial data so it is queryable.
    async fn settle(
        &self,
        project: &Project,
        full: bool,
        stats: &CrawlStats,
        visited_paths: Vec<String>,
        progress: &Arc<Mutex<ScrapeProgress>>,
    ) -> Result<ProjectState, String> {
        if !stats.cancelled && stats.pages_written == 0 {
            return Err("no pages could be scraped".to_string());
        }

        if full && !stats.cancelled {
            match store::prune_unvisited(&self.pool, &project.id, &visited_paths).await {
                Ok(pruned) if pruned > 0 => {
                    info!(project = %project.id, pruned, "pruned documents absent from re-scrape")
                }
                Ok(_) => {}
                Err(e) => warn!(project = %project.id, error = %e, "prune failed"),
            }
        }

        {
            let mut p = progress.lock().unwrap_or_else(|e| e.into_inner());
            p.message = "indexing".to_string();
        }

        if let Err(e) = self
            .index
            .rebuild(&self.pool, &project.id, BackendKind::Keyword)
            .await
        {
            // A previously published generation keeps serving queries; only
            // a project with no usable index at all goes to error.
            let published =
                crate::index::published_generation(&self.pool, &project.id, BackendKind::Keyword)
                    .await
                    .unwrap_or(0);
            // A cancelled job always reports cancelled, even when its
            // partial data could not be indexed.
            if published == 0 && !stats.cancelled {
                return Err(format!("index build failed: {}", e));
            }
            warn!(project = %project.id, error = %e, "index rebuild failed, serving previous generation");
        }

        if project.config.vector_index && self.index.backend(BackendKind::Vector).is_some() {
            if let Err(e) = self
                .index
                .rebuild(&self.pool, &project.id, BackendKind::Vector)
                .await
            {
                // Vector search degrades to keyword-only rather than
                // failing the scrape.
                warn!(project = %project.id, error = %e, "vector index rebuild failed");
            }
        }

        Ok(if stats.cancelled {
            ProjectState::Cancelled
        } else {
            ProjectState::Ready
        })
    }

    /// A job that never got to run (shutdown race) still needs its active
    /// entry cleared and an error recorded.
    async fn abort_queued(&self, id: &str, reason: &str) {
        if let Err(e) = store::set_state(&self.pool, id, ProjectState::Error, Some(reason)).await {
            error!(project = id, error = %e, "failed to record state");
        }
        self.active.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}

fn validate_project_id(id: &str) -> Result<(), HarnessError> {
    if id.is_empty() || id.len() > 64 {
        return Err(HarnessError::Config(
            "project id must be 1-64 characters".into(),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(HarnessError::Config(
            "project id may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchResponse, NetworkError};
    use crate::index::{BackendHit, SearchBackend};
    use crate::notify::NullSink;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    #[test]
    fn project_ids_are_validated() {
        assert!(validate_project_id("rust-docs_v2").is_ok());
        assert!(validate_project_id("").is_err());
        assert!(validate_project_id("has space").is_err());
        assert!(validate_project_id("slash/ok").is_err());
        assert!(validate_project_id(&"x".repeat(65)).is_err());
    }

    struct NoFetch;

    #[async_trait]
    impl Fetcher for NoFetch {
        async fn fetch(
            &self,
            url: &str,
            _headers: &BTreeMap<String, String>,
        ) -> Result<FetchResponse, NetworkError> {
            Err(NetworkError::InvalidUrl(url.to_string()))
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl SearchBackend for BrokenBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Keyword
        }
        async fn build(
            &self,
            _: &SqlitePool,
            _: &str,
            _: &[Document],
            _: i64,
        ) -> anyhow::Result<i64> {
            anyhow::bail!("disk full")
        }
        async fn search(
            &self,
            _: &SqlitePool,
            _: &str,
            _: &str,
            _: i64,
        ) -> anyhow::Result<Vec<BackendHit>> {
            Ok(Vec::new())
        }
        async fn sweep(&self, _: &SqlitePool, _: &str, _: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn manager_with_backend(backend: Arc<dyn SearchBackend>) -> LifecycleManager {
        let config: Config = toml::from_str(
            r#"
            [storage]
            db_path = ":memory:"
            [server]
            bind = "127.0.0.1:0"
            "#,
        )
        .unwrap();
        let pool = crate::db::connect_memory().await.unwrap();
        LifecycleManager::new(
            pool,
            Arc::new(config),
            Arc::new(NoFetch),
            Arc::new(IndexManager::new(vec![backend])),
            Arc::new(NullSink),
        )
    }

    // A cancelled job reports cancelled even when indexing its partial
    // data fails with nothing previously published.
    #[tokio::test]
    async fn cancelled_scrape_survives_index_build_failure() {
        let manager = manager_with_backend(Arc::new(BrokenBackend)).await;
        let project = manager
            .create_project("docs", "https://docs.test/", ProjectConfigPatch::default())
            .await
            .unwrap();

        let stats = CrawlStats {
            pages_fetched: 1,
            pages_written: 1,
            errors: 0,
            cancelled: true,
        };
        let progress = Arc::new(Mutex::new(ScrapeProgress::default()));
        let state = manager
            .settle(&project, false, &stats, vec!["index".to_string()], &progress)
            .await
            .unwrap();
        assert_eq!(state, ProjectState::Cancelled);

        // The same failure on a non-cancelled run is still an error.
        let stats = CrawlStats { cancelled: false, ..stats };
        let err = manager
            .settle(&project, false, &stats, vec!["index".to_string()], &progress)
            .await
            .unwrap_err();
        assert!(err.contains("index build failed"));
    }
}
