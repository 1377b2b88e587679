//! Core data models.
//!
//! These types represent projects, documents, and search results flowing
//! through the crawl, indexing, and retrieval pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CrawlDefaults;
use crate::error::HarnessError;
use crate::robots::RobotsMode;

/// Project lifecycle state. Transitions are owned by the lifecycle manager;
/// nothing else writes this column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Created,
    Scraping,
    Ready,
    Error,
    Cancelled,
}

impl ProjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectState::Created => "created",
            ProjectState::Scraping => "scraping",
            ProjectState::Ready => "ready",
            ProjectState::Error => "error",
            ProjectState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<ProjectState> {
        match s {
            "created" => Some(ProjectState::Created),
            "scraping" => Some(ProjectState::Scraping),
            "ready" => Some(ProjectState::Ready),
            "error" => Some(ProjectState::Error),
            "cancelled" => Some(ProjectState::Cancelled),
            _ => None,
        }
    }

    /// A new scrape may start from any state except an in-flight one.
    pub fn allows_scrape(&self) -> bool {
        !matches!(self, ProjectState::Scraping)
    }
}

/// Optional CSS selectors overriding the default extraction heuristic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selectors {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Fully resolved per-project configuration. All optional fields of the
/// creation request are filled in from [`CrawlDefaults`] exactly once; jobs
/// never re-derive defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    pub max_depth: u32,
    pub max_pages: u32,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    pub rate_limit_delay_ms: u64,
    pub robots_mode: RobotsMode,
    #[serde(default)]
    pub custom_selectors: Option<Selectors>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Whether to build a vector index for this project (requires an
    /// embedding provider to be configured globally).
    #[serde(default)]
    pub vector_index: bool,
}

/// Unresolved per-project overrides, supplied at creation or as a later
/// update. `None` means "leave as is" (global default at creation, the
/// current value on update); `Some` replaces, so an explicit empty list
/// clears a pattern set.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfigPatch {
    pub max_depth: Option<u32>,
    pub max_pages: Option<u32>,
    pub include_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
    pub rate_limit_delay_ms: Option<u64>,
    pub robots_mode: Option<RobotsMode>,
    #[serde(default)]
    pub custom_selectors: Option<Selectors>,
    pub headers: Option<BTreeMap<String, String>>,
    pub vector_index: Option<bool>,
}

impl ProjectConfig {
    /// Resolve a creation-time patch against global defaults, validating
    /// ranges, glob patterns, and CSS selectors up front so a bad config
    /// never reaches a running job.
    pub fn resolve(patch: ProjectConfigPatch, defaults: &CrawlDefaults) -> Result<Self, HarnessError> {
        let config = ProjectConfig {
            max_depth: patch.max_depth.unwrap_or(defaults.max_depth),
            max_pages: patch.max_pages.unwrap_or(defaults.max_pages),
            include_patterns: patch.include_patterns.unwrap_or_default(),
            exclude_patterns: patch.exclude_patterns.unwrap_or_default(),
            rate_limit_delay_ms: patch
                .rate_limit_delay_ms
                .unwrap_or(defaults.rate_limit_delay_ms),
            robots_mode: patch.robots_mode.unwrap_or(defaults.robots_mode),
            custom_selectors: patch.custom_selectors,
            headers: patch.headers.unwrap_or_default(),
            vector_index: patch.vector_index.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    /// Overlay an update patch on an existing config. Unset fields keep
    /// their current value; the result is re-validated in full.
    pub fn merged(&self, patch: ProjectConfigPatch) -> Result<Self, HarnessError> {
        let config = ProjectConfig {
            max_depth: patch.max_depth.unwrap_or(self.max_depth),
            max_pages: patch.max_pages.unwrap_or(self.max_pages),
            include_patterns: patch
                .include_patterns
                .unwrap_or_else(|| self.include_patterns.clone()),
            exclude_patterns: patch
                .exclude_patterns
                .unwrap_or_else(|| self.exclude_patterns.clone()),
            rate_limit_delay_ms: patch
                .rate_limit_delay_ms
                .unwrap_or(self.rate_limit_delay_ms),
            robots_mode: patch.robots_mode.unwrap_or(self.robots_mode),
            custom_selectors: patch
                .custom_selectors
                .or_else(|| self.custom_selectors.clone()),
            headers: patch.headers.unwrap_or_else(|| self.headers.clone()),
            vector_index: patch.vector_index.unwrap_or(self.vector_index),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), HarnessError> {
        if self.max_depth == 0 || self.max_depth > 20 {
            return Err(HarnessError::Config("max_depth must be in 1..=20".into()));
        }
        if self.max_pages == 0 || self.max_pages > 100_000 {
            return Err(HarnessError::Config("max_pages must be in 1..=100000".into()));
        }
        for pat in self.include_patterns.iter().chain(&self.exclude_patterns) {
            globset::Glob::new(pat)
                .map_err(|e| HarnessError::Config(format!("invalid URL pattern '{}': {}", pat, e)))?;
        }
        if let Some(ref sel) = self.custom_selectors {
            for css in sel
                .title
                .iter()
                .chain(sel.content.iter())
                .chain(sel.remove.iter())
            {
                scraper::Selector::parse(css)
                    .map_err(|e| HarnessError::Config(format!("invalid selector '{}': {}", css, e)))?;
            }
        }
        if self.rate_limit_delay_ms < 100 {
            return Err(HarnessError::Config(
                "rate_limit_delay_ms must be >= 100".into(),
            ));
        }
        Ok(())
    }
}

/// Aggregate per-project statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectStats {
    pub page_count: i64,
    pub total_words: i64,
    pub index_size_bytes: i64,
}

/// A registered documentation site.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub base_url: String,
    pub config: ProjectConfig,
    pub state: ProjectState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub last_scrape_duration_ms: Option<i64>,
    pub pages_scraped: i64,
    pub page_errors: i64,
}

/// A stored page. `path` is the URL-derived slug, unique within a project;
/// a re-scrape of the same URL replaces the row wholesale.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub project_id: String,
    pub path: String,
    pub url: String,
    pub title: String,
    pub body: String,
    pub word_count: i64,
    pub scraped_at: DateTime<Utc>,
}

/// Document listing entry (no body).
#[derive(Debug, Clone, Serialize)]
pub struct DocumentMeta {
    pub path: String,
    pub title: String,
    pub url: String,
    pub word_count: i64,
    pub scraped_at: DateTime<Utc>,
}

/// One page of a document listing.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentPage {
    pub documents: Vec<DocumentMeta>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

/// Live progress counters for a running scrape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeProgress {
    pub pages_fetched: u32,
    pub pages_written: u32,
    pub errors: u32,
    pub message: String,
}

/// A single aggregated search hit. `score` is normalized to [0, 1].
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub project: String,
    pub path: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub query_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_fills_defaults() {
        let defaults = CrawlDefaults::default();
        let cfg = ProjectConfig::resolve(ProjectConfigPatch::default(), &defaults).unwrap();
        assert_eq!(cfg.max_depth, defaults.max_depth);
        assert_eq!(cfg.max_pages, defaults.max_pages);
        assert_eq!(cfg.robots_mode, defaults.robots_mode);
        assert!(cfg.include_patterns.is_empty());
    }

    #[test]
    fn resolve_rejects_bad_depth() {
        let patch = ProjectConfigPatch {
            max_depth: Some(99),
            ..Default::default()
        };
        assert!(ProjectConfig::resolve(patch, &CrawlDefaults::default()).is_err());
    }

    #[test]
    fn resolve_rejects_bad_glob() {
        let patch = ProjectConfigPatch {
            include_patterns: Some(vec!["a{".to_string()]),
            ..Default::default()
        };
        assert!(ProjectConfig::resolve(patch, &CrawlDefaults::default()).is_err());
    }

    #[test]
    fn merged_overlays_and_revalidates() {
        let defaults = CrawlDefaults::default();
        let base = ProjectConfig::resolve(
            ProjectConfigPatch {
                max_depth: Some(3),
                include_patterns: Some(vec!["*/docs/*".to_string()]),
                ..Default::default()
            },
            &defaults,
        )
        .unwrap();

        let updated = base
            .merged(ProjectConfigPatch {
                max_pages: Some(50),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.max_depth, 3);
        assert_eq!(updated.max_pages, 50);
        assert_eq!(updated.include_patterns, base.include_patterns);

        // An explicit empty list clears the patterns.
        let cleared = base
            .merged(ProjectConfigPatch {
                include_patterns: Some(Vec::new()),
                ..Default::default()
            })
            .unwrap();
        assert!(cleared.include_patterns.is_empty());

        assert!(base
            .merged(ProjectConfigPatch {
                max_depth: Some(0),
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn resolve_rejects_bad_selector() {
        let patch = ProjectConfigPatch {
            custom_selectors: Some(Selectors {
                content: Some(":::nope".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ProjectConfig::resolve(patch, &CrawlDefaults::default()).is_err());
    }

    #[test]
    fn state_round_trip() {
        for s in [
            ProjectState::Created,
            ProjectState::Scraping,
            ProjectState::Ready,
            ProjectState::Error,
            ProjectState::Cancelled,
        ] {
            assert_eq!(ProjectState::parse(s.as_str()), Some(s));
        }
        assert!(ProjectState::Scraping.allows_scrape() == false);
        assert!(ProjectState::Cancelled.allows_scrape());
    }
}
