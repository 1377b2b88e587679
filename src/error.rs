//! Error taxonomy.
//!
//! Page-level failures ([`crate::extract::ExtractError`],
//! [`crate::fetch::NetworkError`]) are recorded on the job and never abort
//! it. The variants here are the failures that cross component boundaries:
//! invalid configuration, index build failures, and illegal lifecycle
//! transitions.

use thiserror::Error;

use crate::extract::ExtractError;
use crate::fetch::NetworkError;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("network failure: {0}")]
    Network(#[from] NetworkError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("index build failed: {0}")]
    Build(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Rejected state-transition requests. Always returned synchronously,
/// before any job is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("project '{0}' already exists")]
    ProjectExists(String),

    #[error("scrape already in progress for project '{0}'")]
    ScrapeInProgress(String),

    #[error("no scrape in progress for project '{0}'")]
    NoActiveScrape(String),
}
