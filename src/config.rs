use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::robots::RobotsMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub crawl: CrawlDefaults,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Global crawl defaults. Per-project settings are resolved against these
/// once, when the project is created.
#[derive(Debug, Deserialize, Clone)]
pub struct CrawlDefaults {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
    #[serde(default)]
    pub robots_mode: RobotsMode,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    #[serde(default = "default_max_concurrent_scrapes")]
    pub max_concurrent_scrapes: usize,
}

impl Default for CrawlDefaults {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_pages: default_max_pages(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            robots_mode: RobotsMode::default(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            min_words: default_min_words(),
            max_concurrent_scrapes: default_max_concurrent_scrapes(),
        }
    }
}

fn default_max_depth() -> u32 {
    5
}
fn default_max_pages() -> u32 {
    1000
}
fn default_rate_limit_delay_ms() -> u64 {
    1000
}
fn default_user_agent() -> String {
    format!("docs-harness/{}", env!("CARGO_PKG_VERSION"))
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_min_words() -> usize {
    20
}
fn default_max_concurrent_scrapes() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_limit() -> i64 {
    10
}
fn default_max_limit() -> i64 {
    100
}
fn default_candidate_k() -> i64 {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    #[serde(default = "default_true")]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_error: bool,
}

fn default_true() -> bool {
    true
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.crawl.max_depth == 0 || config.crawl.max_depth > 20 {
        anyhow::bail!("crawl.max_depth must be in 1..=20");
    }
    if config.crawl.max_pages == 0 {
        anyhow::bail!("crawl.max_pages must be > 0");
    }
    if config.crawl.rate_limit_delay_ms < 100 {
        anyhow::bail!("crawl.rate_limit_delay_ms must be >= 100");
    }
    if config.crawl.max_concurrent_scrapes == 0 {
        anyhow::bail!("crawl.max_concurrent_scrapes must be > 0");
    }

    if config.search.default_limit < 1 {
        anyhow::bail!("search.default_limit must be >= 1");
    }
    if config.search.max_limit < config.search.default_limit {
        anyhow::bail!("search.max_limit must be >= search.default_limit");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsh.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let (_dir, path) = write_config(
            r#"
[storage]
db_path = "/tmp/dsh.sqlite"

[server]
bind = "127.0.0.1:8090"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.crawl.max_depth, 5);
        assert_eq!(cfg.crawl.max_pages, 1000);
        assert_eq!(cfg.crawl.robots_mode, RobotsMode::Permissive);
        assert_eq!(cfg.search.default_limit, 10);
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn rejects_zero_depth() {
        let (_dir, path) = write_config(
            r#"
[storage]
db_path = "/tmp/dsh.sqlite"

[server]
bind = "127.0.0.1:8090"

[crawl]
max_depth = 0
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_embedding_without_dims() {
        let (_dir, path) = write_config(
            r#"
[storage]
db_path = "/tmp/dsh.sqlite"

[server]
bind = "127.0.0.1:8090"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_unknown_provider() {
        let (_dir, path) = write_config(
            r#"
[storage]
db_path = "/tmp/dsh.sqlite"

[server]
bind = "127.0.0.1:8090"

[embedding]
provider = "cohere"
model = "embed-v3"
dims = 1024
"#,
        );
        assert!(load_config(&path).is_err());
    }
}
