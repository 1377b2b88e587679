//! Breadth-first site crawler.
//!
//! The crawler owns fetching, politeness, and extraction; it reports results
//! as a stream of [`CrawlEvent`]s over a channel and never touches the
//! database. Persistence and state transitions belong to the lifecycle
//! manager draining that channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::extract::{self, ExtractedPage};
use crate::fetch::Fetcher;
use crate::models::ProjectConfig;
use crate::robots::{self, RobotsMode, RobotsPolicy};

/// One unit of crawl output.
#[derive(Debug)]
pub enum CrawlEvent {
    /// A page was fetched and extracted successfully.
    Page {
        url: Url,
        depth: u32,
        page: ExtractedPage,
    },
    /// A page failed permanently (after retries) or was unusable.
    PageError { url: String, error: String },
    /// Periodic counters for live status reporting.
    Progress {
        pages_fetched: u32,
        pages_written: u32,
        errors: u32,
    },
}

/// Everything a single crawl run needs, resolved up front.
pub struct CrawlJob {
    pub base_url: Url,
    pub config: ProjectConfig,
    pub min_words: usize,
    pub max_retries: u32,
    pub user_agent: String,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CrawlStats {
    pub pages_fetched: u32,
    pub pages_written: u32,
    pub errors: u32,
    pub cancelled: bool,
}

/// Run a breadth-first crawl from `job.base_url`, emitting events until the
/// frontier is exhausted, a ceiling is hit, or the cancel flag is set.
pub async fn crawl(
    fetcher: Arc<dyn Fetcher>,
    job: CrawlJob,
    events: mpsc::Sender<CrawlEvent>,
) -> CrawlStats {
    let mut stats = CrawlStats::default();

    let include = match build_globset(&job.config.include_patterns) {
        Ok(set) => set,
        Err(e) => {
            // Patterns are validated at project creation, so this is a bug
            // rather than user error.
            warn!(error = %e, "include patterns failed to compile");
            stats.errors += 1;
            return stats;
        }
    };
    let exclude = match build_globset(&job.config.exclude_patterns) {
        Ok(set) => set,
        Err(e) => {
            warn!(error = %e, "exclude patterns failed to compile");
            stats.errors += 1;
            return stats;
        }
    };

    let policy = match job.config.robots_mode {
        RobotsMode::Ignore => RobotsPolicy::default(),
        _ => robots::fetch_policy(&fetcher, &job.base_url, &job.user_agent).await,
    };
    let base_delay = Duration::from_millis(job.config.rate_limit_delay_ms);
    let delay = policy.crawl_delay().map_or(base_delay, |d| d.max(base_delay));

    let mut frontier: VecDeque<(Url, u32)> = VecDeque::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut last_fetch: HashMap<String, Instant> = HashMap::new();

    visited.insert(visited_key(&job.base_url));
    frontier.push_back((job.base_url.clone(), 0));

    while let Some((url, depth)) = frontier.pop_front() {
        if job.cancel.load(Ordering::Relaxed) {
            stats.cancelled = true;
            break;
        }
        if stats.pages_fetched >= job.config.max_pages {
            debug!(max_pages = job.config.max_pages, "page ceiling reached");
            break;
        }
        if job.config.robots_mode == RobotsMode::Strict && !policy.allows(&url) {
            debug!(url = %url, "skipped by robots.txt");
            continue;
        }

        // Politeness: one request per host per delay window.
        if let Some(host) = url.host_str() {
            if let Some(last) = last_fetch.get(host) {
                let elapsed = last.elapsed();
                if elapsed < delay {
                    tokio::time::sleep(delay - elapsed).await;
                }
            }
            last_fetch.insert(host.to_string(), Instant::now());
        }

        if job.cancel.load(Ordering::Relaxed) {
            stats.cancelled = true;
            break;
        }

        stats.pages_fetched += 1;
        let outcome = fetch_with_retries(&fetcher, &job, url.as_str()).await;
        let resp = match outcome {
            Ok(resp) => resp,
            Err(error) => {
                stats.errors += 1;
                let _ = events
                    .send(CrawlEvent::PageError {
                        url: url.to_string(),
                        error,
                    })
                    .await;
                send_progress(&events, &stats).await;
                continue;
            }
        };

        if resp.status != 200 {
            stats.errors += 1;
            let _ = events
                .send(CrawlEvent::PageError {
                    url: url.to_string(),
                    error: format!("HTTP {}", resp.status),
                })
                .await;
            send_progress(&events, &stats).await;
            continue;
        }
        if !resp.is_html() {
            stats.errors += 1;
            let _ = events
                .send(CrawlEvent::PageError {
                    url: url.to_string(),
                    error: format!(
                        "unsupported content type: {}",
                        resp.content_type.as_deref().unwrap_or("unknown")
                    ),
                })
                .await;
            send_progress(&events, &stats).await;
            continue;
        }

        match extract::extract(
            &resp.body,
            &url,
            job.config.custom_selectors.as_ref(),
            job.min_words,
        ) {
            Ok(page) => {
                stats.pages_written += 1;

                // Links are only discovered from pages we kept.
                if depth < job.config.max_depth {
                    for link in extract::extract_links(&resp.body, &url) {
                        let key = visited_key(&link);
                        if visited.contains(&key) {
                            continue;
                        }
                        if exclude.is_match(link.as_str()) {
                            continue;
                        }
                        if !job.config.include_patterns.is_empty() && !include.is_match(link.as_str())
                        {
                            continue;
                        }
                        visited.insert(key);
                        frontier.push_back((link, depth + 1));
                    }
                }

                let _ = events.send(CrawlEvent::Page { url, depth, page }).await;
            }
            Err(e) => {
                stats.errors += 1;
                let _ = events
                    .send(CrawlEvent::PageError {
                        url: url.to_string(),
                        error: e.to_string(),
                    })
                    .await;
            }
        }
        send_progress(&events, &stats).await;
    }

    if job.cancel.load(Ordering::Relaxed) {
        stats.cancelled = true;
    }
    stats
}

/// Fetch with exponential backoff. Retries cover transport errors and
/// HTTP 429; anything else is returned to the caller as-is.
async fn fetch_with_retries(
    fetcher: &Arc<dyn Fetcher>,
    job: &CrawlJob,
    url: &str,
) -> Result<crate::fetch::FetchResponse, String> {
    let mut attempt: u32 = 0;
    loop {
        match fetcher.fetch(url, &job.config.headers).await {
            Ok(resp) if resp.status == 429 && attempt < job.max_retries => {
                attempt += 1;
                let backoff = Duration::from_secs(1u64 << attempt.min(6));
                debug!(url, attempt, "rate limited, backing off");
                tokio::time::sleep(backoff).await;
            }
            Ok(resp) => return Ok(resp),
            Err(e) if attempt < job.max_retries => {
                attempt += 1;
                let backoff = Duration::from_secs(1u64 << attempt.min(6));
                debug!(url, attempt, error = %e, "fetch failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn send_progress(events: &mpsc::Sender<CrawlEvent>, stats: &CrawlStats) {
    let _ = events
        .send(CrawlEvent::Progress {
            pages_fetched: stats.pages_fetched,
            pages_written: stats.pages_written,
            errors: stats.errors,
        })
        .await;
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        builder.add(Glob::new(pat)?);
    }
    Ok(builder.build()?)
}

/// Dedup key for visited URLs: scheme-insensitive, trailing-slash
/// insensitive, fragment-free.
fn visited_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    let path = url.path().trim_end_matches('/');
    match url.query() {
        Some(q) => format!("{}{}?{}", host, path, q),
        None => format!("{}{}", host, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchResponse, NetworkError};
    use crate::models::{ProjectConfig, ProjectConfigPatch};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Scripted fetcher: each URL maps to a queue of responses; once the
    /// queue is down to one entry it is repeated forever.
    struct MockFetcher {
        responses: Mutex<HashMap<String, VecDeque<Result<FetchResponse, String>>>>,
        fetches: AtomicU32,
    }

    impl MockFetcher {
        fn new() -> Self {
            MockFetcher {
                responses: Mutex::new(HashMap::new()),
                fetches: AtomicU32::new(0),
            }
        }

        fn html(self, url: &str, body: &str) -> Self {
            self.push(url, Ok(ok_html(url, body)));
            self
        }

        fn status(self, url: &str, status: u16) -> Self {
            self.push(
                url,
                Ok(FetchResponse {
                    status,
                    body: String::new(),
                    content_type: Some("text/html".to_string()),
                    final_url: url.to_string(),
                }),
            );
            self
        }

        fn push(&self, url: &str, resp: Result<FetchResponse, String>) {
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(resp);
        }
    }

    fn ok_html(url: &str, body: &str) -> FetchResponse {
        FetchResponse {
            status: 200,
            body: body.to_string(),
            content_type: Some("text/html".to_string()),
            final_url: url.to_string(),
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(
            &self,
            url: &str,
            _headers: &BTreeMap<String, String>,
        ) -> Result<FetchResponse, NetworkError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut map = self.responses.lock().unwrap();
            let queue = map.entry(url.to_string()).or_default();
            let resp = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            match resp {
                Some(Ok(r)) => Ok(r),
                Some(Err(msg)) => Err(NetworkError::InvalidUrl(msg)),
                None => Err(NetworkError::InvalidUrl(format!(
                    "no scripted response for {}",
                    url
                ))),
            }
        }
    }

    fn test_config() -> ProjectConfig {
        let defaults = crate::config::CrawlDefaults {
            rate_limit_delay_ms: 100,
            ..Default::default()
        };
        let patch = ProjectConfigPatch {
            max_depth: Some(2),
            rate_limit_delay_ms: Some(100),
            ..Default::default()
        };
        ProjectConfig::resolve(patch, &defaults).unwrap()
    }

    fn job(config: ProjectConfig) -> CrawlJob {
        CrawlJob {
            base_url: Url::parse("https://docs.test/").unwrap(),
            config,
            min_words: 3,
            max_retries: 2,
            user_agent: "docs-harness/test".to_string(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn page_body(text: &str) -> String {
        format!("<html><body><main><p>{}</p></main></body></html>", text)
    }

    async fn run(fetcher: MockFetcher, job: CrawlJob) -> (CrawlStats, Vec<CrawlEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let stats = crawl(Arc::new(fetcher), job, tx).await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        (stats, events)
    }

    #[tokio::test(start_paused = true)]
    async fn crawls_breadth_first_within_depth() {
        let fetcher = MockFetcher::new()
            .status("https://docs.test/robots.txt", 404)
            .html(
                "https://docs.test/",
                r#"<html><body><main><p>root page with words to spare</p>
                   <a href="/a">a</a><a href="/b">b</a></main></body></html>"#,
            )
            .html("https://docs.test/a", &page_body("page a has enough words"))
            .html("https://docs.test/b", &page_body("page b has enough words"));

        let (stats, events) = run(fetcher, job(test_config())).await;
        assert_eq!(stats.pages_fetched, 3);
        assert_eq!(stats.pages_written, 3);
        assert_eq!(stats.errors, 0);
        assert!(!stats.cancelled);

        let pages: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CrawlEvent::Page { url, .. } => Some(url.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(
            pages,
            vec![
                "https://docs.test/",
                "https://docs.test/a",
                "https://docs.test/b",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_429_then_succeeds() {
        let fetcher = MockFetcher::new().status("https://docs.test/robots.txt", 404);
        fetcher.push(
            "https://docs.test/",
            Ok(FetchResponse {
                status: 429,
                body: String::new(),
                content_type: Some("text/html".to_string()),
                final_url: "https://docs.test/".to_string(),
            }),
        );
        fetcher.push(
            "https://docs.test/",
            Ok(ok_html("https://docs.test/", &page_body("finally served after backoff"))),
        );

        let (stats, _) = run(fetcher, job(test_config())).await;
        assert_eq!(stats.pages_fetched, 1);
        assert_eq!(stats.pages_written, 1);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_page_errors() {
        let fetcher = MockFetcher::new().status("https://docs.test/robots.txt", 404);
        fetcher.push("https://docs.test/", Err("connection reset".to_string()));

        let (stats, events) = run(fetcher, job(test_config())).await;
        assert_eq!(stats.pages_written, 0);
        assert_eq!(stats.errors, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, CrawlEvent::PageError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn exclude_patterns_prune_frontier() {
        let mut config = test_config();
        config.exclude_patterns = vec!["*/skip*".to_string()];
        let fetcher = MockFetcher::new()
            .status("https://docs.test/robots.txt", 404)
            .html(
                "https://docs.test/",
                r#"<html><body><main><p>root page with words to spare</p>
                   <a href="/keep">keep</a><a href="/skip-me">skip</a></main></body></html>"#,
            )
            .html(
                "https://docs.test/keep",
                &page_body("kept page has plenty of words"),
            );

        let (stats, _) = run(fetcher, job(config)).await;
        assert_eq!(stats.pages_fetched, 2);
        assert_eq!(stats.pages_written, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_robots_skips_disallowed() {
        let fetcher = MockFetcher::new()
            .html(
                "https://docs.test/robots.txt",
                "User-agent: *\nDisallow: /private/\n",
            )
            .html(
                "https://docs.test/",
                r#"<html><body><main><p>root page with words to spare</p>
                   <a href="/private/x">hidden</a><a href="/open">open</a></main></body></html>"#,
            )
            .html(
                "https://docs.test/open",
                &page_body("open page has plenty of words"),
            );
        // robots.txt is served as text/html by the mock; the parser only
        // cares about the body.
        let mut config = test_config();
        config.robots_mode = RobotsMode::Strict;

        let (stats, events) = run(fetcher, job(config)).await;
        assert_eq!(stats.pages_written, 2);
        assert!(!events.iter().any(|e| match e {
            CrawlEvent::Page { url, .. } => url.path().starts_with("/private"),
            _ => false,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_flag_stops_the_frontier() {
        let fetcher = MockFetcher::new()
            .status("https://docs.test/robots.txt", 404)
            .html(
                "https://docs.test/",
                r#"<html><body><main><p>root page with words to spare</p>
                   <a href="/a">a</a><a href="/b">b</a></main></body></html>"#,
            )
            .html("https://docs.test/a", &page_body("page a has enough words"))
            .html("https://docs.test/b", &page_body("page b has enough words"));

        let j = job(test_config());
        // Flag already set: the first frontier pop observes it.
        j.cancel.store(true, Ordering::Relaxed);

        let (stats, _) = run(fetcher, j).await;
        assert!(stats.cancelled);
        assert_eq!(stats.pages_fetched, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_pages_caps_the_crawl() {
        let mut config = test_config();
        config.max_pages = 1;
        let fetcher = MockFetcher::new()
            .status("https://docs.test/robots.txt", 404)
            .html(
                "https://docs.test/",
                r#"<html><body><main><p>root page with words to spare</p>
                   <a href="/a">a</a></main></body></html>"#,
            )
            .html("https://docs.test/a", &page_body("page a has enough words"));

        let (stats, _) = run(fetcher, job(config)).await;
        assert_eq!(stats.pages_fetched, 1);
        assert_eq!(stats.pages_written, 1);
    }

    #[test]
    fn visited_keys_normalize() {
        let a = Url::parse("https://x.com/docs/").unwrap();
        let b = Url::parse("http://x.com/docs").unwrap();
        assert_eq!(visited_key(&a), visited_key(&b));

        let q = Url::parse("https://x.com/docs?page=2").unwrap();
        assert_ne!(visited_key(&a), visited_key(&q));
    }
}
