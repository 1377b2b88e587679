//! Minimal robots.txt handling.
//!
//! The parser understands user-agent groups, `Disallow` prefix rules, and
//! `Crawl-delay`. A group addressed to our user agent (substring match on
//! the product token) wins over the `*` group. Anything the parser does not
//! recognize is ignored.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::fetch::Fetcher;

/// How robots.txt is honored for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RobotsMode {
    /// Honor both Disallow rules and Crawl-delay.
    Strict,
    /// Honor Crawl-delay only; fetch disallowed paths anyway.
    #[default]
    Permissive,
    /// Skip robots.txt entirely.
    Ignore,
}

impl RobotsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RobotsMode::Strict => "strict",
            RobotsMode::Permissive => "permissive",
            RobotsMode::Ignore => "ignore",
        }
    }

    pub fn parse(s: &str) -> Option<RobotsMode> {
        match s {
            "strict" => Some(RobotsMode::Strict),
            "permissive" => Some(RobotsMode::Permissive),
            "ignore" => Some(RobotsMode::Ignore),
            _ => None,
        }
    }
}

/// Parsed policy for a single host.
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    disallow: Vec<String>,
    crawl_delay: Option<Duration>,
}

impl RobotsPolicy {
    /// Parse robots.txt text, keeping the group that best matches
    /// `user_agent`. The product token before any '/' is used for matching.
    pub fn parse(text: &str, user_agent: &str) -> RobotsPolicy {
        let token = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .to_ascii_lowercase();

        let mut specific = RobotsPolicy::default();
        let mut wildcard = RobotsPolicy::default();
        let mut saw_specific = false;

        // Which groups the current rules apply to.
        let mut in_specific = false;
        let mut in_wildcard = false;
        let mut last_was_ua = false;

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    if !last_was_ua {
                        in_specific = false;
                        in_wildcard = false;
                    }
                    let ua = value.to_ascii_lowercase();
                    if ua == "*" {
                        in_wildcard = true;
                    } else if token.contains(&ua) || ua.contains(&token) {
                        in_specific = true;
                        saw_specific = true;
                    }
                    last_was_ua = true;
                }
                "disallow" => {
                    last_was_ua = false;
                    if value.is_empty() {
                        continue;
                    }
                    if in_specific {
                        specific.disallow.push(value.to_string());
                    }
                    if in_wildcard {
                        wildcard.disallow.push(value.to_string());
                    }
                }
                "crawl-delay" => {
                    last_was_ua = false;
                    if let Ok(secs) = value.parse::<f64>() {
                        if secs >= 0.0 {
                            let delay = Duration::from_millis((secs * 1000.0) as u64);
                            if in_specific {
                                specific.crawl_delay = Some(delay);
                            }
                            if in_wildcard {
                                wildcard.crawl_delay = Some(delay);
                            }
                        }
                    }
                }
                _ => {
                    last_was_ua = false;
                }
            }
        }

        if saw_specific {
            specific
        } else {
            wildcard
        }
    }

    pub fn allows(&self, url: &Url) -> bool {
        let path = url.path();
        !self.disallow.iter().any(|prefix| path.starts_with(prefix))
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }
}

/// Fetch and parse robots.txt for the host of `base`. Any failure (network
/// error, non-200) yields an empty policy: everything allowed, no delay.
pub async fn fetch_policy(fetcher: &Arc<dyn Fetcher>, base: &Url, user_agent: &str) -> RobotsPolicy {
    let mut robots_url = base.clone();
    robots_url.set_path("/robots.txt");
    robots_url.set_query(None);
    robots_url.set_fragment(None);

    match fetcher.fetch(robots_url.as_str(), &BTreeMap::new()).await {
        Ok(resp) if resp.status == 200 => RobotsPolicy::parse(&resp.body, user_agent),
        Ok(_) | Err(_) => RobotsPolicy::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
User-agent: *
Disallow: /private/
Crawl-delay: 2

User-agent: docs-harness
Disallow: /internal/
Crawl-delay: 0.5
";

    #[test]
    fn specific_group_wins() {
        let policy = RobotsPolicy::parse(SAMPLE, "docs-harness/0.3.0");
        let blocked = Url::parse("https://example.com/internal/x").unwrap();
        let open = Url::parse("https://example.com/private/x").unwrap();
        assert!(!policy.allows(&blocked));
        assert!(policy.allows(&open));
        assert_eq!(policy.crawl_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn wildcard_fallback() {
        let policy = RobotsPolicy::parse(SAMPLE, "otherbot/1.0");
        let blocked = Url::parse("https://example.com/private/x").unwrap();
        assert!(!policy.allows(&blocked));
        assert_eq!(policy.crawl_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = RobotsPolicy::default();
        let url = Url::parse("https://example.com/anything").unwrap();
        assert!(policy.allows(&url));
        assert_eq!(policy.crawl_delay(), None);
    }

    #[test]
    fn mode_round_trip() {
        for m in [RobotsMode::Strict, RobotsMode::Permissive, RobotsMode::Ignore] {
            assert_eq!(RobotsMode::parse(m.as_str()), Some(m));
        }
        assert_eq!(RobotsMode::default(), RobotsMode::Permissive);
    }
}
