//! HTTP fetching behind a trait so the crawler can be driven by mocks in
//! tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// A completed HTTP response. `final_url` reflects any redirects followed.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub content_type: Option<String>,
    pub final_url: String,
}

impl FetchResponse {
    pub fn is_html(&self) -> bool {
        match &self.content_type {
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                ct.contains("text/html") || ct.contains("application/xhtml")
            }
            // Servers that omit the header get the benefit of the doubt.
            None => true,
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<FetchResponse, NetworkError>;
}

/// Production fetcher backed by reqwest with a shared connection pool.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<FetchResponse, NetworkError> {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().await.map_err(|source| NetworkError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = resp.text().await.map_err(|source| NetworkError::Transport {
            url: url.to_string(),
            source,
        })?;

        Ok(FetchResponse {
            status,
            body,
            content_type,
            final_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_detection() {
        let resp = FetchResponse {
            status: 200,
            body: String::new(),
            content_type: Some("text/html; charset=utf-8".to_string()),
            final_url: "https://example.com".to_string(),
        };
        assert!(resp.is_html());

        let pdf = FetchResponse {
            content_type: Some("application/pdf".to_string()),
            ..resp.clone()
        };
        assert!(!pdf.is_html());

        let missing = FetchResponse {
            content_type: None,
            ..resp
        };
        assert!(missing.is_html());
    }
}
