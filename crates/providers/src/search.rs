//! Web-search client used by the `<edward_web_search>` tool.

use serde::{Deserialize, Serialize};

use ed_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait::async_trait]
pub trait WebSearchClient: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Calls a search endpoint that returns `{ "results": [SearchResult] }`.
///
/// The endpoint URL is operator-configured; only http/https schemes and
/// non-literal-private hosts are accepted so a misconfigured endpoint
/// cannot be pointed at internal services.
pub struct HttpSearchClient {
    endpoint: String,
    max_results_cap: usize,
    client: reqwest::Client,
}

impl HttpSearchClient {
    pub fn new(endpoint: &str, max_results_cap: usize, timeout: std::time::Duration) -> Result<Self> {
        validate_endpoint(endpoint)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            max_results_cap,
            client,
        })
    }
}

fn validate_endpoint(raw: &str) -> Result<()> {
    let url = reqwest::Url::parse(raw).map_err(|e| Error::Validation(format!("search endpoint: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Validation(format!(
                "search endpoint: blocked scheme {other}://"
            )))
        }
    }
    if let Some(host) = url.host_str() {
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            let private = match ip {
                std::net::IpAddr::V4(v4) => {
                    v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
                }
                std::net::IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
            };
            // Loopback is allowed for local development proxies.
            if private && !ip.is_loopback() {
                return Err(Error::Validation(
                    "search endpoint: private address".into(),
                ));
            }
        }
    } else {
        return Err(Error::Validation("search endpoint has no host".into()));
    }
    Ok(())
}

/// Placeholder when no search endpoint is configured: every query is
/// reported back to the model as unavailable.
pub struct DisabledSearch;

#[async_trait::async_trait]
impl WebSearchClient for DisabledSearch {
    async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<SearchResult>> {
        Err(Error::Validation("web search is not configured".into()))
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[async_trait::async_trait]
impl WebSearchClient for HttpSearchClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let limit = max_results.min(self.max_results_cap).max(1);
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("web search: {e}"))
                } else {
                    Error::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "search endpoint returned {}",
                response.status()
            )));
        }

        let mut parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        parsed.results.truncate(limit);
        Ok(parsed.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_scheme_validation() {
        assert!(validate_endpoint("https://search.example/api").is_ok());
        assert!(validate_endpoint("http://127.0.0.1:8080/search").is_ok());
        assert!(validate_endpoint("file:///etc/passwd").is_err());
        assert!(validate_endpoint("https://10.0.0.5/search").is_err());
        assert!(validate_endpoint("not a url").is_err());
    }
}
