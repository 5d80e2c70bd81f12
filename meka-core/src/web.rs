//! Optional web search adapter.
//!
//! Web search is credential-gated: without an API key no adapter is built and
//! retrieval silently skips it. A failing search degrades to zero results.

use crate::config::WebConfig;
use crate::types::{Document, RetrievalSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Up to `max_results` external documents. Never fails.
    async fn search(&self, query: &str, max_results: usize) -> Vec<Document>;
}

/// Tavily search API client.
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    search_depth: String,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>, config: &WebConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("MEKA/0.3")
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            search_depth: config.search_depth.clone(),
        }
    }

    /// Build the adapter when web search is enabled and a credential is present.
    pub fn from_config(config: &WebConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        if config.provider != "tavily" {
            tracing::warn!(provider = %config.provider, "Unsupported web search provider");
            return None;
        }
        match config.resolve_api_key() {
            Some(key) => Some(Self::new(key, config)),
            None => {
                tracing::info!(
                    env = %config.api_key_env,
                    "No web search credential; web search disabled"
                );
                None
            }
        }
    }

    async fn request(&self, query: &str, max_results: usize) -> Result<Vec<Document>, String> {
        let url = format!("{}/search", self.base_url);
        let body = serde_json::json!({
            "query": query,
            "max_results": max_results,
            "search_depth": self.search_depth,
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let parsed: TavilyResponse = resp
            .json()
            .await
            .map_err(|e| format!("invalid response: {}", e))?;
        Ok(to_documents(parsed, max_results))
    }
}

fn to_documents(response: TavilyResponse, max_results: usize) -> Vec<Document> {
    response
        .results
        .into_iter()
        .filter_map(|r| {
            let content = if r.content.trim().is_empty() {
                r.title
            } else {
                r.content
            };
            if content.trim().is_empty() {
                return None;
            }
            Some(Document::new(content, r.url, "web").retrieved_by(RetrievalSource::Web))
        })
        .take(max_results)
        .collect()
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(&self, query: &str, max_results: usize) -> Vec<Document> {
        if max_results == 0 {
            return Vec::new();
        }
        match self.request(query, max_results).await {
            Ok(docs) => {
                tracing::debug!(results = docs.len(), "Web search finished");
                docs
            }
            Err(e) => {
                tracing::warn!(error = %e, "Web search failed; continuing without web results");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_documents_maps_fields() {
        let response: TavilyResponse = serde_json::from_value(serde_json::json!({
            "results": [
                {"title": "France", "url": "https://example.org/fr", "content": "Paris is the capital of France.", "score": 0.9},
                {"title": "Only title", "url": "https://example.org/t", "content": ""},
                {"title": "", "url": "https://example.org/empty", "content": "  "},
                {"title": "Extra", "url": "https://example.org/x", "content": "More text."}
            ]
        }))
        .unwrap();
        let docs = to_documents(response, 2);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].content, "Paris is the capital of France.");
        assert_eq!(docs[0].metadata.source, "https://example.org/fr");
        assert_eq!(docs[0].metadata.doc_type, "web");
        assert_eq!(docs[0].metadata.retrieved_by, Some(RetrievalSource::Web));
        assert_eq!(docs[1].content, "Only title");
    }

    #[test]
    fn test_missing_results_key() {
        let response: TavilyResponse = serde_json::from_str("{}").unwrap();
        assert!(to_documents(response, 3).is_empty());
    }

    #[test]
    fn test_from_config_gating() {
        let disabled = WebConfig {
            enabled: false,
            api_key: Some("tvly-key".into()),
            ..Default::default()
        };
        assert!(TavilySearch::from_config(&disabled).is_none());

        let no_key = WebConfig {
            api_key: None,
            api_key_env: "MEKA_TEST_UNSET_TAVILY_KEY".into(),
            ..Default::default()
        };
        assert!(TavilySearch::from_config(&no_key).is_none());

        let ready = WebConfig {
            api_key: Some("tvly-key".into()),
            ..Default::default()
        };
        assert!(TavilySearch::from_config(&ready).is_some());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_degrades_to_empty() {
        let config = WebConfig {
            api_key: Some("tvly-key".into()),
            base_url: "http://127.0.0.1:9".into(),
            timeout_secs: 2,
            ..Default::default()
        };
        let search = TavilySearch::from_config(&config).unwrap();
        assert!(search.search("capital of France", 3).await.is_empty());
    }
}
