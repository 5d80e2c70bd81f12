//! Relevance reranking of retrieved documents.
//!
//! A `RelevanceScorer` assigns one score per (query, passage) pair; the
//! `RelevanceReranker` attaches those scores, stable-sorts descending and keeps
//! the best `top_k`.

use crate::config::{RerankerConfig, RerankerProvider};
use crate::error::IndexError;
use crate::types::Document;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Scores passages against a query. Higher is more relevant.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// One score per passage, in input order.
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, IndexError>;

    fn name(&self) -> &str;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "in",
    "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where",
    "which", "who", "why", "with",
];

fn content_terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Local scorer: fraction of the query's content terms present in the passage.
#[derive(Debug, Clone, Default)]
pub struct TermOverlapScorer;

impl TermOverlapScorer {
    pub fn score_one(query_terms: &HashSet<String>, passage: &str) -> f32 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let passage_terms = content_terms(passage);
        let hits = query_terms
            .iter()
            .filter(|t| passage_terms.contains(*t))
            .count();
        hits as f32 / query_terms.len() as f32
    }
}

#[async_trait]
impl RelevanceScorer for TermOverlapScorer {
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, IndexError> {
        let query_terms = content_terms(query);
        Ok(passages
            .iter()
            .map(|p| Self::score_one(&query_terms, p))
            .collect())
    }

    fn name(&self) -> &str {
        "overlap"
    }
}

/// Cross-encoder scorer served over HTTP with the text-embeddings-inference
/// `/rerank` API.
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    batch_size: usize,
}

#[derive(Debug, Deserialize)]
struct RerankHit {
    index: usize,
    score: f32,
}

impl HttpCrossEncoder {
    pub fn new(config: &RerankerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
        }
    }

    async fn score_batch(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>, IndexError> {
        let url = format!("{}/rerank", self.base_url);
        let body = serde_json::json!({
            "query": query,
            "texts": texts,
            "raw_scores": false,
        });
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| IndexError::Scorer {
                message: format!("Rerank request failed: {}", e),
            })?;
        if !resp.status().is_success() {
            return Err(IndexError::Scorer {
                message: format!("Rerank server returned HTTP {}", resp.status()),
            });
        }
        let hits: Vec<RerankHit> = resp.json().await.map_err(|e| IndexError::Scorer {
            message: format!("Invalid rerank response: {}", e),
        })?;
        scores_from_hits(hits, texts.len())
    }
}

/// Place scored hits back into input order.
fn scores_from_hits(hits: Vec<RerankHit>, expected: usize) -> Result<Vec<f32>, IndexError> {
    let mut scores = vec![None; expected];
    for hit in hits {
        let slot = scores.get_mut(hit.index).ok_or_else(|| IndexError::Scorer {
            message: format!("Rerank hit index {} out of range", hit.index),
        })?;
        *slot = Some(hit.score);
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            s.ok_or_else(|| IndexError::Scorer {
                message: format!("Rerank response missing score for passage {}", i),
            })
        })
        .collect()
}

#[async_trait]
impl RelevanceScorer for HttpCrossEncoder {
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, IndexError> {
        let mut scores = Vec::with_capacity(passages.len());
        for batch in passages.chunks(self.batch_size) {
            scores.extend(self.score_batch(query, batch).await?);
        }
        tracing::debug!(
            model = %self.model,
            passages = passages.len(),
            "Cross-encoder scoring finished"
        );
        Ok(scores)
    }

    fn name(&self) -> &str {
        "cross-encoder"
    }
}

pub fn create_scorer(config: &RerankerConfig) -> Arc<dyn RelevanceScorer> {
    match config.provider {
        RerankerProvider::Overlap => Arc::new(TermOverlapScorer),
        RerankerProvider::CrossEncoder => Arc::new(HttpCrossEncoder::new(config)),
    }
}

/// Attach `scores` to `docs`, stable-sort descending and keep `top_k`.
///
/// Equal scores keep their input order. NaN scores sort last.
pub fn rank_by_scores(docs: &[Document], scores: &[f32], top_k: usize) -> Vec<Document> {
    let mut ranked: Vec<Document> = docs
        .iter()
        .zip(scores.iter())
        .map(|(doc, &score)| {
            let score = if score.is_nan() { f32::MIN } else { score };
            doc.clone().with_score(score)
        })
        .collect();
    ranked.sort_by(|a, b| {
        let sa = a.metadata.score.unwrap_or(f32::MIN);
        let sb = b.metadata.score.unwrap_or(f32::MIN);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(top_k);
    ranked
}

/// Scores and truncates retrieved documents.
pub struct RelevanceReranker {
    scorer: Arc<dyn RelevanceScorer>,
    top_k: usize,
}

impl RelevanceReranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>, top_k: usize) -> Self {
        Self { scorer, top_k }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub async fn rerank(&self, query: &str, docs: &[Document]) -> Result<Vec<Document>, IndexError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let passages: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
        let scores = self.scorer.score(query, &passages).await?;
        if scores.len() != docs.len() {
            return Err(IndexError::Scorer {
                message: format!(
                    "{} scorer returned {} scores for {} documents",
                    self.scorer.name(),
                    scores.len(),
                    docs.len()
                ),
            });
        }
        Ok(rank_by_scores(docs, &scores, self.top_k))
    }
}
