//! Hybrid retrieval: dense vector search, BM25 keyword search and optional web
//! search composed into one candidate list.
//!
//! Merge order is vector results (the base list), then lexical results whose
//! content is not already present, then web results appended as-is.

use crate::config::RetrievalConfig;
use crate::corpus::CorpusSupplier;
use crate::error::IndexError;
use crate::lexical::LexicalSearch;
use crate::types::Document;
use crate::vector_store::VectorSearch;
use crate::web::WebSearch;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

/// Retrieved candidates plus per-source counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retrieval {
    pub documents: Vec<Document>,
    pub vector: usize,
    pub lexical_added: usize,
    pub web: usize,
}

/// Merge the three result lists.
///
/// Vector and lexical results are deduplicated on byte-identical content, the
/// first occurrence winning. Web results are never deduplicated.
pub fn merge_results(
    vector: Vec<Document>,
    lexical: Vec<Document>,
    web: Vec<Document>,
) -> Retrieval {
    let mut seen: HashSet<String> = HashSet::new();
    let mut documents = Vec::with_capacity(vector.len() + lexical.len() + web.len());

    for doc in vector {
        if seen.insert(doc.content.clone()) {
            documents.push(doc);
        }
    }
    let vector_count = documents.len();

    for doc in lexical {
        if seen.insert(doc.content.clone()) {
            documents.push(doc);
        }
    }
    let lexical_added = documents.len() - vector_count;

    let web_count = web.len();
    documents.extend(web);

    Retrieval {
        documents,
        vector: vector_count,
        lexical_added,
        web: web_count,
    }
}

pub struct HybridRetriever {
    vector: Arc<dyn VectorSearch>,
    lexical: Arc<dyn LexicalSearch>,
    web: Option<Arc<dyn WebSearch>>,
    corpus: Arc<dyn CorpusSupplier>,
    config: RetrievalConfig,
    cold_start: OnceCell<()>,
}

impl HybridRetriever {
    pub fn new(
        vector: Arc<dyn VectorSearch>,
        lexical: Arc<dyn LexicalSearch>,
        web: Option<Arc<dyn WebSearch>>,
        corpus: Arc<dyn CorpusSupplier>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            vector,
            lexical,
            web,
            corpus,
            config,
            cold_start: OnceCell::new(),
        }
    }

    pub fn web_available(&self) -> bool {
        self.web.is_some()
    }

    /// Rebuild the vector index from the corpus if it is empty. Runs at most
    /// once per process; concurrent first callers wait for the same rebuild.
    pub async fn ensure_vector_index(&self) -> Result<(), IndexError> {
        self.cold_start
            .get_or_try_init(|| self.cold_start_rebuild())
            .await
            .map(|_| ())
    }

    async fn cold_start_rebuild(&self) -> Result<(), IndexError> {
        if self.vector.count().await? > 0 {
            return Ok(());
        }
        let start = Instant::now();
        tracing::info!("Vector index is empty; rebuilding from corpus");
        let docs = self.corpus.documents().await?;
        let timeout_secs = self.config.cold_start_timeout_secs;
        let stored = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.vector.rebuild(&docs),
        )
        .await
        .map_err(|_| IndexError::ColdStartTimeout { timeout_secs })??;
        tracing::info!(
            documents = stored,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cold-start vector rebuild finished"
        );
        Ok(())
    }

    pub async fn retrieve(&self, query: &str, web_enabled: bool) -> Result<Retrieval, IndexError> {
        self.ensure_vector_index().await?;

        // Vector results form the base list, so vector search completes first.
        let vector = self.vector.search(query, self.config.vector_k).await?;
        let lexical = self.lexical.search(query, self.config.lexical_k).await?;

        let web = match (&self.web, web_enabled) {
            (Some(web), true) => web.search(query, self.config.web_max_results).await,
            (None, true) => {
                tracing::debug!("Web search requested but no web adapter is configured");
                Vec::new()
            }
            _ => Vec::new(),
        };

        let retrieval = merge_results(vector, lexical, web);
        tracing::debug!(
            vector = retrieval.vector,
            lexical_added = retrieval.lexical_added,
            web = retrieval.web,
            "Hybrid retrieval merged"
        );
        Ok(retrieval)
    }

    /// Rebuild both indexes from the corpus. Returns (vector rows, lexical docs).
    pub async fn resync(&self) -> Result<(usize, usize), IndexError> {
        let docs = self.corpus.documents().await?;
        let vector = self.vector.rebuild(&docs).await?;
        let lexical = self.lexical.rebuild(&docs).await?;
        tracing::info!(vector, lexical, "Indexes resynced from corpus");
        Ok((vector, lexical))
    }
}
