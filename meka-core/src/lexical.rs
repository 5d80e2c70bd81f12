//! Sparse keyword retrieval: an in-memory Tantivy BM25 index over the corpus.
//!
//! The index is built lazily on first search and then cached for the life of
//! the process. Only an explicit rebuild replaces it.

use crate::corpus::CorpusSupplier;
use crate::error::IndexError;
use crate::types::{Document, RetrievalSource};
use async_trait::async_trait;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, STORED, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, doc};
use tokio::sync::Mutex;

/// Keyword search over the corpus.
#[async_trait]
pub trait LexicalSearch: Send + Sync {
    /// Top `k` BM25 matches, best first. An empty corpus yields no results.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, IndexError>;

    /// Replace the cached index with one built from `docs`.
    async fn rebuild(&self, docs: &[Document]) -> Result<usize, IndexError>;
}

/// An immutable BM25 index.
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    content_field: Field,
    source_field: Field,
    doc_type_field: Field,
    len: usize,
}

impl std::fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalIndex").field("len", &self.len).finish()
    }
}

impl LexicalIndex {
    pub fn build(docs: &[Document]) -> Result<Self, IndexError> {
        let mut schema_builder = Schema::builder();
        let content_field = schema_builder.add_text_field("content", TEXT | STORED);
        let source_field = schema_builder.add_text_field("source", STORED);
        let doc_type_field = schema_builder.add_text_field("doc_type", STORED);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let mut writer: IndexWriter = index.writer(50_000_000)?;
        for d in docs {
            writer.add_document(doc!(
                content_field => d.content.as_str(),
                source_field => d.metadata.source.as_str(),
                doc_type_field => d.metadata.doc_type.as_str(),
            ))?;
        }
        writer.commit()?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            content_field,
            source_field,
            doc_type_field,
            len: docs.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, IndexError> {
        if k == 0 || query.trim().is_empty() || self.is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.content_field]);
        // Natural-language questions routinely contain query syntax ('?', ':').
        let (parsed, errors) = query_parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!(
                errors = errors.len(),
                "Lexical query parsed leniently"
            );
        }

        let top_docs = searcher.search(&parsed, &TopDocs::with_limit(k))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (_score, address) in top_docs {
            let stored: TantivyDocument = searcher.doc(address)?;
            let text = |field: Field| {
                stored
                    .get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            results.push(
                Document::new(
                    text(self.content_field),
                    text(self.source_field),
                    text(self.doc_type_field),
                )
                .retrieved_by(RetrievalSource::Lexical),
            );
        }
        Ok(results)
    }
}

enum LexicalState {
    NotBuilt,
    Ready(Arc<LexicalIndex>),
}

/// Process-wide lexical index, built from the corpus on first use.
pub struct CachedLexicalIndex {
    corpus: Arc<dyn CorpusSupplier>,
    state: Mutex<LexicalState>,
}

impl CachedLexicalIndex {
    pub fn new(corpus: Arc<dyn CorpusSupplier>) -> Self {
        Self {
            corpus,
            state: Mutex::new(LexicalState::NotBuilt),
        }
    }

    pub async fn is_built(&self) -> bool {
        matches!(*self.state.lock().await, LexicalState::Ready(_))
    }

    async fn build_index(docs: Vec<Document>) -> Result<Arc<LexicalIndex>, IndexError> {
        let index = tokio::task::spawn_blocking(move || LexicalIndex::build(&docs))
            .await
            .map_err(|e| IndexError::Lexical {
                message: format!("Index build task failed: {}", e),
            })??;
        Ok(Arc::new(index))
    }

    /// The cached index, building it on first call. Concurrent first callers
    /// wait on the same build.
    async fn current(&self) -> Result<Arc<LexicalIndex>, IndexError> {
        let mut state = self.state.lock().await;
        if let LexicalState::Ready(index) = &*state {
            return Ok(Arc::clone(index));
        }
        let docs = self.corpus.documents().await?;
        let index = Self::build_index(docs).await?;
        tracing::info!(documents = index.len(), "Lexical index built");
        *state = LexicalState::Ready(Arc::clone(&index));
        Ok(index)
    }
}

#[async_trait]
impl LexicalSearch for CachedLexicalIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, IndexError> {
        let index = self.current().await?;
        if index.is_empty() {
            return Ok(Vec::new());
        }
        index.search(query, k)
    }

    async fn rebuild(&self, docs: &[Document]) -> Result<usize, IndexError> {
        let index = Self::build_index(docs.to_vec()).await?;
        let len = index.len();
        *self.state.lock().await = LexicalState::Ready(index);
        tracing::info!(documents = len, "Lexical index rebuilt");
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::StaticCorpus;

    fn docs() -> Vec<Document> {
        vec![
            Document::new("Paris is the capital of France.", "geo.txt", "text"),
            Document::new("Tokio is an asynchronous runtime for Rust.", "rust.md", "markdown"),
            Document::new("The Loire flows through France.", "rivers.txt", "text"),
        ]
    }

    #[test]
    fn test_build_and_search() {
        let index = LexicalIndex::build(&docs()).unwrap();
        assert_eq!(index.len(), 3);
        let results = index.search("What is the capital of France?", 5).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].content, "Paris is the capital of France.");
        assert_eq!(results[0].metadata.source, "geo.txt");
        assert_eq!(results[0].metadata.doc_type, "text");
        assert_eq!(
            results[0].metadata.retrieved_by,
            Some(RetrievalSource::Lexical)
        );
    }

    #[test]
    fn test_search_respects_k() {
        let index = LexicalIndex::build(&docs()).unwrap();
        assert_eq!(index.search("France", 1).unwrap().len(), 1);
        assert!(index.search("France", 0).unwrap().is_empty());
    }

    #[test]
    fn test_search_handles_query_syntax() {
        let index = LexicalIndex::build(&docs()).unwrap();
        let results = index.search("Which runtime does Rust use?", 5).unwrap();
        assert!(results.iter().any(|d| d.content.starts_with("Tokio")));
    }

    #[test]
    fn test_empty_index() {
        let index = LexicalIndex::build(&[]).unwrap();
        assert!(index.is_empty());
        assert!(index.search("anything", 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cached_index_builds_once_and_rebuilds() {
        let corpus = Arc::new(StaticCorpus::from_texts(["Paris is the capital of France."]));
        let cached = CachedLexicalIndex::new(corpus);
        assert!(!cached.is_built().await);

        let hits = cached.search("capital", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(cached.is_built().await);

        cached
            .rebuild(&[Document::new("Madrid is the capital of Spain.", "es.txt", "text")])
            .await
            .unwrap();
        let hits = cached.search("capital", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Madrid is the capital of Spain.");
    }

    #[tokio::test]
    async fn test_cached_index_empty_corpus() {
        let cached = CachedLexicalIndex::new(Arc::new(StaticCorpus::new(Vec::new())));
        assert!(cached.search("capital", 5).await.unwrap().is_empty());
    }
}
