//! Persisted dense vector index backed by SQLite.
//!
//! Chunk embeddings are stored as little-endian `f32` blobs. Search is an
//! exhaustive cosine scan, which is adequate for corpora of a few thousand
//! chunks. All SQLite work runs on the blocking pool.

use crate::embeddings::{Embedder, cosine_similarity};
use crate::error::IndexError;
use crate::types::{Document, RetrievalSource};
use async_trait::async_trait;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Dense similarity search over the corpus.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Top `k` documents by embedding similarity, most similar first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, IndexError>;

    /// Wipe the index and re-embed `docs`. Returns the number of stored rows.
    async fn rebuild(&self, docs: &[Document]) -> Result<usize, IndexError>;

    /// Number of stored documents.
    async fn count(&self) -> Result<usize, IndexError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    content   TEXT NOT NULL,
    source    TEXT NOT NULL,
    doc_type  TEXT NOT NULL,
    embedding BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS index_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub struct SqliteVectorStore {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl std::fmt::Debug for SqliteVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorStore")
            .field("embedder", &self.embedder.provider_name())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl SqliteVectorStore {
    /// Open (or create) the index file at `path`.
    pub fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| IndexError::Vector {
                message: format!("Failed to create index directory: {}", e),
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, embedder)
    }

    pub fn open_in_memory(embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        Self::from_connection(Connection::open_in_memory()?, embedder)
    }

    fn from_connection(conn: Connection, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
            batch_size: 32,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, IndexError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, IndexError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| IndexError::Vector {
                message: "Vector store connection lock poisoned".to_string(),
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| IndexError::Vector {
            message: format!("Vector store task failed: {}", e),
        })?
    }

    /// Identity of the current embedder, as recorded on rebuild.
    pub fn embedder_id(&self) -> String {
        format!(
            "{}:{}",
            self.embedder.provider_name(),
            self.embedder.dimensions()
        )
    }

    /// Embedder identity recorded at the last rebuild, if any.
    pub async fn indexed_with(&self) -> Result<Option<String>, IndexError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM index_meta WHERE key = 'embedder'")?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
        .await
    }
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[async_trait]
impl VectorSearch for SqliteVectorStore {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;

        let mut scored = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT content, source, doc_type, embedding FROM embeddings ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| {
                    let blob: Vec<u8> = row.get(3)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        cosine_similarity(&query_embedding, &decode_embedding(&blob)),
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        // Stable: equal similarities keep insertion order.
        scored.sort_by(|a, b| b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(content, source, doc_type, _)| {
                Document::new(content, source, doc_type).retrieved_by(RetrievalSource::Vector)
            })
            .collect())
    }

    async fn rebuild(&self, docs: &[Document]) -> Result<usize, IndexError> {
        let mut rows = Vec::with_capacity(docs.len());
        for batch in docs.chunks(self.batch_size) {
            let texts: Vec<&str> = batch.iter().map(|d| d.content.as_str()).collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;
            for (doc, embedding) in batch.iter().zip(embeddings) {
                rows.push((
                    doc.content.clone(),
                    doc.metadata.source.clone(),
                    doc.metadata.doc_type.clone(),
                    encode_embedding(&embedding),
                ));
            }
        }

        let embedder_id = self.embedder_id();
        let stored = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM embeddings", [])?;
                {
                    let mut insert = tx.prepare(
                        "INSERT INTO embeddings (content, source, doc_type, embedding) VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (content, source, doc_type, blob) in &rows {
                        insert.execute(params![content, source, doc_type, blob])?;
                    }
                }
                tx.execute(
                    "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('embedder', ?1)",
                    params![embedder_id],
                )?;
                tx.commit()?;
                Ok(rows.len())
            })
            .await?;

        tracing::info!(documents = stored, "Vector index rebuilt");
        Ok(stored)
    }

    async fn count(&self) -> Result<usize, IndexError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;

    fn docs() -> Vec<Document> {
        vec![
            Document::new("Paris is the capital of France.", "geo.txt", "text"),
            Document::new("Rust guarantees memory safety.", "rust.md", "markdown"),
            Document::new("Berlin is the capital of Germany.", "geo.txt", "text"),
        ]
    }

    fn store() -> SqliteVectorStore {
        SqliteVectorStore::open_in_memory(Arc::new(LocalEmbedder::new(256))).unwrap()
    }

    #[tokio::test]
    async fn test_empty_store() {
        let store = store();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.search("anything", 5).await.unwrap().is_empty());
        assert!(store.indexed_with().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebuild_and_search() {
        let store = store();
        assert_eq!(store.rebuild(&docs()).await.unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 3);

        let results = store.search("What is the capital of France?", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "Paris is the capital of France.");
        assert_eq!(results[0].metadata.retrieved_by, Some(RetrievalSource::Vector));
        assert!(results[0].metadata.score.is_none());
        assert_eq!(
            store.indexed_with().await.unwrap().as_deref(),
            Some("local:256")
        );
    }

    #[tokio::test]
    async fn test_rebuild_wipes_previous_rows() {
        let store = store().with_batch_size(1);
        store.rebuild(&docs()).await.unwrap();
        store
            .rebuild(&[Document::new("Only one chunk.", "one.txt", "text")])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        let results = store.search("chunk", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.source, "one.txt");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vectors.db");
        {
            let store =
                SqliteVectorStore::open(&path, Arc::new(LocalEmbedder::new(64))).unwrap();
            store.rebuild(&docs()).await.unwrap();
        }
        let reopened = SqliteVectorStore::open(&path, Arc::new(LocalEmbedder::new(64))).unwrap();
        assert_eq!(reopened.count().await.unwrap(), 3);
    }

    #[test]
    fn test_embedding_blob_encoding() {
        let v = vec![0.5f32, -1.25, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }
}
