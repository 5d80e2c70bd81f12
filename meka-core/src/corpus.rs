//! Corpus suppliers: where the documents behind both indexes come from.
//!
//! A supplier loads raw documents and splits them into retrievable chunks.
//! Both the vector index and the lexical index are built from the same chunk
//! list so that byte-identical content can be deduplicated across them.

use crate::config::CorpusConfig;
use crate::error::IndexError;
use crate::types::Document;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A document before chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub content: String,
    pub source: String,
    pub doc_type: String,
}

impl RawDocument {
    pub fn new(
        content: impl Into<String>,
        source: impl Into<String>,
        doc_type: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            doc_type: doc_type.into(),
        }
    }
}

#[async_trait]
pub trait CorpusSupplier: Send + Sync {
    async fn load(&self) -> Result<Vec<RawDocument>, IndexError>;

    fn chunk(&self, raw: &[RawDocument]) -> Vec<Document>;

    /// Load and chunk in one step.
    async fn documents(&self) -> Result<Vec<Document>, IndexError> {
        let raw = self.load().await?;
        Ok(self.chunk(&raw))
    }
}

/// Size/overlap character chunker.
///
/// Paragraphs (blank-line separated) are packed greedily up to `chunk_size`
/// characters. A single paragraph longer than that is cut into windows of
/// `chunk_size` that share `chunk_overlap` characters.
#[derive(Debug, Clone, Copy)]
pub struct TextChunker {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    pub fn from_config(config: &CorpusConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn chunk_text(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if text.chars().count() <= self.chunk_size {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let para_len = paragraph.chars().count();

            if para_len > self.chunk_size {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                chunks.extend(self.split_long(paragraph));
                continue;
            }

            // +2 for the "\n\n" joiner
            let joined_len = if current.is_empty() {
                para_len
            } else {
                current_len + 2 + para_len
            };
            if joined_len > self.chunk_size {
                chunks.push(std::mem::take(&mut current));
                current.push_str(paragraph);
                current_len = para_len;
            } else {
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(paragraph);
                current_len = joined_len;
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    fn split_long(&self, paragraph: &str) -> Vec<String> {
        let chars: Vec<char> = paragraph.chars().collect();
        let step = if self.chunk_overlap < self.chunk_size {
            self.chunk_size - self.chunk_overlap
        } else {
            self.chunk_size
        };

        let mut out = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            out.push(chars[start..end].iter().collect::<String>().trim().to_string());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        out.retain(|c| !c.is_empty());
        out
    }

    /// Chunk every raw document, keeping its source and type.
    pub fn chunk_documents(&self, raw: &[RawDocument]) -> Vec<Document> {
        raw.iter()
            .flat_map(|doc| {
                self.chunk_text(&doc.content)
                    .into_iter()
                    .map(|chunk| Document::new(chunk, doc.source.clone(), doc.doc_type.clone()))
            })
            .collect()
    }
}

/// Plain-text and markdown files under a directory.
pub struct DirectoryCorpus {
    root: PathBuf,
    extensions: Vec<String>,
    chunker: TextChunker,
}

impl DirectoryCorpus {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>, chunker: TextChunker) -> Self {
        Self {
            root: root.into(),
            extensions,
            chunker,
        }
    }

    pub fn from_config(config: &CorpusConfig, root: impl Into<PathBuf>) -> Self {
        Self::new(
            root,
            config.extensions.clone(),
            TextChunker::from_config(config),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn doc_type_for(ext: &str) -> &'static str {
    match ext {
        "md" | "markdown" => "markdown",
        _ => "text",
    }
}

fn scan_directory(root: &Path, extensions: &[String]) -> Result<Vec<RawDocument>, IndexError> {
    let mut paths: Vec<(PathBuf, String)> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let ext = e.path().extension()?.to_str()?.to_lowercase();
            extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
                .then(|| (e.path().to_path_buf(), ext))
        })
        .collect();
    // Stable ordering keeps index rebuilds reproducible.
    paths.sort();

    let mut docs = Vec::with_capacity(paths.len());
    for (path, ext) in paths {
        let content = std::fs::read_to_string(&path).map_err(|e| IndexError::Corpus {
            path: path.clone(),
            message: e.to_string(),
        })?;
        docs.push(RawDocument::new(
            content,
            path.display().to_string(),
            doc_type_for(&ext),
        ));
    }
    Ok(docs)
}

#[async_trait]
impl CorpusSupplier for DirectoryCorpus {
    async fn load(&self) -> Result<Vec<RawDocument>, IndexError> {
        if !self.root.is_dir() {
            tracing::warn!(
                path = %self.root.display(),
                "Corpus directory does not exist; corpus is empty"
            );
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let extensions = self.extensions.clone();
        let docs = tokio::task::spawn_blocking(move || scan_directory(&root, &extensions))
            .await
            .map_err(|e| IndexError::Corpus {
                path: self.root.clone(),
                message: format!("Corpus scan task failed: {}", e),
            })??;
        tracing::debug!(
            path = %self.root.display(),
            files = docs.len(),
            "Loaded corpus files"
        );
        Ok(docs)
    }

    fn chunk(&self, raw: &[RawDocument]) -> Vec<Document> {
        self.chunker.chunk_documents(raw)
    }
}

/// A fixed in-memory corpus.
pub struct StaticCorpus {
    docs: Vec<RawDocument>,
    chunker: TextChunker,
}

impl StaticCorpus {
    pub fn new(docs: Vec<RawDocument>) -> Self {
        Self {
            docs,
            chunker: TextChunker::default(),
        }
    }

    /// One text document per entry, sourced as `static:<index>`.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            texts
                .into_iter()
                .enumerate()
                .map(|(i, t)| RawDocument::new(t, format!("static:{}", i), "text"))
                .collect(),
        )
    }

    pub fn with_chunker(mut self, chunker: TextChunker) -> Self {
        self.chunker = chunker;
        self
    }
}

#[async_trait]
impl CorpusSupplier for StaticCorpus {
    async fn load(&self) -> Result<Vec<RawDocument>, IndexError> {
        Ok(self.docs.clone())
    }

    fn chunk(&self, raw: &[RawDocument]) -> Vec<Document> {
        self.chunker.chunk_documents(raw)
    }
}
