//! Per-thread conversation checkpoints.
//!
//! A checkpoint is the ordered message history of one thread. Stores are
//! append-only: the core never truncates or deletes a thread.

use crate::config::{CheckpointBackend, CheckpointConfig};
use crate::error::CheckpointError;
use crate::types::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append messages to a thread, creating it on first use.
    async fn append_all(&self, thread_id: &str, messages: Vec<Message>)
    -> Result<(), CheckpointError>;

    /// Full history of a thread; empty when the thread does not exist.
    async fn load(&self, thread_id: &str) -> Result<Vec<Message>, CheckpointError>;

    async fn append(&self, thread_id: &str, message: Message) -> Result<(), CheckpointError> {
        self.append_all(thread_id, vec![message]).await
    }
}

/// Process-local store. History is lost on exit.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append_all(
        &self,
        thread_id: &str,
        messages: Vec<Message>,
    ) -> Result<(), CheckpointError> {
        self.threads
            .write()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .extend(messages);
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Vec<Message>, CheckpointError> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ThreadFile {
    thread_id: String,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

/// One JSON file per thread under a directory.
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

/// Map a thread id onto a safe file stem. Bytes outside `[A-Za-z0-9_-]` are
/// percent-encoded so distinct ids never collide.
fn file_stem(thread_id: &str) -> String {
    let mut out = String::with_capacity(thread_id.len());
    for b in thread_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}

fn read_thread(path: &Path, thread_id: &str) -> Result<Vec<Message>, CheckpointError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path).map_err(|e| CheckpointError::Load {
        thread_id: thread_id.to_string(),
        message: e.to_string(),
    })?;
    let file: ThreadFile = serde_json::from_str(&data).map_err(|e| CheckpointError::Load {
        thread_id: thread_id.to_string(),
        message: e.to_string(),
    })?;
    Ok(file.messages)
}

fn write_thread(path: &Path, file: &ThreadFile) -> Result<(), CheckpointError> {
    let persist = |e: std::io::Error| CheckpointError::Persistence {
        message: format!("Failed to write {}: {}", path.display(), e),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(persist)?;
    }
    let json = serde_json::to_string_pretty(file).map_err(|e| CheckpointError::Persistence {
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(persist)?;
    std::fs::rename(&tmp, path).map_err(persist)?;
    Ok(())
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(thread_id)))
    }

    async fn blocking<T, F>(f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CheckpointError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| CheckpointError::Persistence {
                message: format!("Checkpoint task failed: {}", e),
            })?
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn append_all(
        &self,
        thread_id: &str,
        messages: Vec<Message>,
    ) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let path = self.thread_path(thread_id);
        let thread_id = thread_id.to_string();
        let appended = messages.len();
        Self::blocking(move || {
            let mut history = read_thread(&path, &thread_id)?;
            history.extend(messages);
            let file = ThreadFile {
                thread_id,
                updated_at: Utc::now(),
                messages: history,
            };
            write_thread(&path, &file)
        })
        .await?;
        tracing::debug!(messages = appended, "Checkpoint updated");
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Vec<Message>, CheckpointError> {
        let path = self.thread_path(thread_id);
        let thread_id = thread_id.to_string();
        Self::blocking(move || read_thread(&path, &thread_id)).await
    }
}

/// Build the configured store. Relative paths must already be resolved.
pub fn create_checkpoint_store(config: &CheckpointConfig) -> Arc<dyn CheckpointStore> {
    match config.backend {
        CheckpointBackend::Memory => Arc::new(InMemoryCheckpointStore::new()),
        CheckpointBackend::File => Arc::new(JsonFileCheckpointStore::new(&config.path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_append_and_load() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load("t1").await.unwrap().is_empty());
        store.append("t1", Message::user("hello")).await.unwrap();
        store
            .append_all("t1", vec![Message::assistant("hi")])
            .await
            .unwrap();
        let history = store.load("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "hi");
        assert!(store.load("t2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonFileCheckpointStore::new(dir.path());
            store
                .append_all(
                    "default_user",
                    vec![Message::user("What is Rust?"), Message::assistant("A language.")],
                )
                .await
                .unwrap();
        }
        let store = JsonFileCheckpointStore::new(dir.path());
        let history = store.load("default_user").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "A language.");
        assert!(dir.path().join("default_user.json").exists());
        assert!(!dir.path().join("default_user.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_isolates_threads() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileCheckpointStore::new(dir.path());
        store.append("a/b", Message::user("one")).await.unwrap();
        store.append("a_b", Message::user("two")).await.unwrap();
        assert_eq!(store.load("a/b").await.unwrap()[0].content, "one");
        assert_eq!(store.load("a_b").await.unwrap()[0].content, "two");
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_load_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = JsonFileCheckpointStore::new(dir.path());
        let err = store.load("bad").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Load { .. }));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("user-1_x"), "user-1_x");
        assert_eq!(file_stem("../etc"), "%2E%2E%2Fetc");
        assert_eq!(file_stem(""), "%");
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_serialized() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileCheckpointStore::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append("shared", Message::user(format!("m{}", i)))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.load("shared").await.unwrap().len(), 8);
    }
}
