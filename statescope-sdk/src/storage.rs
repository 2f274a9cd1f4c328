//! Durable persistence behind the component index and snapshot store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::Result;

/// Key/value document store.
///
/// Writes are awaited by the caller, so once a `put` returns the document is
/// durable as far as the backend is concerned.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Store a document under `key`, replacing any previous one.
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Load the document stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Delete the document stored under `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Storage that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.documents.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.documents.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.documents.lock().remove(key);
        Ok(())
    }
}

/// Storage writing one pretty-printed JSON file per key into a directory.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a file store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the directory documents are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(&value)?;
        tokio::fs::write(self.path_for(key), json).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Storage whose writes fail while `failing` is set. Reads see the last
/// successful write.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingStorage {
    inner: MemoryStorage,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStorage {
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::Error::Storage(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl Storage for FailingStorage {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.check()?;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.remove(key).await
    }
}
