//! Blob Gateway
//!
//! Upload-and-get-link for captured audio. The orchestrator only needs
//! `upload`; `fetch` exists for operators and tests.
//! Implementations target the local filesystem or process memory; an
//! S3-compatible client plugs in behind the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid blob link: {0}")]
    InvalidLink(String),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Blob call timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait BlobGateway: Send + Sync {
    /// Store `content` under `name`, return a link the workers can dereference.
    async fn upload(&self, name: &str, content: &[u8], content_type: &str)
        -> Result<String, BlobError>;

    /// Read back the content behind a link returned by `upload`.
    async fn fetch(&self, link: &str) -> Result<Vec<u8>, BlobError>;
}

// ─── Local filesystem ────────────────────────────────────────────────────────

/// Writes blobs below a base directory and hands out `file://` links.
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn path_from_link(&self, link: &str) -> Result<PathBuf, BlobError> {
        let path = link
            .strip_prefix("file://")
            .map(PathBuf::from)
            .ok_or_else(|| BlobError::InvalidLink(format!("expected file:// prefix: {}", link)))?;
        let escapes = path.components().any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.base_path) {
            return Err(BlobError::InvalidLink(format!(
                "{} is outside {}",
                link,
                self.base_path.display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobGateway for LocalBlobStore {
    async fn upload(
        &self,
        name: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<String, BlobError> {
        if name.is_empty() || name.contains("..") {
            return Err(BlobError::InvalidLink(format!("bad object name: {:?}", name)));
        }
        let path = self.base_path.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "Blob written");
        Ok(format!("file://{}", path.display()))
    }

    async fn fetch(&self, link: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_from_link(link)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(link.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// In-memory blob store with `memory://` links and upload fault injection.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    uploads: RwLock<Vec<String>>,
    fail_uploads: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent upload fail until switched back off.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Object names of successful uploads, in order.
    pub async fn uploads(&self) -> Vec<String> {
        self.uploads.read().await.clone()
    }
}

#[async_trait]
impl BlobGateway for MemoryBlobStore {
    async fn upload(
        &self,
        name: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<String, BlobError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BlobError::Storage("injected upload failure".to_string()));
        }
        let link = format!("memory://{}", name);
        self.blobs.write().await.insert(link.clone(), content.to_vec());
        self.uploads.write().await.push(name.to_string());
        Ok(link)
    }

    async fn fetch(&self, link: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .await
            .get(link)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(link.to_string()))
    }
}
