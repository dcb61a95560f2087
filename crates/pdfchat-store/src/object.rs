use crate::fetch::{http_fetch_bytes, FetchPolicy};
use async_trait::async_trait;
use pdfchat_error::{PdfChatError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Location of a stored object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredObject {
    pub path: String,
    /// URL the object can be downloaded from.
    pub url: String,
}

/// Blob storage for uploaded files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<StoredObject>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Downloads an object by its URL. URLs minted by this store are served
    /// locally; anything else goes over HTTP.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, path: &str) -> Result<bool>;

    fn url_for(&self, path: &str) -> String;
}

fn check_path(path: &str) -> Result<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\'));
    if bad {
        return Err(PdfChatError::InvalidRequest {
            reason: format!("invalid object path: {:?}", path),
        });
    }
    Ok(())
}

fn public_url(base: &str, path: &str) -> String {
    format!("{}/files/{}", base.trim_end_matches('/'), path)
}

fn path_from_url<'a>(base: &str, url: &'a str) -> Option<&'a str> {
    let prefix = public_url(base, "");
    url.strip_prefix(prefix.as_str())
}

/// In-memory object store.
#[derive(Clone)]
pub struct MemoryObjectStore {
    base_url: String,
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("http://localhost")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<StoredObject> {
        check_path(path)?;
        self.objects
            .write()
            .await
            .insert(path.to_string(), bytes.to_vec());
        Ok(StoredObject {
            path: path.to_string(),
            url: self.url_for(path),
        })
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        check_path(path)?;
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| PdfChatError::NotFound {
                resource: format!("object {}", path),
            })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        match path_from_url(&self.base_url, url) {
            Some(path) => self.get(path).await,
            None => Err(PdfChatError::NotFound {
                resource: url.to_string(),
            }),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        check_path(path)?;
        Ok(self.objects.read().await.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        check_path(path)?;
        Ok(self.objects.write().await.remove(path).is_some())
    }

    fn url_for(&self, path: &str) -> String {
        public_url(&self.base_url, path)
    }
}

/// Object store on the local filesystem, served back by the API under `/files/`.
#[derive(Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    base_url: String,
    client: reqwest::Client,
    fetch_policy: FetchPolicy,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            fetch_policy: FetchPolicy::default(),
        }
    }

    pub fn with_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        check_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<StoredObject> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write-then-rename so readers never see a partial file
        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path, size = bytes.len(), content_type, "object stored");
        Ok(StoredObject {
            path: path.to_string(),
            url: self.url_for(path),
        })
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PdfChatError::NotFound {
                resource: format!("object {}", path),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(path) = path_from_url(&self.base_url, url) {
            return self.get(path).await;
        }
        http_fetch_bytes(&self.client, url, self.fetch_policy).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await?)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn url_for(&self, path: &str) -> String {
        public_url(&self.base_url, path)
    }
}
