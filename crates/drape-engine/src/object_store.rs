use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use thiserror::Error;

use crate::error::{ErrorKind, TryOnError};
use crate::retry::{is_transient_error, is_transient_message, AttemptTimedOut};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("unsupported source reference: {0}")]
    UnsupportedSource(String),
    #[error("fetching {url} failed ({status})")]
    Fetch { url: String, status: u16 },
    #[error("transport failed: {message}")]
    Transport { message: String, retryable: bool },
    #[error("object store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Timeout(#[from] AttemptTimedOut),
}

impl ObjectStoreError {
    pub fn into_upload_failure(self) -> TryOnError {
        TryOnError::new(ErrorKind::UploadFailed, self.to_string())
    }
}

impl From<ObjectStoreError> for TryOnError {
    fn from(err: ObjectStoreError) -> Self {
        TryOnError::new(ErrorKind::StorageError, err.to_string())
    }
}

pub fn is_retryable_storage_error(err: &ObjectStoreError) -> bool {
    match err {
        ObjectStoreError::Fetch { status, .. } => *status == 429 || *status >= 500,
        ObjectStoreError::Transport { retryable, message } => {
            *retryable || is_transient_message(message)
        }
        ObjectStoreError::Timeout(_) => true,
        ObjectStoreError::Io(err) => matches!(
            err.kind(),
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
        ),
        ObjectStoreError::InvalidPath(_) | ObjectStoreError::UnsupportedSource(_) => false,
    }
}

/// Blob storage collaborator. Paths are relative, `/`-separated keys inside
/// the configured bucket; every write returns a retrievable URL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_bytes(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<String, ObjectStoreError>;

    /// Fetches `source_url` and stores the body under `path`.
    async fn put_from_url(&self, source_url: &str, path: &str) -> Result<String, ObjectStoreError>;

    async fn exists(&self, path: &str) -> Result<bool, ObjectStoreError>;

    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError>;
}

/// Object store on the local filesystem under `root/bucket`.
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
    public_base_url: Option<String>,
    http: HttpClient,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
            public_base_url: None,
            http: HttpClient::new(),
        }
    }

    /// Serve URLs as `{base}/{bucket}/{path}` instead of `file://` paths.
    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        let trimmed = base.trim().trim_end_matches('/');
        self.public_base_url = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let clean = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if path.trim().is_empty() || !clean {
            return Err(ObjectStoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(&self.bucket).join(relative))
    }

    fn url_for(&self, path: &str, full_path: &Path) -> Result<String, ObjectStoreError> {
        if let Some(base) = &self.public_base_url {
            return Ok(format!(
                "{}/{}/{}",
                base,
                self.bucket,
                path.trim_start_matches('/')
            ));
        }
        let absolute = std::path::absolute(full_path)?;
        Ok(format!("file://{}", absolute.display()))
    }

    async fn fetch(&self, source_url: &str) -> Result<Vec<u8>, ObjectStoreError> {
        if let Some(local) = source_url.strip_prefix("file://") {
            return Ok(tokio::fs::read(local).await?);
        }
        if !(source_url.starts_with("https://") || source_url.starts_with("http://")) {
            return Err(ObjectStoreError::UnsupportedSource(source_url.to_string()));
        }
        let response = self
            .http
            .get(source_url)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(ObjectStoreError::Fetch {
                url: source_url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().await.map_err(transport_error)?.to_vec())
    }
}

fn transport_error(err: reqwest::Error) -> ObjectStoreError {
    ObjectStoreError::Transport {
        retryable: err.is_timeout()
            || err.is_connect()
            || err.is_request()
            || is_transient_error(&err),
        message: err.to_string(),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_bytes(
        &self,
        bytes: Vec<u8>,
        path: &str,
        _content_type: &str,
    ) -> Result<String, ObjectStoreError> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, bytes).await?;
        self.url_for(path, &full_path)
    }

    async fn put_from_url(&self, source_url: &str, path: &str) -> Result<String, ObjectStoreError> {
        // validate the destination before paying for the download
        self.resolve(path)?;
        let bytes = self.fetch(source_url.trim()).await?;
        self.put_bytes(bytes, path, "application/octet-stream").await
    }

    async fn exists(&self, path: &str) -> Result<bool, ObjectStoreError> {
        let full_path = self.resolve(path)?;
        Ok(tokio::fs::try_exists(full_path).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError> {
        let full_path = self.resolve(path)?;
        match tokio::fs::remove_file(full_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
