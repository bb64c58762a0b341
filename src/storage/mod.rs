//! Object storage collaborator: the trait the sweeps consume, plus the key
//! mapping, listing and HTTP client built on it.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub mod http;
pub mod keys;
pub mod listing;

pub use http::HttpObjectStorage;
pub use keys::KeyMapper;
pub use listing::RemoteListing;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Network failure, timeout, 429 or 5xx. Retrying may succeed.
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage not configured: {0}")]
    NotConfigured(String),
    #[error("storage rejected credentials: {0}")]
    Unauthorized(String),
    #[error("storage request failed with {status}: {body}")]
    Request { status: u16, body: String },
    #[error("invalid storage response: {0}")]
    InvalidResponse(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: i64,
}

/// One page of a listing. `next_token` is opaque and only meaningful to the
/// provider that issued it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default)]
    pub is_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedObject {
    pub key: String,
    pub url: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn list_page(
        &self,
        prefix: &str,
        limit: u32,
        continuation_token: Option<&str>,
    ) -> Result<ListPage, StorageError>;

    async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadedObject, StorageError>;

    /// Returns `false` when the object did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Content type guessed from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "avif" => "image/avif",
        Some(ext) if ext == "svg" => "image/svg+xml",
        Some(ext) if ext == "pdf" => "application/pdf",
        Some(ext) if ext == "mp4" => "video/mp4",
        Some(ext) if ext == "mov" => "video/quicktime",
        Some(ext) if ext == "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
