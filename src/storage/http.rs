use super::{content_type_for, KeyMapper, ListPage, ObjectStorage, StorageError, UploadedObject};
use crate::config::Storage as StorageConfig;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// Client for an object gateway speaking a small JSON/REST protocol:
/// `GET|PUT|DELETE|HEAD {endpoint}/v1/buckets/{bucket}/objects[/{key}]`.
#[derive(Clone)]
pub struct HttpObjectStorage {
    http: Client,
    base_url: Url,
    token: String,
    bucket: String,
    keys: KeyMapper,
}

impl fmt::Debug for HttpObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpObjectStorage")
            .field("base_url", &self.base_url)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    key: Option<String>,
    url: Option<String>,
}

impl HttpObjectStorage {
    pub fn from_config(cfg: &StorageConfig) -> Result<Self, StorageError> {
        if !cfg.is_configured() {
            return Err(StorageError::NotConfigured(
                "storage.endpoint is empty".into(),
            ));
        }
        let mut endpoint = cfg.endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base_url = Url::parse(&endpoint)
            .map_err(|e| StorageError::NotConfigured(format!("invalid storage.endpoint: {}", e)))?;
        let http = Client::builder()
            .user_agent("cloud-offload/0.1")
            .timeout(cfg.request_timeout())
            .build()
            .map_err(|e| StorageError::NotConfigured(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            token: cfg.token.clone(),
            bucket: cfg.bucket.clone(),
            keys: KeyMapper::new(&cfg.base_prefix, &cfg.public_url),
        })
    }

    fn objects_url(&self) -> Result<Url, StorageError> {
        self.base_url
            .join(&format!("v1/buckets/{}/objects", self.bucket))
            .map_err(|e| StorageError::NotConfigured(format!("invalid storage url: {}", e)))
    }

    fn object_url(&self, key: &str) -> Result<Url, StorageError> {
        let mut url = self.objects_url()?;
        url.path_segments_mut()
            .map_err(|_| StorageError::NotConfigured("storage endpoint cannot be a base".into()))?
            .extend(key.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    pub fn build_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    pub fn build_list_request(
        &self,
        prefix: &str,
        limit: u32,
        continuation_token: Option<&str>,
    ) -> Result<reqwest::Request, StorageError> {
        let mut url = self.objects_url()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prefix", prefix);
            query.append_pair("limit", &limit.to_string());
            if let Some(token) = continuation_token {
                query.append_pair("continuation_token", token);
            }
        }
        self.build_request(Method::GET, url)
            .build()
            .map_err(|e| StorageError::InvalidResponse(format!("failed to build request: {}", e)))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StorageError> {
        request.send().await.map_err(classify_transport_error)
    }
}

fn classify_transport_error(err: reqwest::Error) -> StorageError {
    // Every transport-level failure (connect, timeout, reset) is worth retrying.
    StorageError::Transient(err.to_string())
}

/// Map a non-success status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> StorageError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StorageError::Transient(format!("{}: {}", status, body))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StorageError::Unauthorized(format!("{}: {}", status, body))
    } else {
        StorageError::Request {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn list_page(
        &self,
        prefix: &str,
        limit: u32,
        continuation_token: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let request = self.build_list_request(prefix, limit, continuation_token)?;
        debug!(url = %request.url(), "listing objects");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(classify_transport_error)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "object listing failed");
            return Err(classify_status(status, body));
        }
        let body = res.text().await.map_err(classify_transport_error)?;
        parse_list_page(&body)
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadedObject, StorageError> {
        let content = fs::read(local_path).await?;
        let size = content.len();
        let url = self.object_url(key)?;
        let res = self
            .send(
                self.build_request(Method::PUT, url)
                    .header("Content-Type", content_type_for(local_path))
                    .body(content),
            )
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body = res.text().await.unwrap_or_default();
        let parsed: Option<UploadResponse> = if body.trim().is_empty() {
            None
        } else {
            serde_json::from_str(&body).ok()
        };
        let stored_key = parsed
            .as_ref()
            .and_then(|p| p.key.clone())
            .unwrap_or_else(|| key.to_string());
        let public_url = parsed
            .and_then(|p| p.url)
            .unwrap_or_else(|| self.keys.public_url(&stored_key));
        info!(key = %stored_key, size, "uploaded object");
        Ok(UploadedObject {
            key: stored_key,
            url: public_url,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let url = self.object_url(key)?;
        let res = self.send(self.build_request(Method::DELETE, url)).await?;
        match res.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = res.text().await.unwrap_or_default();
                Err(classify_status(status, body))
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let url = self.object_url(key)?;
        let res = self.send(self.build_request(Method::HEAD, url)).await?;
        match res.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(classify_status(status, String::new())),
        }
    }
}

pub fn parse_list_page(body: &str) -> Result<ListPage, StorageError> {
    serde_json::from_str(body)
        .map_err(|e| StorageError::InvalidResponse(format!("invalid listing JSON: {}", e)))
}
