//! Two-phase uploads: bytes go to the object store first, then the backend
//! is told about the stored object.
//!
//! A failure in the second phase leaves an object nobody references. The
//! error carries everything needed to retry the registration without
//! re-sending the bytes.

pub mod coordinator;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::auth::TokenProvider;
use crate::capabilities::{HostPolicy, ValidatedUrl};
use crate::config::ClientConfig;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::model::{FileItem, FolderId};
use crate::remote::{MetadataApi, RegisterObject};

pub use self::coordinator::{
    PendingRegistration, UploadCoordinator, UploadJob, UploadJobId, UploadPhase, UploadStage,
};

pub const FALLBACK_FILE_NAME: &str = "upload";
pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// A file the user picked, as described by the platform picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHandle {
    pub uri: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
}

impl LocalHandle {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
            mime_type: None,
            size_bytes: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn file_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(FALLBACK_FILE_NAME)
    }

    pub fn content_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(FALLBACK_MIME_TYPE)
    }
}

/// A picked file together with its bytes, read by the shell.
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub handle: LocalHandle,
    pub content: Bytes,
}

impl UploadSource {
    pub fn new(handle: LocalHandle, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        let handle = LocalHandle {
            size_bytes: Some(content.len() as u64),
            ..handle
        };
        Self { handle, content }
    }
}

/// Result of phase A.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub url: String,
    pub size_bytes: u64,
}

/// Receives whole percentages, 0 to 100.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Must return `CoreError::Cancelled` promptly once `cancel` fires.
    async fn put_object(
        &self,
        source: &UploadSource,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> CoreResult<StoredObject>;
}

pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from((done as u128 * 100) / total as u128).unwrap_or(100)
}

// ============================================================================
// HTTP multipart object store
// ============================================================================

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    secure_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    bytes: Option<u64>,
}

/// `{"error": {"message": "..."}}` or `{"error": "..."}`.
fn upload_error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}

/// Unsigned multipart upload to an object-storage endpoint. The file goes
/// out in `upload_chunk_size` pieces and progress is reported per piece.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: ValidatedUrl,
    preset: String,
    host_policy: HostPolicy,
    chunk_size: usize,
    max_bytes: u64,
    timeout: Duration,
}

impl HttpObjectStore {
    pub fn new(config: &ClientConfig) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CoreError::Transport {
                message: format!("failed to build upload client: {e}"),
                retryable: false,
            })?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: &ClientConfig, client: reqwest::Client) -> CoreResult<Self> {
        Ok(Self {
            client,
            endpoint: config.upload_url()?,
            preset: config.upload_preset.clone(),
            host_policy: config.host_policy(),
            chunk_size: config.upload_chunk_size.max(1),
            max_bytes: config.max_upload_bytes,
            timeout: Duration::from_millis(config.upload_timeout_ms),
        })
    }

    fn form(&self, source: &UploadSource, on_progress: ProgressFn) -> CoreResult<reqwest::multipart::Form> {
        let content = source.content.clone();
        let total = content.len();
        let chunk_size = self.chunk_size;
        let mut sent = 0usize;

        let chunks = (0..total)
            .step_by(chunk_size)
            .map(move |start| content.slice(start..(start + chunk_size).min(total)));
        let stream = futures::stream::iter(chunks).map(move |chunk| {
            sent += chunk.len();
            // 100 is reported once the store has answered.
            on_progress(percent(sent, total).min(99));
            Ok::<Bytes, std::io::Error>(chunk)
        });

        let content_type = source.handle.content_type();
        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(stream),
            total as u64,
        )
        .file_name(source.handle.file_name().to_string())
        .mime_str(content_type)
        .map_err(|_| ValidationError::InvalidMimeType(content_type.to_string()))?;

        Ok(reqwest::multipart::Form::new()
            .text("upload_preset", self.preset.clone())
            .part("file", part))
    }

    async fn send(&self, form: reqwest::multipart::Form, total: usize) -> CoreResult<StoredObject> {
        let response = self
            .client
            .post(self.endpoint.as_str())
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::transport(format!("upload timed out after {:?}", self.timeout))
                } else {
                    CoreError::transport(format!("upload failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| CoreError::transport(format!("failed to read upload response: {e}")))?;

        if !status.is_success() {
            let message = upload_error_message(&body)
                .unwrap_or_else(|| format!("Upload failed with status {}", status.as_u16()));
            return Err(CoreError::rejected(Some(status.as_u16()), message));
        }

        let parsed: UploadResponse =
            serde_json::from_slice(&body).map_err(|e| CoreError::Transport {
                message: format!("malformed upload response: {e}"),
                retryable: false,
            })?;
        let url = parsed
            .secure_url
            .or(parsed.url)
            .ok_or_else(|| CoreError::Transport {
                message: "upload response has no URL".to_string(),
                retryable: false,
            })?;
        let url = ValidatedUrl::with_policy(url, self.host_policy)?;

        Ok(StoredObject {
            url: url.as_str().to_string(),
            size_bytes: parsed.bytes.unwrap_or(total as u64),
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for HttpObjectStore {
    #[instrument(skip_all, fields(name = source.handle.file_name(), size = source.content.len()))]
    async fn put_object(
        &self,
        source: &UploadSource,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> CoreResult<StoredObject> {
        let total = source.content.len();
        if total as u64 > self.max_bytes {
            return Err(ValidationError::FileTooLarge {
                size: total as u64,
                max: self.max_bytes,
            }
            .into());
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let form = self.form(source, Arc::clone(&on_progress))?;
        let stored = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("upload cancelled");
                return Err(CoreError::Cancelled);
            }
            result = self.send(form, total) => result?,
        };

        on_progress(100);
        info!(url = %stored.url, bytes = stored.size_bytes, "object stored");
        Ok(stored)
    }
}

// ============================================================================
// Two-phase client
// ============================================================================

/// What phase B sends for a given pick and stored object.
pub fn registration_for(
    handle: &LocalHandle,
    stored: &StoredObject,
    folder: Option<&FolderId>,
) -> RegisterObject {
    RegisterObject {
        name: handle.file_name().to_string(),
        url: stored.url.clone(),
        parent_id: folder.cloned(),
        mime_type: handle.content_type().to_string(),
        size_bytes: stored.size_bytes,
    }
}

pub struct ObjectUploadClient {
    objects: Arc<dyn ObjectStore>,
    api: Arc<dyn MetadataApi>,
    tokens: Arc<dyn TokenProvider>,
}

impl ObjectUploadClient {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        api: Arc<dyn MetadataApi>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            objects,
            api,
            tokens,
        }
    }

    /// Phase A. A failure here leaves nothing behind remotely. Signed-out
    /// sessions fail before any bytes are sent.
    pub async fn store(
        &self,
        source: &UploadSource,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> CoreResult<StoredObject> {
        if self.tokens.auth_token().await?.is_none() {
            warn!(name = source.handle.file_name(), "upload refused while signed out");
            return Err(CoreError::AuthenticationRequired);
        }
        self.objects.put_object(source, on_progress, cancel).await
    }

    /// Phase B. Failures come back as `PartialUpload`, except a lost session
    /// which stays `AuthenticationRequired` so the shell prompts for sign-in.
    #[instrument(skip_all, fields(name = %request.name))]
    pub async fn register(&self, request: &RegisterObject) -> CoreResult<FileItem> {
        self.api.register(request).await.map_err(|e| {
            warn!(error = %e, url = %request.url, "registration failed, object is unreferenced");
            match e {
                partial @ CoreError::PartialUpload { .. } => partial,
                CoreError::AuthenticationRequired => CoreError::AuthenticationRequired,
                other => CoreError::PartialUpload {
                    object: StoredObject {
                        url: request.url.clone(),
                        size_bytes: request.size_bytes,
                    },
                    message: other.to_string(),
                },
            }
        })
    }

    pub async fn upload(
        &self,
        source: &UploadSource,
        folder: Option<&FolderId>,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> CoreResult<FileItem> {
        let stored = self.store(source, on_progress, cancel).await?;
        self.register(&registration_for(&source.handle, &stored, folder))
            .await
    }
}
