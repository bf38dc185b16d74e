use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{HttpError, KvError};
use crate::model::ItemId;
use crate::upload::StoredObject;

pub type CoreResult<T> = Result<T, CoreError>;

// ============================================================================
// Validation
// ============================================================================

/// Locally detected input errors. Nothing is sent to the backend when one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("name cannot be empty")]
    EmptyName,

    #[error("name is {len} characters, maximum is {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("name contains invalid character {ch:?}")]
    InvalidNameCharacter { ch: char },

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("breadcrumb index {index} is out of range (depth {depth})")]
    BreadcrumbOutOfRange { index: usize, depth: usize },

    #[error("folder {folder} is not a child of the current folder")]
    NotAChild { folder: ItemId },

    #[error("item {0} is not in the current view")]
    UnknownItem(ItemId),

    #[error("upload job {0} not found")]
    UnknownUploadJob(String),

    #[error("upload job in phase '{phase}' cannot be {action}")]
    InvalidUploadPhase {
        phase: &'static str,
        action: &'static str,
    },

    #[error("selection rejected: {0}")]
    Selection(String),

    #[error("compression settings do not fit the selection: {0}")]
    IncompatibleSettings(String),

    #[error("file is {size} bytes, maximum is {max}")]
    FileTooLarge { size: u64, max: u64 },

    #[error("invalid MIME type: {0}")]
    InvalidMimeType(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

// ============================================================================
// Core error taxonomy
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("transport failure: {message}")]
    Transport { message: String, retryable: bool },

    #[error("remote rejected request: {message}")]
    RemoteRejected { status: Option<u16>, message: String },

    /// The bytes reached the object store but the backend never recorded
    /// them. `object` is everything needed to retry registration.
    #[error("upload stored but registration failed: {message}")]
    PartialUpload {
        object: StoredObject,
        message: String,
    },

    #[error("another change to item {item_id} is still in flight")]
    ConcurrentMutationRejected { item_id: ItemId },

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Transport,
    RemoteRejected,
    PartialUpload,
    ConcurrentMutation,
    Cancelled,
    Storage,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Authentication => "AUTH_REQUIRED",
            Self::Transport => "TRANSPORT_ERROR",
            Self::RemoteRejected => "REMOTE_REJECTED",
            Self::PartialUpload => "PARTIAL_UPLOAD",
            Self::ConcurrentMutation => "CONCURRENT_MUTATION",
            Self::Cancelled => "CANCELLED",
            Self::Storage => "STORAGE_ERROR",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transport | Self::PartialUpload | Self::Storage)
    }
}

impl CoreError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::RemoteRejected {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AuthenticationRequired => ErrorKind::Authentication,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::RemoteRejected { .. } => ErrorKind::RemoteRejected,
            Self::PartialUpload { .. } => ErrorKind::PartialUpload,
            Self::ConcurrentMutationRejected { .. } => ErrorKind::ConcurrentMutation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind().code()
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Storage(e) => e.is_retryable(),
            other => other.kind().is_retryable(),
        }
    }

    #[must_use]
    pub fn notice(&self) -> Notice {
        Notice::from(self)
    }
}

impl From<HttpError> for CoreError {
    fn from(e: HttpError) -> Self {
        let retryable = e.is_retryable();
        match e {
            HttpError::HttpStatus {
                status: 401 | 403, ..
            } => Self::AuthenticationRequired,
            HttpError::HttpStatus {
                status, message, ..
            } => Self::RemoteRejected {
                status: Some(status),
                message,
            },
            HttpError::Cancelled { .. } => Self::Cancelled,
            other => Self::Transport {
                message: other.to_string(),
                retryable,
            },
        }
    }
}

// ============================================================================
// User-facing notices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoticeLevel {
    /// Shown inline; the user has to change their input.
    Blocking,
    /// Route to sign-in.
    SignIn,
    /// The action failed and local state was restored.
    Failure,
    /// Bytes are stored; offer to retry the registration step.
    RetryRegistration,
    /// The action succeeded with a non-fatal follow-up problem.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub code: String,
    pub message: String,
}

impl Notice {
    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&CoreError> for Notice {
    fn from(error: &CoreError) -> Self {
        let (level, message) = match error {
            CoreError::Validation(e) => (NoticeLevel::Blocking, e.to_string()),
            CoreError::ConcurrentMutationRejected { .. } => (
                NoticeLevel::Blocking,
                "This item is still being updated. Please wait a moment.".to_string(),
            ),
            CoreError::AuthenticationRequired => (
                NoticeLevel::SignIn,
                "Your session has expired. Please sign in again.".to_string(),
            ),
            CoreError::Transport { .. } => (
                NoticeLevel::Failure,
                "Unable to connect. Please check your internet connection and try again."
                    .to_string(),
            ),
            CoreError::RemoteRejected { message, .. } => (NoticeLevel::Failure, message.clone()),
            CoreError::Storage(_) => (
                NoticeLevel::Failure,
                "Local storage is unavailable. Please try again.".to_string(),
            ),
            CoreError::Cancelled => (NoticeLevel::Failure, "Cancelled.".to_string()),
            CoreError::PartialUpload { .. } => (
                NoticeLevel::RetryRegistration,
                "The file was uploaded but could not be saved to your library.".to_string(),
            ),
        };
        Self {
            level,
            code: error.code().to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        let auth: CoreError = HttpError::HttpStatus {
            status: 401,
            message: "expired".into(),
            request_id: "r".into(),
            retryable: false,
        }
        .into();
        assert!(matches!(auth, CoreError::AuthenticationRequired));

        let rejected: CoreError = HttpError::HttpStatus {
            status: 409,
            message: "name taken".into(),
            request_id: "r".into(),
            retryable: false,
        }
        .into();
        assert!(matches!(
            rejected,
            CoreError::RemoteRejected {
                status: Some(409),
                ..
            }
        ));
    }

    #[test]
    fn test_transport_mapping_keeps_retryability() {
        let err: CoreError = HttpError::Timeout {
            timeout_ms: 10,
            request_id: "r".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_notice_levels() {
        assert_eq!(
            CoreError::AuthenticationRequired.notice().level,
            NoticeLevel::SignIn
        );
        assert_eq!(
            CoreError::from(ValidationError::EmptyName).notice().level,
            NoticeLevel::Blocking
        );
        assert_eq!(
            CoreError::rejected(Some(500), "boom").notice().message,
            "boom"
        );
        let partial = CoreError::PartialUpload {
            object: StoredObject {
                url: "https://cdn.example.com/a".into(),
                size_bytes: 3,
            },
            message: "down".into(),
        };
        assert_eq!(partial.notice().level, NoticeLevel::RetryRegistration);
        assert_eq!(partial.code(), "PARTIAL_UPLOAD");
    }
}
