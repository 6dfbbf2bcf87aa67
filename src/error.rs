use std::fmt;
use std::time::Duration;

use crate::feed::InvalidTransition;
use crate::models::PostId;
use crate::remote::RemoteError;

/// Failure of a single gateway call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Steps of a post delete, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteStage {
    Hearts,
    Comments,
    Post,
}

impl DeleteStage {
    pub const ORDER: [DeleteStage; 3] = [Self::Hearts, Self::Comments, Self::Post];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hearts => "hearts",
            Self::Comments => "comments",
            Self::Post => "post",
        }
    }
}

impl fmt::Display for DeleteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStage {
    Upload,
    UrlResolution,
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::UrlResolution => "urlResolution",
        }
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication failed: {reason}")]
    Auth {
        reason: String,
        status_code: Option<u16>,
    },

    #[error("Not signed in")]
    Unauthenticated,

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Could not create post: {cause}")]
    Create {
        #[source]
        cause: CallError,
    },

    /// Stages listed in `completed` stay applied on the remote.
    #[error("Delete failed at {stage} stage: {cause}")]
    Delete {
        stage: DeleteStage,
        completed: Vec<DeleteStage>,
        #[source]
        cause: CallError,
    },

    #[error("Upload failed at {stage} stage: {cause}")]
    Upload {
        stage: UploadStage,
        #[source]
        cause: CallError,
    },

    #[error("Profile update failed: {cause}")]
    Update {
        #[source]
        cause: CallError,
    },

    #[error("A heart toggle for post {post_id} is already in flight")]
    ConcurrentToggle { post_id: PostId },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid state transition: {0}")]
    Transition(#[from] InvalidTransition),
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Remote(e) => AppError::Remote(e),
            CallError::Timeout { operation, after } => AppError::Timeout { operation, after },
        }
    }
}

impl AppError {
    /// True for plain timeouts and for staged failures caused by one.
    pub fn is_timeout(&self) -> bool {
        match self {
            AppError::Timeout { .. } => true,
            AppError::Create { cause }
            | AppError::Delete { cause, .. }
            | AppError::Upload { cause, .. }
            | AppError::Update { cause } => matches!(cause, CallError::Timeout { .. }),
            _ => false,
        }
    }

    /// Name of the step that failed, for multi-step operations.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            AppError::Delete { stage, .. } => Some(stage.as_str()),
            AppError::Upload { stage, .. } => Some(stage.as_str()),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::Auth { status_code, .. } => *status_code,
            AppError::Remote(e) => e.status_code,
            AppError::Create { cause }
            | AppError::Delete { cause, .. }
            | AppError::Upload { cause, .. }
            | AppError::Update { cause } => match cause {
                CallError::Remote(e) => e.status_code,
                CallError::Timeout { .. } => None,
            },
            _ => None,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(message: &str, status: u16) -> CallError {
        CallError::Remote(RemoteError::new(message, Some(status)))
    }

    fn timeout() -> CallError {
        CallError::Timeout {
            operation: "comments.delete",
            after: Duration::from_secs(10),
        }
    }

    #[test]
    fn delete_error_reports_stage() {
        let err = AppError::Delete {
            stage: DeleteStage::Comments,
            completed: vec![DeleteStage::Hearts],
            cause: remote("boom", 500),
        };
        assert_eq!(err.stage(), Some("comments"));
        assert_eq!(err.status_code(), Some(500));
        assert_eq!(err.to_string(), "Delete failed at comments stage: boom");
    }

    #[test]
    fn upload_stage_names() {
        let err = AppError::Upload {
            stage: UploadStage::UrlResolution,
            cause: remote("no url", 404),
        };
        assert_eq!(err.stage(), Some("urlResolution"));
    }

    #[test]
    fn timeouts_detected_inside_staged_errors() {
        let staged = AppError::Delete {
            stage: DeleteStage::Post,
            completed: vec![DeleteStage::Hearts, DeleteStage::Comments],
            cause: timeout(),
        };
        assert!(staged.is_timeout());
        assert!(AppError::from(timeout()).is_timeout());
        assert!(!AppError::Unauthenticated.is_timeout());
    }

    #[test]
    fn call_error_converts_to_remote() {
        let err = AppError::from(remote("nope", 403));
        assert!(matches!(err, AppError::Remote(_)));
        assert_eq!(err.status_code(), Some(403));
    }

    #[test]
    fn delete_stage_order() {
        assert_eq!(
            DeleteStage::ORDER,
            [DeleteStage::Hearts, DeleteStage::Comments, DeleteStage::Post]
        );
    }
}
