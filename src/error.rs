//! Deployment errors and their JSON representation
//!
//! Every failing pipeline step has its own variant so the caller can tell
//! "never got to build" apart from "built but never started". The API/CLI
//! layer maps each variant to an [`ErrorCode`] and an HTTP status.

use hyper::StatusCode;
use serde::Serialize;
use std::path::PathBuf;

/// Why a build step failed
#[derive(Debug, thiserror::Error)]
pub enum BuildFailure {
    /// The build command could not be launched
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// A build step exited unsuccessfully
    #[error("`{step}` exited with code {code:?}{}", format_tail(.tail))]
    ExitStatus {
        step: String,
        code: Option<i32>,
        tail: Vec<String>,
    },
    /// The build exceeded its deadline and was killed
    #[error("build timed out after {0}s")]
    Timeout(u64),
    /// The build succeeded but produced no output directory
    #[error("build output directory missing: {}", .0.display())]
    MissingOutput(PathBuf),
}

fn format_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(":\n{}", tail.join("\n"))
    }
}

/// Errors returned by the deployment pipeline and service layer
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("materialization failed at {}: {source}", path.display())]
    MaterializationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build failed: {0}")]
    BuildFailed(#[from] BuildFailure),

    #[error("no free port in {scanned} candidates starting at {start}")]
    PortExhausted { start: u16, scanned: u32 },

    #[error("failed to start server on port {port}: {reason}")]
    StartFailed { port: u16, reason: String },

    #[error("deployment store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("failed to lock project {project_id}: {source}")]
    Lock {
        project_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl DeployError {
    pub(crate) fn materialization(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeployError::MaterializationFailed {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            DeployError::InvalidProjectId(_) => ErrorCode::InvalidProjectId,
            DeployError::ProjectNotFound(_) => ErrorCode::ProjectNotFound,
            DeployError::MaterializationFailed { .. } => ErrorCode::MaterializationFailed,
            DeployError::BuildFailed(BuildFailure::Timeout(_)) => ErrorCode::BuildTimeout,
            DeployError::BuildFailed(_) => ErrorCode::BuildFailed,
            DeployError::PortExhausted { .. } => ErrorCode::PortExhausted,
            DeployError::StartFailed { .. } => ErrorCode::StartFailed,
            DeployError::Store(_) => ErrorCode::StoreError,
            DeployError::Lock { .. } => ErrorCode::LockFailed,
        }
    }

    /// JSON error body for this error
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}

/// Error codes exposed to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidProjectId,
    ProjectNotFound,
    MaterializationFailed,
    BuildFailed,
    BuildTimeout,
    PortExhausted,
    StartFailed,
    StoreError,
    LockFailed,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidProjectId => StatusCode::BAD_REQUEST,
            ErrorCode::ProjectNotFound => StatusCode::NOT_FOUND,
            ErrorCode::MaterializationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::BuildFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::BuildTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::PortExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::StartFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::LockFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the string representation used in JSON bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidProjectId => "INVALID_PROJECT_ID",
            ErrorCode::ProjectNotFound => "PROJECT_NOT_FOUND",
            ErrorCode::MaterializationFailed => "MATERIALIZATION_FAILED",
            ErrorCode::BuildFailed => "BUILD_FAILED",
            ErrorCode::BuildTimeout => "BUILD_TIMEOUT",
            ErrorCode::PortExhausted => "PORT_EXHAUSTED",
            ErrorCode::StartFailed => "START_FAILED",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::LockFailed => "LOCK_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_by_step() {
        let err = DeployError::materialization(
            "/tmp/x",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.code(), ErrorCode::MaterializationFailed);

        let err = DeployError::from(BuildFailure::Timeout(120));
        assert_eq!(err.code(), ErrorCode::BuildTimeout);
        assert_eq!(err.to_string(), "build failed: build timed out after 120s");

        let err = DeployError::from(BuildFailure::ExitStatus {
            step: "npm run build".to_string(),
            code: Some(1),
            tail: vec!["Type error".to_string()],
        });
        assert_eq!(err.code(), ErrorCode::BuildFailed);
        assert!(err.to_string().contains("Type error"));

        let err = DeployError::StartFailed {
            port: 55551,
            reason: "No such file or directory".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::StartFailed);

        let err = DeployError::Lock {
            project_id: "p1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(err.code(), ErrorCode::LockFailed);
        assert!(err.to_string().starts_with("failed to lock project p1"));
    }

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::InvalidProjectId.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::ProjectNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::PortExhausted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::StartFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_json() {
        let error = DeployError::PortExhausted {
            start: 55550,
            scanned: 5000,
        }
        .to_response();
        let json = error.to_json();

        assert!(json.contains("\"code\":\"PORT_EXHAUSTED\""));
        assert!(json.contains("\"status\":503"));
        assert!(json.contains("starting at 55550"));
    }

    #[test]
    fn test_error_code_strings_match_serde() {
        for code in [
            ErrorCode::InvalidRequest,
            ErrorCode::InvalidProjectId,
            ErrorCode::MaterializationFailed,
            ErrorCode::BuildTimeout,
            ErrorCode::StoreError,
            ErrorCode::LockFailed,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
