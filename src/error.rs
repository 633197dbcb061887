//! Error types shared by the managers, the runtimes and the HTTP surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Creation targeted a name that already resolves to an entity
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A lookup or action target resolved to nothing
    #[error("{0} not found")]
    NotFound(String),

    /// A multi-step creation failed after mutating the runtime.
    /// `rollback` is set when the compensating delete failed as well.
    #[error("creating {entity} failed with: {cause}{}", rollback_suffix(.rollback))]
    PartialCreate {
        entity: String,
        cause: Box<AppError>,
        rollback: Option<Box<AppError>>,
    },

    /// Bad input rejected before any runtime call
    #[error("validation failed: {0}")]
    Validation(String),

    /// Batch operation that kept going past individual failures
    #[error("{context} failed with: {}", .errors.join("; "))]
    Aggregate { context: String, errors: Vec<String> },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("kubeconfig error: {0}")]
    KubeConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn rollback_suffix(rollback: &Option<Box<AppError>>) -> String {
    match rollback {
        Some(err) => format!(", also FAILED to rollback changes: {}", err),
        None => String::new(),
    }
}

impl AppError {
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::KubeConfig(msg.into())
    }

    /// Build a partial-create error from the original failure and the
    /// outcome of the compensating delete.
    pub fn partial_create(
        entity: impl Into<String>,
        cause: AppError,
        rollback: Option<AppError>,
    ) -> Self {
        Self::PartialCreate {
            entity: entity.into(),
            cause: Box::new(cause),
            rollback: rollback.map(Box::new),
        }
    }

    /// Collapse a list of per-item errors. Returns `None` when the list is empty.
    pub fn aggregate(context: impl Into<String>, errors: Vec<String>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        Some(Self::Aggregate {
            context: context.into(),
            errors,
        })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PartialCreate { .. } => "PARTIAL_CREATE_FAILURE",
            Self::Validation(_) => "VALIDATION_REJECTED",
            Self::Aggregate { .. } => "AGGREGATE_FAILURE",
            Self::Runtime(_) => "RUNTIME_ERROR",
            Self::KubeConfig(_) => "KUBECONFIG_ERROR",
            Self::Io(_) | Self::Yaml(_) | Self::Json(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
