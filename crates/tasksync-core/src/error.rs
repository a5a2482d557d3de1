
use std::fmt;

use crate::backend::{BackendError, BackendErrorKind};
use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::model::ModelError;
use crate::registry::RegistryError;
use crate::selector::SelectError;
use crate::sync::{SyncCause, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Auth,
    Transport,
    NotFound,
    Conflict,
    Validation,
    NotSupported,
    Internal,
    Cancelled,
    /// The remote is unreachable and offline mode forbids working without it.
    Offline,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Config => 2,
            ErrorKind::Auth => 3,
            ErrorKind::Offline => 4,
            _ => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Auth => "auth",
            ErrorKind::Transport => "transport",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Offline => "offline",
        }
    }
}

impl From<BackendErrorKind> for ErrorKind {
    fn from(kind: BackendErrorKind) -> Self {
        match kind {
            BackendErrorKind::Transport => ErrorKind::Transport,
            BackendErrorKind::Auth => ErrorKind::Auth,
            BackendErrorKind::NotFound => ErrorKind::NotFound,
            BackendErrorKind::Conflict => ErrorKind::Conflict,
            BackendErrorKind::NotSupported => ErrorKind::NotSupported,
            BackendErrorKind::Validation => ErrorKind::Validation,
            BackendErrorKind::Internal => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestion: Option<String>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let suggestion = default_suggestion(kind, &message);
        Self {
            kind,
            message,
            suggestion,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn offline(backend_name: &str, cause: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::Offline,
            format!("backend '{backend_name}' is unreachable and offline_mode is 'online': {cause}"),
        )
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

fn default_suggestion(kind: ErrorKind, message: &str) -> Option<String> {
    let text = match kind {
        ErrorKind::Auth => {
            "Re-enter your credentials with `tasksync credentials set <backend>` or check the TASKSYNC_<BACKEND>_* variables."
        }
        ErrorKind::Offline => {
            "Check your connection, or set sync.offline_mode to 'auto' to work from the cache."
        }
        ErrorKind::Transport => "The remote could not be reached; retry later or enable sync to queue changes offline.",
        ErrorKind::Config => "Check your config file (see `tasksync backends`).",
        ErrorKind::Validation if message.contains("date") => "Dates use the YYYY-MM-DD format and start must not be after due.",
        ErrorKind::Validation if message.contains("status") => "Valid statuses: TODO (T), IN-PROGRESS (P), DONE (D), CANCELLED (C).",
        ErrorKind::NotFound => "Run `tasksync lists` to see available lists.",
        ErrorKind::NotSupported => "This backend does not support the operation.",
        _ => return None,
    };
    Some(text.to_string())
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AppError {}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        AppError::new(err.kind.into(), err.to_string())
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::new(ErrorKind::Config, err.to_string())
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        let kind = match &err {
            CacheError::NotFound(_) => ErrorKind::NotFound,
            CacheError::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        };
        AppError::new(kind, err.to_string())
    }
}

impl From<ModelError> for AppError {
    fn from(err: ModelError) -> Self {
        AppError::new(ErrorKind::Validation, err.to_string())
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        let kind = match &err {
            CredentialError::InvalidUrl { .. } => ErrorKind::Config,
            _ => ErrorKind::Auth,
        };
        AppError::new(kind, err.to_string())
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Config(err) => err.into(),
            RegistryError::NotFound(name) => {
                AppError::new(ErrorKind::Config, format!("Backend '{name}' not found"))
            }
            RegistryError::Credentials { name, source } => {
                let mut mapped = AppError::from(source);
                mapped.message = format!("backend '{name}': {}", mapped.message);
                mapped
            }
            RegistryError::Backend { name, source } => {
                let mut mapped = AppError::from(source);
                mapped.message = format!("backend '{name}': {}", mapped.message);
                mapped
            }
            RegistryError::Cache(err) => err.into(),
        }
    }
}

impl From<SelectError> for AppError {
    fn from(err: SelectError) -> Self {
        AppError::new(ErrorKind::Config, err.to_string())
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let kind = match &err.cause {
            SyncCause::Backend(backend) => backend.kind.into(),
            SyncCause::Cache(CacheError::NotFound(_)) => ErrorKind::NotFound,
            SyncCause::Cache(CacheError::Validation(_)) => ErrorKind::Validation,
            SyncCause::Cache(_) => ErrorKind::Internal,
            SyncCause::Cancelled => ErrorKind::Cancelled,
        };
        AppError::new(kind, err.to_string())
    }
}
