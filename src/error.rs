// src/error.rs

use thiserror::Error;

/// Общий тип ошибок ядра синхронизации.
///
/// `RemoteUnavailable` считается временной ошибкой: чтение откатывается на кэш,
/// запись остаётся в очереди. `Conflict` и `NotAllowed` возвращаются вызывающему
/// как «кто-то уже выполнил действие» и автоматически не повторяются.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("location permission denied (can ask again: {can_ask_again})")]
    PermissionDenied { can_ask_again: bool },

    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not allowed: {0}")]
    NotAllowed(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("local cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Временные ошибки можно повторить на следующем тике.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable(_) | SyncError::Cache(_))
    }
}

impl From<tokio_rusqlite::Error> for SyncError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        SyncError::Cache(e.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Cache(e.to_string())
    }
}

impl From<figment::Error> for SyncError {
    fn from(e: figment::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}
