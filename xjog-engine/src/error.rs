use crate::types::{ChartReference, TransitionError};
use sea_orm::DbErr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("chart not found: {0}")]
    ChartNotFound(ChartReference),
    #[error("machine not found: {0}")]
    MachineNotFound(String),
    #[error("machine registration is closed once the engine has started")]
    RegistrationClosed,
    #[error("chart mutex timed out: {0}")]
    MutexTimeout(ChartReference),
    #[error("transition failed: {0}")]
    TransitionFailed(#[from] TransitionError),
    #[error("update hook failed: {0}")]
    HookFailure(#[source] anyhow::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(#[from] DbErr),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("delta application failed: {0}")]
    Delta(#[from] json_patch::PatchError),
    #[error("journal notification channel closed")]
    SubscriptionClosed,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Maps unique-constraint violations to [`EngineError::Conflict`] so callers
/// can tell an in-use chart reference from a driver failure.
pub fn map_insert_error(err: DbErr, what: impl Into<String>) -> EngineError {
    match err.sql_err() {
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_)) => EngineError::Conflict(what.into()),
        _ => EngineError::Db(err),
    }
}
