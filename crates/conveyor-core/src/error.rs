//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("scan failed for {resource}: {message}")]
    ScanFailed { resource: String, message: String },

    #[error("plan creation failed: {0}")]
    PlanCreation(String),

    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
