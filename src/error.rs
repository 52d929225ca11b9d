use thiserror::Error;

#[derive(Error, Debug)]
pub enum CirrusError {
    // Storage errors
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("storage path error: {0}")]
    StoragePath(#[from] object_store::path::Error),

    #[error("conditional write conflict on {key}")]
    Conflict { key: String },

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Database errors
    #[error("database not found: {database}")]
    DatabaseNotFound { database: String },

    #[error("database already exists: {database}")]
    DatabaseAlreadyExists { database: String },

    #[error("flush already in progress for database {database}")]
    FlushInProgress { database: String },

    // Auth errors
    #[error("invalid or missing secret token for database {database}")]
    Unauthorized { database: String },

    #[error("token already exists: {name}")]
    TokenAlreadyExists { name: String },

    #[error("token not found: {name}")]
    TokenNotFound { name: String },

    // Worker and partition errors
    #[error("lambda {lambda} is busy")]
    WorkerBusy { lambda: String },

    #[error("worker error ({status}): {message}")]
    Worker { status: u16, message: String },

    #[error("all lambdas failed for partition {partition}: {last_error}")]
    AllLambdasFailed { partition: usize, last_error: String },

    #[error("no active lambda found for partition {partition}")]
    NoActiveLambda { partition: usize },

    // Index errors
    #[error("index error: {0}")]
    Index(String),

    // Validation errors
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("validation error: {0}")]
    Validation(String),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rmp_serde::encode::Error> for CirrusError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CirrusError::Serialization(format!("msgpack encode: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for CirrusError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CirrusError::Serialization(format!("msgpack decode: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CirrusError>;

impl CirrusError {
    pub fn status_code(&self) -> u16 {
        match self {
            CirrusError::NotFound { .. }
            | CirrusError::DatabaseNotFound { .. }
            | CirrusError::TokenNotFound { .. } => 404,

            CirrusError::Conflict { .. }
            | CirrusError::DatabaseAlreadyExists { .. }
            | CirrusError::FlushInProgress { .. } => 409,

            CirrusError::DimensionMismatch { .. }
            | CirrusError::Validation(_)
            | CirrusError::TokenAlreadyExists { .. } => 400,

            CirrusError::Unauthorized { .. } => 401,

            CirrusError::WorkerBusy { .. } => 429,

            CirrusError::AllLambdasFailed { .. } | CirrusError::NoActiveLambda { .. } => 503,

            CirrusError::Worker { status, .. } => *status,

            _ => 500,
        }
    }

    /// Whether the partition layer should move on to the next candidate
    /// lambda after this error. Busy instances and server-side failures are
    /// retryable elsewhere; client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CirrusError::WorkerBusy { .. } => true,
            CirrusError::Worker { status, .. } => *status == 429 || *status >= 500,
            CirrusError::Storage(_) | CirrusError::Io(_) => true,
            _ => false,
        }
    }
}
