//! Error types shared across the orchestrator.

use thiserror::Error;

/// Failures of the SQLite-backed ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("ledger connection lock poisoned")]
    Poisoned,

    #[error("invalid stored timestamp: {0}")]
    Timestamp(i64),
}

/// Failures reported by the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch runtime command: {0}")]
    Io(#[from] std::io::Error),

    #[error("runtime exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("runtime returned no instance identifier")]
    MissingId,

    #[error("runtime did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// Failures talking to the authentication service.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures building the template catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate template id: {0}")]
    DuplicateTemplate(String),

    #[error("template {0} has a zero lifetime")]
    ZeroLifetime(String),

    #[error("read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse catalog: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("port pool exhausted after {attempts} draws")]
    PoolExhausted { attempts: u32 },

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] LedgerError),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance {0} belongs to another owner")]
    Forbidden(String),
}

impl ProvisionError {
    /// Whether the failure happened while provisioning rather than while
    /// validating the request.
    pub fn is_provisioning_failure(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::SpawnFailed(_) | Self::Persistence(_)
        )
    }
}

/// The ledger could not mark a reclaimed instance terminated. Runtime stop
/// failures are logged and never surface here.
#[derive(Debug, Error)]
#[error("mark {instance_id} terminated: {source}")]
pub struct ReclaimError {
    pub instance_id: String,
    #[source]
    pub source: LedgerError,
}
