//! Error taxonomy shared by every component, per the component's
//! surfaced-to-management-response shape: `(status=false, error=<tag>,
//! name=<component>)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgmonetaError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("insufficient disk space: need {needed} bytes, have {available} bytes")]
    DiskSpace { needed: u64, available: u64 },

    #[error("missing ancestor backup: {0}")]
    MissingAncestor(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("repository busy: {0}")]
    Busy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PgmonetaError {
    /// The taxonomy tag reported in a management response's `error` field.
    pub fn tag(&self) -> &'static str {
        match self {
            PgmonetaError::Protocol(_) => "PROTOCOL_ERROR",
            PgmonetaError::Auth(_) => "BAD_PASSWORD",
            PgmonetaError::Network(_) => "NETWORK_ERROR",
            PgmonetaError::DiskSpace { .. } => "DISK_SPACE_ERROR",
            PgmonetaError::MissingAncestor(_) => "MISSING_ANCESTOR",
            PgmonetaError::Integrity(_) => "INTEGRITY_ERROR",
            PgmonetaError::Busy(_) => "BACKUP_ACTIVE",
            PgmonetaError::Config(_) => "CONFIG_ERROR",
            PgmonetaError::Other(_) => "ERROR",
        }
    }
}

/// Reports whether this error class should drive a local retry of
/// long-lived WAL streaming (spec.md §7 policy: transient network errors
/// only).
pub fn is_retryable_for_wal_streaming(err: &PgmonetaError) -> bool {
    matches!(err, PgmonetaError::Network(_))
}
