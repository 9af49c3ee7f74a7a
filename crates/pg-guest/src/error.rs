// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for pg-guest.
//!
//! Every error maps onto one [`ErrorKind`], which is what the RPC layer
//! reports to the control plane.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error classification surfaced over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed argument, reserved name, contradictory flags.
    InvalidInput,
    /// Unknown user, database, log, module or revision.
    NotFound,
    /// Object already exists.
    Conflict,
    /// Caller is not allowed to perform the operation.
    Forbidden,
    /// Operation is not valid in the current state.
    PreconditionFailed,
    /// A bounded wait elapsed.
    Timeout,
    /// A collaborator (object store, container daemon, engine) is unreachable.
    Unavailable,
    /// Unrecoverable failure; the service is put into FAILED.
    Fatal,
    /// Operation is intentionally not implemented for this engine.
    NotSupported,
    /// Anything else (I/O, serialization).
    Internal,
}

/// Controller errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Container supervisor failed.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// Object store request failed.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] crate::object_store::ObjectStoreError),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    /// Configuration overrides could not be parsed or applied.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Name is reserved for the controller or the engine.
    #[error("Name is reserved: {0}")]
    ReservedName(String),

    /// User was not found.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Database was not found.
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    /// Guest log was not found.
    #[error("Log not found: {0}")]
    LogNotFound(String),

    /// Override revision was not found.
    #[error("Override revision not found: {0}")]
    RevisionNotFound(String),

    /// Module has never been applied on this guest.
    #[error("Module not applied: {0}")]
    ModuleNotApplied(String),

    /// No driver is registered for the module type.
    #[error("Module type not found: {0}")]
    ModuleTypeNotFound(String),

    /// Object already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Caller may not access the log.
    #[error("Access to log '{0}' is forbidden")]
    LogAccessForbidden(String),

    /// Module may only be managed by an admin.
    #[error("Module '{0}' can only be managed by an admin")]
    ModuleAdminOnly(String),

    /// Too many user overrides outstanding.
    #[error("Too many configuration overrides (limit {limit})")]
    TooManyOverrides {
        /// Configured ceiling.
        limit: usize,
    },

    /// No user override left to remove.
    #[error("No configuration overrides to remove")]
    NoOverridesToRemove,

    /// Operation is not valid in the current state.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A bounded wait elapsed.
    #[error("Timed out waiting for {0}")]
    PollTimeout(String),

    /// Replica did not leave recovery in time.
    #[error("Timed out waiting for promotion")]
    PromoteTimeout,

    /// A collaborator is unreachable.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The engine did not come up.
    #[error("Datastore failed to start: {0}")]
    DatastoreStartFailed(String),

    /// Restore did not complete.
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Encrypted backup without a configured key.
    #[error("Backup is encrypted but no decryption key is configured")]
    DecryptionKeyMissing,

    /// Operation not supported by this engine.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify the error for the RPC layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::InvalidConfiguration(_) | Error::Json(_) => {
                ErrorKind::InvalidInput
            }
            Error::UserNotFound(_)
            | Error::DatabaseNotFound(_)
            | Error::LogNotFound(_)
            | Error::RevisionNotFound(_)
            | Error::ModuleNotApplied(_)
            | Error::ModuleTypeNotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::Conflict,
            Error::ReservedName(_) | Error::LogAccessForbidden(_) | Error::ModuleAdminOnly(_) => {
                ErrorKind::Forbidden
            }
            Error::TooManyOverrides { .. }
            | Error::NoOverridesToRemove
            | Error::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Error::PollTimeout(_) | Error::PromoteTimeout => ErrorKind::Timeout,
            Error::Unavailable(_) | Error::ObjectStore(_) | Error::Database(_) => {
                ErrorKind::Unavailable
            }
            Error::Supervisor(e) if e.is_unavailable() => ErrorKind::Unavailable,
            Error::Supervisor(crate::supervisor::SupervisorError::Timeout(_)) => ErrorKind::Timeout,
            Error::DatastoreStartFailed(_) | Error::RestoreFailed(_) | Error::DecryptionKeyMissing => {
                ErrorKind::Fatal
            }
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::Config(_) | Error::Io(_) | Error::Supervisor(_) | Error::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether this error moves the service into FAILED.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

/// Result type using the controller Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::ReservedName("postgres".into()).kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(Error::NoOverridesToRemove.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(Error::PromoteTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(Error::AlreadyExists("u1".into()).kind(), ErrorKind::Conflict);
        assert!(Error::DecryptionKeyMissing.is_fatal());
        assert!(!Error::UserNotFound("u1".into()).is_fatal());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PreconditionFailed).unwrap();
        assert_eq!(json, "\"precondition_failed\"");
    }
}
