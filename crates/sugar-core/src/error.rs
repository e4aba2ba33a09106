//! Stack error handling
//!
//! Provides typed errors for every stage of the stack: store opening and
//! migration recovery, context preconditions, commits and database removal.
//! Every error that leaves the stack is first handed to the configured
//! [`ErrorHandler`].

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use crate::object::ObjectId;

/// Classification of a store open failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOpenErrorKind {
    /// The store was written by a different model and migration was not requested
    IncompatibleVersionHash,
    /// Migration was requested but no known model version matches the store
    MissingSourceModel,
    /// The store location could not be prepared
    Io,
    /// SQLite refused to open or read the store
    Database,
}

/// Errors raised while attaching the on-disk store
#[derive(Error, Debug)]
pub enum StoreOpenError {
    #[error("Store at '{path}' was created for model {stored}, the current model is {current}")]
    IncompatibleVersionHash {
        path: PathBuf,
        stored: String,
        current: String,
    },

    #[error("Store at '{path}' needs migration from model {stored}, but no source model with that version is known")]
    MissingSourceModel { path: PathBuf, stored: String },

    #[error("Failed to prepare store location '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open store at '{path}': {source}")]
    Database {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

impl StoreOpenError {
    pub fn kind(&self) -> StoreOpenErrorKind {
        match self {
            StoreOpenError::IncompatibleVersionHash { .. } => {
                StoreOpenErrorKind::IncompatibleVersionHash
            }
            StoreOpenError::MissingSourceModel { .. } => StoreOpenErrorKind::MissingSourceModel,
            StoreOpenError::Io { .. } => StoreOpenErrorKind::Io,
            StoreOpenError::Database { .. } => StoreOpenErrorKind::Database,
        }
    }

    /// Whether this failure is a schema incompatibility
    ///
    /// Only these failures are resolved by destructively recreating the store;
    /// everything else is fatal.
    pub fn is_migration_failure(&self) -> bool {
        matches!(
            self.kind(),
            StoreOpenErrorKind::IncompatibleVersionHash | StoreOpenErrorKind::MissingSourceModel
        )
    }

    pub fn path(&self) -> &Path {
        match self {
            StoreOpenError::IncompatibleVersionHash { path, .. }
            | StoreOpenError::MissingSourceModel { path, .. }
            | StoreOpenError::Io { path, .. }
            | StoreOpenError::Database { path, .. } => path,
        }
    }
}

/// Errors surfaced by the persistence stack
#[derive(Error, Debug)]
pub enum StackError {
    /// A required collaborator is missing (store, root context, path)
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    StoreOpen(#[from] StoreOpenError),

    /// A commit failed to flush; the pending changes are kept
    #[error("Failed to commit changes in '{context}': {source}")]
    Write {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to read from the store in '{context}': {source}")]
    Read {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Cloud container is not reachable; callers fall back to the local store
    #[error("Cloud container '{identity}' is unavailable")]
    CloudUnavailable { identity: String },

    #[error("Failed to delete database{}: {reason}", path.as_ref().map(|p| format!(" '{}'", p.display())).unwrap_or_default())]
    Deletion {
        path: Option<PathBuf>,
        reason: String,
    },

    #[error("Context '{context}' was used outside of its execution lane")]
    Confinement { context: String },

    #[error("Entity '{0}' is not part of the model")]
    UnknownEntity(String),

    #[error("Attribute '{attribute}' is not defined on entity '{entity}'")]
    UnknownAttribute { entity: String, attribute: String },

    #[error("Object {0} is not known to this context")]
    UnknownObject(ObjectId),

    #[error("Execution lane '{0}' is no longer running")]
    LaneClosed(String),
}

impl StackError {
    /// Check if the caller can reasonably retry or continue
    pub fn is_recoverable(&self) -> bool {
        match self {
            StackError::StoreOpen(e) => e.is_migration_failure(),
            StackError::Write { .. } | StackError::CloudUnavailable { .. } => true,
            _ => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StackError::Write { .. } => {
                Some("The pending changes were kept. Fix the underlying problem and commit again.")
            }
            StackError::StoreOpen(e) if e.is_migration_failure() => {
                Some("The store is recreated empty when its schema does not match the model.")
            }
            StackError::StoreOpen(StoreOpenError::Io { .. }) => {
                Some("Check that the store directory exists and you have write permissions.")
            }
            StackError::Configuration(_) => {
                Some("Call initialize() and wait for it to complete before requesting contexts.")
            }
            StackError::Confinement { .. } => {
                Some("Create a worker context on the thread that is going to use it.")
            }
            _ => None,
        }
    }
}

/// Result type for stack operations
pub type StackResult<T> = Result<T, StackError>;

/// Central sink for errors surfaced by the stack
///
/// The stack reports and then returns the error; it never aborts the host.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: &StackError);
}

/// Default handler: logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle(&self, err: &StackError) {
        error!(error = %err, recoverable = err.is_recoverable(), "Stack operation failed");
        if let Some(suggestion) = err.recovery_suggestion() {
            info!("{}", suggestion);
        }
    }
}
