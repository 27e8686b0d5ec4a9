//! Core error types.
//!
//! Every public, fallible operation in this crate returns a [`ExportError`].
//! Component-local errors (pool, checkpoint, manifest, package, VMS client)
//! are their own `thiserror` enums and convert into `ExportError` at the
//! orchestrator boundary, so a caller only ever has to match on one type.

use std::path::PathBuf;
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::manifest::ManifestError;
use crate::package::PackageError;
use crate::pool::PoolError;
use crate::vms::VmsError;

/// Result alias used throughout the crate.
pub type ExportResult<T> = Result<T, ExportError>;

/// Top-level error returned by export operations.
#[derive(Error, Debug)]
pub enum ExportError {
    /// A caller-supplied option failed validation before any side effect occurred.
    #[error("invalid input: {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// The VM could not be located in the VMS inventory.
    #[error("VM not found: {path}")]
    VmNotFound { path: String },

    /// Authentication or authorization failed against the VMS.
    #[error("authentication failed: {message}")]
    AuthFailed { message: String },

    /// A step exhausted its retry budget or hit a non-retryable failure.
    /// `label` names the operation (matches the label passed to the retry engine)
    /// so an operator can trace the failing step from logs alone.
    #[error("step '{label}' failed: {source}")]
    Step {
        label: String,
        #[source]
        source: Box<ExportError>,
    },

    /// One or more files in a batch transfer failed; the checkpoint records
    /// per-file status so a resumed run can pick up where this one left off.
    #[error("{failed} of {total} file(s) failed: {details}")]
    PartialTransfer {
        failed: usize,
        total: usize,
        details: String,
    },

    /// The job's cancellation token fired or a deadline elapsed.
    #[error("export cancelled")]
    Cancelled,

    /// A filesystem operation failed.
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The underlying HTTP client returned an error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Vms(#[from] VmsError),
}

impl ExportError {
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap `self` with the retry-engine operation label that was in flight
    /// when it became final (attempts exhausted, or non-retryable).
    pub fn with_label(self, label: impl Into<String>) -> Self {
        Self::Step {
            label: label.into(),
            source: Box::new(self),
        }
    }

    /// Whether the retry engine should give up immediately instead of
    /// consuming further backoff attempts. 404/403-shaped errors and
    /// VM-not-found are marked non-retryable at the call site (not here) by
    /// constructing these variants directly; this just recognizes them.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ExportError::VmNotFound { .. }
                | ExportError::AuthFailed { .. }
                | ExportError::InvalidInput { .. }
                | ExportError::Cancelled
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportError::Cancelled)
    }
}
