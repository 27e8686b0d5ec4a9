//! Hypervisor-to-KVM VM export core.
//!
//! This crate provides the reusable engine behind a VM export pipeline:
//! resolving a VM on a hypervisor-style management API, leasing its disks
//! for export, pulling them over resumable HTTP range requests, packaging
//! the result into an OVA, and writing a checksummed artifact manifest.
//!
//! # Modules
//!
//! - [`config`] — export options, VMS endpoint configuration.
//! - [`error`] — the crate-wide error type and retry/cancellation classification.
//! - [`network`] — connectivity state tracking used to gate retries.
//! - [`retry`] — exponential backoff with jitter, network-state-aware.
//! - [`pool`] — a bounded generic connection pool with idle eviction.
//! - [`vms`] — the VMS provider abstraction and its HTTP implementation.
//! - [`download`] — resumable HTTP range downloads.
//! - [`throttle`] — token-bucket bandwidth limiting.
//! - [`progress`] — progress reporting shared by the downloader and transfer coordinator.
//! - [`transfer`] — bounded-concurrency fan-out across a lease's files.
//! - [`checkpoint`] — atomic on-disk persistence of transfer progress.
//! - [`manifest`] — the artifact manifest and its SHA-256 checksums.
//! - [`package`] — OVA archive assembly and validation.
//! - [`pipeline`] — the post-export conversion pipeline hook.
//! - [`orchestrator`] — drives a single export job end to end.
//! - [`sanitize`] — filesystem-safe VM name sanitization.

#![allow(dead_code)]
#![allow(clippy::uninlined_format_args)]

pub mod checkpoint;
pub mod config;
pub mod download;
pub mod error;
pub mod manifest;
pub mod network;
pub mod orchestrator;
pub mod package;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod sanitize;
pub mod throttle;
pub mod transfer;
pub mod vms;

// Re-export config types.
pub use config::{ExportFormat, ExportOptions, ProgressCallback, VmsConfig};

// Re-export error types.
pub use error::{ExportError, ExportResult};

// Re-export network types.
pub use network::{
    InterfaceStats, NetworkGate, NetworkState, NetworkSupervisor, NetworkSupervisorConfig,
};

// Re-export retry types.
pub use retry::{RetryConfig, RetryEngine};

// Re-export pool types.
pub use pool::{ConnectionPool, PoolError, PoolStats, PooledSession};

// Re-export VMS provider types.
pub use vms::{
    ExportLease, FileItem, HttpVmsClient, ListOutcome, VmMetadata, VmSummary, VmsClient, VmsError,
};

// Re-export downloader and throttling types.
pub use download::download_file;
pub use throttle::TokenBucket;

// Re-export progress types.
pub use progress::{FileProgress, OverallProgress, ProgressReader};

// Re-export transfer coordinator types.
pub use transfer::{download_all, TransferItem, TransferOptions, TransferOutcome};

// Re-export checkpoint types.
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};

// Re-export manifest types.
pub use manifest::{
    compute_file_sha256, prefixed_sha256, DiskEntry, DiskKind, ExportMethod, Firmware, Manifest,
    ManifestError, ManifestMetadata, ManifestOutput, ManifestPipeline, ManifestSource, ManifestVm,
    OsHint,
};

// Re-export packaging types.
pub use package::{build_ova, validate_ova, PackageError};

// Re-export pipeline types.
pub use pipeline::{NullPipeline, PipelineError, PipelineInvoker, PipelineOptions, PipelineOutcome};

// Re-export the orchestrator.
pub use orchestrator::{ExportOutcome, Orchestrator, VmExportJob};

// Re-export the sanitizer.
pub use sanitize::sanitize_vm_name;
