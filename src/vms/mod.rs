//! Virtualization-management-server capability surface.
//!
//! The orchestrator depends only on the [`VmsClient`] trait, never on a
//! concrete transport. [`http_client::HttpVmsClient`] is the one shipped
//! implementation, talking a generic REST/JSON dialect; a host embedding
//! this crate can supply its own implementation for a different VMS wire
//! protocol without touching the orchestrator.

pub mod http_client;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http_client::HttpVmsClient;

#[derive(Debug, Error)]
pub enum VmsError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("VM not found: {0}")]
    NotFound(String),
    #[error("VMS request failed: {0}")]
    Request(String),
    #[error("VMS returned an unexpected response: {0}")]
    Protocol(String),
    #[error("lease operation failed: {0}")]
    Lease(String),
}

/// One virtual disk or configuration file belonging to an export lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileItem {
    pub device_url: String,
    pub file_name: String,
    pub size: u64,
    pub is_disk: bool,
}

/// A handle to an in-progress export, returned by `start_export_lease` and
/// required to keep the VMS-side export session alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportLease {
    pub lease_id: String,
    pub files: Vec<FileItem>,
}

/// Minimal descriptor of a VM in the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub id: String,
    pub path: String,
    pub power_state: String,
}

/// Result of a listing operation: the VMs found plus a count of entries
/// skipped because they could not be described (permission errors, stale
/// inventory references, etc.) — skips are not failures.
#[derive(Debug, Clone, Default)]
pub struct ListOutcome {
    pub vms: Vec<VmSummary>,
    pub skipped: u32,
}

/// Capability set required from a virtualization management server.
///
/// Implementations are expected to be cheap to clone (an `Arc`-backed
/// client) since the pool and orchestrator hold references across awaits.
#[async_trait]
pub trait VmsClient: Send + Sync {
    async fn authenticate(&self) -> Result<(), VmsError>;

    async fn find_vm(&self, path: &str) -> Result<VmSummary, VmsError>;

    async fn list_vms(&self, folder: &str) -> Result<ListOutcome, VmsError>;

    async fn list_devices(&self, vm_id: &str) -> Result<Vec<FileItem>, VmsError>;

    async fn remove_device(&self, vm_id: &str, device_url: &str) -> Result<(), VmsError>;

    async fn create_descriptor(&self, vm_id: &str) -> Result<String, VmsError>;

    async fn start_export_lease(&self, vm_id: &str) -> Result<ExportLease, VmsError>;

    async fn complete_lease(&self, lease_id: &str) -> Result<(), VmsError>;

    async fn abort_lease(&self, lease_id: &str) -> Result<(), VmsError>;

    /// Whether this VMS exposes changed-block tracking. The distillation
    /// this crate is built from explicitly does not require incremental
    /// export support; this and `last_incremental_generation` exist so a
    /// caller can detect CBT availability without the orchestrator needing
    /// to special-case it.
    fn supports_cbt(&self) -> bool {
        false
    }

    fn last_incremental_generation(&self, _vm_id: &str) -> Option<String> {
        None
    }

    /// Guest/firmware metadata for the manifest `vm` block. VMS dialects
    /// that don't expose this return the all-absent default rather than an
    /// error — the manifest still gets written, with conservative fallbacks.
    async fn vm_metadata(&self, _vm_id: &str) -> Result<VmMetadata, VmsError> {
        Ok(VmMetadata::default())
    }
}

/// Per-VM metadata returned alongside devices, used to populate manifest
/// fields the VMS doesn't expose through `FileItem` alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmMetadata {
    pub annotations: HashMap<String, String>,
    pub guest_os: Option<String>,
    pub cpu_count: Option<u32>,
    pub memory_mb: Option<u64>,
    pub firmware: Option<String>,
    pub os_version: Option<String>,
    pub secure_boot: bool,
}
