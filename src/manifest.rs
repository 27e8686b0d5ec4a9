//! C8 — Artifact manifest builder: a JSON record of every disk and metadata
//! file produced by an export, with streaming SHA-256 checksums so a
//! consumer can verify the artifact without re-deriving it from the VMS.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

const MANIFEST_SCHEMA_VERSION: &str = "1.0";
const HASH_CHUNK_SIZE: usize = 64 * 1024;
const SHA256_PREFIX: &str = "sha256:";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest at {path} is not valid JSON: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("checksum mismatch for {disk_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        disk_id: String,
        expected: String,
        actual: String,
    },
    #[error("manifest references missing file {0}")]
    MissingFile(String),
    #[error("manifest is invalid: {0}")]
    Invalid(String),
}

/// `source.export_method` — how the artifact left the VMS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportMethod {
    Download,
    Incremental,
}

/// Where the VM came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestSource {
    pub provider: String,
    pub vm_id: String,
    pub vm_name: String,
    pub datacenter: String,
    pub export_method: ExportMethod,
}

/// `vm.firmware`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Firmware {
    Bios,
    Uefi,
}

impl Firmware {
    /// Unrecognized values fall back to `bios`, the more common default.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "uefi" => Self::Uefi,
            _ => Self::Bios,
        }
    }
}

/// `vm.os_hint`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OsHint {
    Linux,
    Windows,
    Unknown,
}

impl OsHint {
    /// Coarse guess from a free-text guest-OS string as reported by the VMS.
    pub fn from_guest_os(guest_os: &str) -> Self {
        let lower = guest_os.to_ascii_lowercase();
        if lower.contains("win") {
            Self::Windows
        } else if ["linux", "ubuntu", "centos", "debian", "rhel", "suse"]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            Self::Linux
        } else {
            Self::Unknown
        }
    }
}

/// Guest configuration captured at export time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestVm {
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub firmware: Firmware,
    pub os_hint: OsHint,
    pub os_version: Option<String>,
    pub secure_boot: bool,
}

/// `disks[].kind`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    Boot,
    Data,
}

/// One produced disk image, keyed by `id` for `verify_checksums`'s
/// per-disk pass/fail map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskEntry {
    pub id: String,
    pub source_format: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub boot_order_hint: u32,
    pub kind: DiskKind,
    /// `sha256:<hex>`, present only when checksum computation was requested.
    pub checksum: Option<String>,
}

/// `pipeline` block — which post-export stages the job asked for, not
/// whether they ran (that lives in [`crate::pipeline::PipelineOutcome`]).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestPipeline {
    pub inspect: bool,
    pub fix: bool,
    pub convert: bool,
    pub validate: bool,
}

/// `output` block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestOutput {
    pub directory: PathBuf,
    pub target_format: String,
    pub filename: String,
}

/// hypersdk metadata block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestMetadata {
    pub hypersdk_version: String,
    pub job_id: String,
    pub labels: HashMap<String, String>,
}

/// Export artifact manifest, schema version `1.0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub manifest_version: String,
    pub source: ManifestSource,
    pub vm: ManifestVm,
    pub disks: Vec<DiskEntry>,
    pub pipeline: ManifestPipeline,
    pub output: ManifestOutput,
    pub metadata: ManifestMetadata,
}

impl Manifest {
    pub fn new(
        source: ManifestSource,
        vm: ManifestVm,
        pipeline: ManifestPipeline,
        output: ManifestOutput,
        metadata: ManifestMetadata,
    ) -> Self {
        Self {
            manifest_version: MANIFEST_SCHEMA_VERSION.to_string(),
            source,
            vm,
            disks: Vec::new(),
            pipeline,
            output,
            metadata,
        }
    }

    pub fn push_disk(&mut self, disk: DiskEntry) {
        self.disks.push(disk);
    }

    pub fn total_size(&self) -> u64 {
        self.disks.iter().map(|d| d.size_bytes).sum()
    }

    /// Invariants (ii) and (iv) from the manifest data model: every disk
    /// path stays within the output directory, and at least one disk is
    /// marked `kind=boot` when any disks are present.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.manifest_version != MANIFEST_SCHEMA_VERSION {
            return Err(ManifestError::Invalid(format!(
                "manifest_version must be '{MANIFEST_SCHEMA_VERSION}', got '{}'",
                self.manifest_version
            )));
        }
        if !self.disks.is_empty() && !self.disks.iter().any(|d| d.kind == DiskKind::Boot) {
            return Err(ManifestError::Invalid(
                "at least one disk must have kind=boot".to_string(),
            ));
        }
        for disk in &self.disks {
            if !path_is_within(&self.output.directory, &disk.path) {
                return Err(ManifestError::Invalid(format!(
                    "disk {} path {} escapes output directory {}",
                    disk.id,
                    disk.path.display(),
                    self.output.directory.display()
                )));
            }
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String, ManifestError> {
        serde_json::to_string_pretty(self).map_err(|e| ManifestError::Corrupt {
            path: PathBuf::new(),
            message: e.to_string(),
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ManifestError> {
        self.validate()?;
        let content = self.to_json_pretty()?;
        std::fs::write(path, content).map_err(|e| ManifestError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn read_from(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ManifestError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Re-hash every disk that carries a checksum and compare it against the
    /// file on disk (relative to `base_dir`), returning a pass/fail map keyed
    /// by disk id rather than stopping at the first mismatch. A disk with no
    /// checksum is reported as `true` (nothing to verify).
    pub async fn verify_checksums(
        &self,
        base_dir: &Path,
    ) -> Result<HashMap<String, bool>, ManifestError> {
        let mut results = HashMap::with_capacity(self.disks.len());
        for disk in &self.disks {
            let Some(expected) = &disk.checksum else {
                results.insert(disk.id.clone(), true);
                continue;
            };
            let path = base_dir.join(&disk.path);
            if !path.exists() {
                return Err(ManifestError::MissingFile(disk.path.display().to_string()));
            }
            let expected_hex = expected.strip_prefix(SHA256_PREFIX).unwrap_or(expected);
            let actual = compute_file_sha256(&path).await?;
            results.insert(disk.id.clone(), actual.eq_ignore_ascii_case(expected_hex));
        }
        Ok(results)
    }
}

fn path_is_within(base: &Path, candidate: &Path) -> bool {
    if candidate.is_absolute() {
        candidate.starts_with(base)
    } else {
        !candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    }
}

/// Stream-hash a file in fixed-size chunks so arbitrarily large disk images
/// never need to be held in memory at once.
pub async fn compute_file_sha256(path: &Path) -> Result<String, ManifestError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ManifestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| ManifestError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Prefix a raw hex digest the way the manifest schema requires it stored.
pub fn prefixed_sha256(hex_digest: impl Into<String>) -> String {
    format!("{SHA256_PREFIX}{}", hex_digest.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    fn sample_manifest(output_dir: &Path) -> Manifest {
        Manifest::new(
            ManifestSource {
                provider: "vms".into(),
                vm_id: "vm-42".into(),
                vm_name: "demo".into(),
                datacenter: "dc1".into(),
                export_method: ExportMethod::Download,
            },
            ManifestVm {
                cpu_count: 2,
                memory_mb: 4096,
                firmware: Firmware::Bios,
                os_hint: OsHint::Linux,
                os_version: Some("22.04".into()),
                secure_boot: false,
            },
            ManifestPipeline::default(),
            ManifestOutput {
                directory: output_dir.to_path_buf(),
                target_format: "ovf".into(),
                filename: "demo.ovf".into(),
            },
            ManifestMetadata {
                hypersdk_version: "0.1.0".into(),
                job_id: "job-1".into(),
                labels: HashMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn computes_known_sha256() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        let mut f = tokio::fs::File::create(&path).await.unwrap();
        f.write_all(b"hello world").await.unwrap();
        f.flush().await.unwrap();

        let digest = compute_file_sha256(&path).await.unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dacefbe65f0cf4f8e31e1a99e1b3e7d1c3c6f"
                .to_ascii_lowercase()
        );
    }

    #[test]
    fn prefixes_raw_digest() {
        assert_eq!(prefixed_sha256("abc123"), "sha256:abc123");
    }

    #[test]
    fn round_trips_through_json() {
        let dir = tempdir().unwrap();
        let mut manifest = sample_manifest(dir.path());
        manifest.push_disk(DiskEntry {
            id: "disk-0".into(),
            source_format: "vmdk".into(),
            path: "disk-0.vmdk".into(),
            size_bytes: 4096,
            boot_order_hint: 0,
            kind: DiskKind::Boot,
            checksum: Some(prefixed_sha256("abc123")),
        });
        let path = dir.path().join("manifest.json");
        manifest.write_to(&path).unwrap();
        let loaded = Manifest::read_from(&path).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn rejects_manifest_with_no_boot_disk() {
        let dir = tempdir().unwrap();
        let mut manifest = sample_manifest(dir.path());
        manifest.push_disk(DiskEntry {
            id: "disk-0".into(),
            source_format: "vmdk".into(),
            path: "disk-0.vmdk".into(),
            size_bytes: 10,
            boot_order_hint: 0,
            kind: DiskKind::Data,
            checksum: None,
        });
        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(_)));
    }

    #[test]
    fn rejects_disk_path_escaping_output_directory() {
        let dir = tempdir().unwrap();
        let mut manifest = sample_manifest(dir.path());
        manifest.push_disk(DiskEntry {
            id: "disk-0".into(),
            source_format: "vmdk".into(),
            path: "../outside.vmdk".into(),
            size_bytes: 10,
            boot_order_hint: 0,
            kind: DiskKind::Boot,
            checksum: None,
        });
        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(_)));
    }

    #[tokio::test]
    async fn verify_checksums_reports_per_disk_mismatch() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("disk-0.vmdk"), b"actual content")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("disk-1.vmdk"), b"hello world")
            .await
            .unwrap();

        let mut manifest = sample_manifest(dir.path());
        manifest.push_disk(DiskEntry {
            id: "disk-0".into(),
            source_format: "vmdk".into(),
            path: "disk-0.vmdk".into(),
            size_bytes: 14,
            boot_order_hint: 0,
            kind: DiskKind::Boot,
            checksum: Some(prefixed_sha256("0".repeat(64))),
        });
        manifest.push_disk(DiskEntry {
            id: "disk-1".into(),
            source_format: "vmdk".into(),
            path: "disk-1.vmdk".into(),
            size_bytes: 11,
            boot_order_hint: 1,
            kind: DiskKind::Data,
            checksum: Some(prefixed_sha256(
                "b94d27b9934d3e08a52e52d7da7dacefbe65f0cf4f8e31e1a99e1b3e7d1c3c6f",
            )),
        });

        let results = manifest.verify_checksums(dir.path()).await.unwrap();
        assert_eq!(results.get("disk-0"), Some(&false));
        assert_eq!(results.get("disk-1"), Some(&true));
    }

    #[tokio::test]
    async fn verify_checksums_detects_missing_file() {
        let dir = tempdir().unwrap();
        let mut manifest = sample_manifest(dir.path());
        manifest.push_disk(DiskEntry {
            id: "disk-0".into(),
            source_format: "vmdk".into(),
            path: "missing.vmdk".into(),
            size_bytes: 0,
            boot_order_hint: 0,
            kind: DiskKind::Boot,
            checksum: Some(prefixed_sha256("abc")),
        });
        let err = manifest.verify_checksums(dir.path()).await.unwrap_err();
        assert!(matches!(err, ManifestError::MissingFile(_)));
    }

    #[test]
    fn total_size_sums_disks() {
        let dir = tempdir().unwrap();
        let mut manifest = sample_manifest(dir.path());
        manifest.push_disk(DiskEntry {
            id: "a".into(),
            source_format: "vmdk".into(),
            path: "a.vmdk".into(),
            size_bytes: 10,
            boot_order_hint: 0,
            kind: DiskKind::Boot,
            checksum: None,
        });
        manifest.push_disk(DiskEntry {
            id: "b".into(),
            source_format: "vmdk".into(),
            path: "b.vmdk".into(),
            size_bytes: 20,
            boot_order_hint: 1,
            kind: DiskKind::Data,
            checksum: None,
        });
        assert_eq!(manifest.total_size(), 30);
    }
}
