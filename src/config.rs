//! Configuration records consumed by the core.
//!
//! These are plain, already-parsed structs. Loading them from a file, env
//! vars, or CLI flags is the host application's job — this crate only
//! validates and uses them.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ExportError, ExportResult};
use crate::retry::RetryConfig;

/// Connection parameters for the remote virtualization management server.
#[derive(Debug, Clone)]
pub struct VmsConfig {
    /// `scheme://host[:port]` of the VMS endpoint.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification. Only ever set this for lab VMS
    /// instances with self-signed certificates.
    pub insecure: bool,
    /// Ceiling on session establishment (authenticate + default datacenter lookup).
    pub timeout: Duration,
    pub retry_attempts: u32,
    /// Initial retry delay. Auth backoff caps at `retry_delay * 8`; download
    /// backoff caps at `retry_delay * 16`.
    pub retry_delay: Duration,
}

impl VmsConfig {
    pub fn validate(&self) -> ExportResult<()> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| ExportError::invalid_input("url", e.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ExportError::invalid_input(
                "url",
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }
        if self.username.is_empty() {
            return Err(ExportError::invalid_input("username", "must not be empty"));
        }
        Ok(())
    }

    /// Retry config for the session-authenticate step: bounded to 8x the
    /// configured initial delay since auth latency is bounded.
    pub fn auth_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts,
            initial_delay: self.retry_delay,
            max_delay: self.retry_delay * 8,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Retry config for download-shaped operations: bounded to 16x.
    pub fn download_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts,
            initial_delay: self.retry_delay,
            max_delay: self.retry_delay * 16,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Output artifact format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Ovf,
    Ova,
}

impl ExportFormat {
    pub fn parse(s: &str) -> ExportResult<Self> {
        match s {
            "ovf" => Ok(Self::Ovf),
            "ova" => Ok(Self::Ova),
            other => Err(ExportError::invalid_input(
                "format",
                format!("must be 'ovf' or 'ova', got '{other}'"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ovf => "ovf",
            Self::Ova => "ova",
        }
    }
}

/// Signature of the caller-supplied progress callback:
/// `(current_bytes, total_bytes, file_name, file_index, total_files)`.
pub type ProgressCallback = std::sync::Arc<dyn Fn(u64, u64, &str, usize, usize) + Send + Sync>;

/// Per-job export options.
#[derive(Clone)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub output_path: PathBuf,
    pub remove_cdrom: bool,
    pub shutdown_timeout: Duration,

    pub parallel_downloads: u8,
    pub show_overall_progress: bool,
    pub show_individual_progress: bool,

    pub cleanup_ovf: bool,
    pub compress: bool,
    pub compression_level: u32,

    pub generate_manifest: bool,
    pub verify_manifest: bool,
    pub manifest_compute_checksum: bool,
    pub manifest_target_format: Option<String>,

    pub enable_pipeline: bool,
    pub pipeline_timeout: Duration,
    pub pipeline_dry_run: bool,
    pub pipeline_inspect: bool,
    pub pipeline_fix: bool,
    pub pipeline_convert: bool,
    pub pipeline_validate: bool,

    /// Bytes/second, 0 = unlimited.
    pub bandwidth_limit: u64,
    /// Burst bytes, 0 = auto (limit / 10).
    pub bandwidth_burst: u64,

    pub enable_checkpoints: bool,
    pub checkpoint_interval: Duration,
    pub resume_from_checkpoint: bool,
    pub checkpoint_path: Option<PathBuf>,

    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ExportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportOptions")
            .field("format", &self.format)
            .field("output_path", &self.output_path)
            .field("parallel_downloads", &self.parallel_downloads)
            .field("compress", &self.compress)
            .field("generate_manifest", &self.generate_manifest)
            .field("enable_checkpoints", &self.enable_checkpoints)
            .field("bandwidth_limit", &self.bandwidth_limit)
            .finish_non_exhaustive()
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Ovf,
            output_path: PathBuf::new(),
            remove_cdrom: false,
            shutdown_timeout: Duration::from_secs(300),
            parallel_downloads: 3,
            show_overall_progress: true,
            show_individual_progress: false,
            cleanup_ovf: false,
            compress: false,
            compression_level: 6,
            generate_manifest: false,
            verify_manifest: false,
            manifest_compute_checksum: false,
            manifest_target_format: None,
            enable_pipeline: false,
            pipeline_timeout: Duration::from_secs(1800),
            pipeline_dry_run: false,
            pipeline_inspect: false,
            pipeline_fix: false,
            pipeline_convert: false,
            pipeline_validate: false,
            bandwidth_limit: 0,
            bandwidth_burst: 0,
            enable_checkpoints: true,
            checkpoint_interval: Duration::from_secs(5),
            resume_from_checkpoint: false,
            checkpoint_path: None,
        }
    }
}

impl ExportOptions {
    pub fn validate(&self) -> ExportResult<()> {
        if !(1..=16).contains(&self.parallel_downloads) {
            return Err(ExportError::invalid_input(
                "parallel_downloads",
                format!("must be in [1,16], got {}", self.parallel_downloads),
            ));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(ExportError::invalid_input(
                "output_path",
                "must not be empty",
            ));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(ExportError::invalid_input(
                "compression_level",
                format!("must be in [1,9], got {}", self.compression_level),
            ));
        }
        Ok(())
    }

    /// Effective checkpoint path: the caller's override, or the default
    /// `<output_path>/.checkpoint-<sanitized-vm-name>.json` convention.
    pub fn checkpoint_path_for(&self, sanitized_vm_name: &str) -> PathBuf {
        self.checkpoint_path.clone().unwrap_or_else(|| {
            self.output_path
                .join(format!(".checkpoint-{sanitized_vm_name}.json"))
        })
    }
}
