//! C7 — Export orchestrator. Drives one job through
//! Prepare → Lookup → PrepareVM → Lease → Transfer → Complete → Package →
//! Manifest → Finalize.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{ExportFormat, ExportOptions, VmsConfig};
use crate::error::{ExportError, ExportResult};
use crate::manifest::{
    compute_file_sha256, prefixed_sha256, DiskEntry, DiskKind, ExportMethod, Firmware, Manifest,
    ManifestMetadata, ManifestOutput, ManifestPipeline, ManifestSource, ManifestVm, OsHint,
};
use crate::network::{NetworkGate, NetworkSupervisor, NetworkSupervisorConfig};
use crate::package;
use crate::pipeline::{NullPipeline, PipelineInvoker, PipelineOptions};
use crate::pool::ConnectionPool;
use crate::retry::RetryEngine;
use crate::sanitize::sanitize_vm_name;
use crate::transfer::{download_all, TransferItem, TransferOptions};
use crate::vms::VmsClient;

const LEASE_WAIT_CEILING: Duration = Duration::from_secs(5 * 60);
const DEFAULT_TRANSFER_CEILING: Duration = Duration::from_secs(2 * 60 * 60);

/// VMS sessions are cheap `Arc` clones of the shared client, but pooling
/// still bounds how many concurrent `run()` calls hold one "checked out" at
/// once and gives idle sessions a chance to expire.
const DEFAULT_VMS_POOL_SIZE: u64 = 4;
const DEFAULT_VMS_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Checkpoint/manifest `source.provider` tag. The shipped VMS client is a
/// generic REST/JSON implementation, not tied to one vendor, so this names
/// the capability set rather than a specific product.
const PROVIDER_TAG: &str = "vms";

/// One export run's inputs.
pub struct VmExportJob {
    pub vm_path: String,
    pub options: ExportOptions,
}

/// What the orchestrator hands back on success.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub output_files: Vec<PathBuf>,
    pub total_size: u64,
    pub manifest_path: Option<PathBuf>,
    pub pipeline_ran: bool,
    pub pipeline_notes: Vec<String>,
}

pub struct Orchestrator {
    http: reqwest::Client,
    /// Source client the pool's factory clones from. Cloning an `Arc<dyn
    /// VmsClient>` is cheap; pooling bounds concurrent checkout and
    /// re-authenticates a session after it has sat idle.
    vms_factory: Arc<dyn VmsClient>,
    vms_pool: Arc<ConnectionPool<Arc<dyn VmsClient>>>,
    vms_config: VmsConfig,
    pipeline: Arc<dyn PipelineInvoker>,
    network: Arc<NetworkSupervisor>,
}

impl Orchestrator {
    pub fn new(http: reqwest::Client, vms: Arc<dyn VmsClient>, vms_config: VmsConfig) -> Self {
        Self {
            http,
            vms_factory: vms,
            vms_pool: Arc::new(ConnectionPool::new(
                DEFAULT_VMS_POOL_SIZE,
                DEFAULT_VMS_POOL_IDLE_TIMEOUT,
            )),
            vms_config,
            pipeline: Arc::new(NullPipeline),
            network: NetworkSupervisor::new(NetworkSupervisorConfig::default()).shared(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn PipelineInvoker>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Supply a caller-owned network supervisor, e.g. one also feeding a
    /// host application's connectivity UI, instead of the default
    /// internally-owned one.
    pub fn with_network_supervisor(mut self, network: Arc<NetworkSupervisor>) -> Self {
        self.network = network;
        self
    }

    pub async fn run(
        &self,
        job: VmExportJob,
        cancel: &CancellationToken,
    ) -> ExportResult<ExportOutcome> {
        job.options
            .validate()
            .map_err(|e| e.with_label("prepare"))?;

        // Prepare.
        tokio::fs::create_dir_all(&job.options.output_path)
            .await
            .map_err(|e| ExportError::io(&job.options.output_path, e).with_label("prepare"))?;

        let sanitized_name = sanitize_vm_name(&job.vm_path);
        let checkpoint_store = if job.options.enable_checkpoints {
            let checkpoint_path = job.options.checkpoint_path_for(&sanitized_name);
            CheckpointStore::new(checkpoint_path)
        } else {
            CheckpointStore::disabled()
        };

        let new_checkpoint = || {
            Checkpoint::new(
                sanitized_name.as_str(),
                job.vm_path.as_str(),
                PROVIDER_TAG,
                job.options.format.as_str(),
                job.options.output_path.as_path(),
            )
        };
        let checkpoint = if job.options.resume_from_checkpoint {
            checkpoint_store
                .load_with_recovery()
                .unwrap_or_else(new_checkpoint)
        } else {
            new_checkpoint()
        };
        let checkpoint = Mutex::new(checkpoint);

        self.network.start().await;
        let gate: Arc<dyn NetworkGate> = self.network.clone();
        let retry = RetryEngine::new(self.vms_config.auth_retry_config(), Some(gate));

        // Session — acquire a pooled VMS client handle for the lifetime of
        // this job instead of dialing the VMS factory directly.
        self.vms_pool.start_evictor().await;
        let factory = self.vms_factory.clone();
        let session = self
            .vms_pool
            .get(move || {
                let client = factory.clone();
                async move {
                    client.authenticate().await.map_err(|e| e.to_string())?;
                    Ok(client)
                }
            })
            .await
            .map_err(|e| ExportError::from(e).with_label("session"))?;
        let vms = session.get().clone();

        // Lookup.
        let vm = retry
            .run(cancel, "lookup", |_attempt| async {
                vms.find_vm(&job.vm_path)
                    .await
                    .map_err(non_retryable_vms_error)
            })
            .await?;
        info!(vm_id = %vm.id, "resolved VM");

        // PrepareVM.
        if job.options.remove_cdrom {
            if let Err(err) = self.remove_cdrom_devices(&vms, &vm.id).await {
                warn!(%err, "failed to detach CD/DVD devices, continuing");
            }
        }
        let descriptor_id = retry
            .run(cancel, "create-descriptor", |_attempt| async {
                vms.create_descriptor(&vm.id)
                    .await
                    .map_err(non_retryable_vms_error)
            })
            .await?;
        let descriptor_path = job
            .options
            .output_path
            .join(format!("{sanitized_name}.ovf"));
        tokio::fs::write(&descriptor_path, descriptor_id.as_bytes())
            .await
            .map_err(|e| ExportError::io(&descriptor_path, e).with_label("prepare-vm"))?;

        // Lease.
        let lease = tokio::time::timeout(
            LEASE_WAIT_CEILING,
            retry.run(cancel, "start-lease", |_attempt| async {
                vms.start_export_lease(&vm.id)
                    .await
                    .map_err(non_retryable_vms_error)
            }),
        )
        .await
        .map_err(|_| ExportError::Cancelled.with_label("lease-ceiling"))??;

        {
            let mut guard = checkpoint.lock().await;
            guard.lease_id = Some(lease.lease_id.clone());
            if let Err(err) = checkpoint_store.save(&guard) {
                warn!(%err, "failed to save checkpoint after lease acquisition");
            }
        }

        // Transfer — guarded by the job's transfer ceiling, and on any
        // error from here on the lease must be aborted.
        let transfer_outcome = tokio::time::timeout(
            DEFAULT_TRANSFER_CEILING,
            self.transfer_lease_files(&job, &lease, &checkpoint_store, &checkpoint, cancel),
        )
        .await;

        let transfer_outcome = match transfer_outcome {
            Ok(result) => result,
            Err(_) => Err(ExportError::Cancelled.with_label("transfer-ceiling")),
        };

        let transfer_outcome = match transfer_outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(abort_err) = vms.abort_lease(&lease.lease_id).await {
                    warn!(%abort_err, "failed to abort lease after transfer error");
                }
                return Err(err);
            }
        };

        // Complete.
        if let Err(err) = retry
            .run(cancel, "complete-lease", |_attempt| async {
                vms.complete_lease(&lease.lease_id)
                    .await
                    .map_err(non_retryable_vms_error)
            })
            .await
        {
            warn!(%err, "lease completion failed after successful transfer");
        }

        let mut output_files = transfer_outcome.file_paths.clone();
        output_files.push(descriptor_path.clone());
        let mut total_size = transfer_outcome.total_bytes;
        if let Ok(meta) = tokio::fs::metadata(&descriptor_path).await {
            total_size += meta.len();
        }

        // Disk entries for the manifest must be captured now, against the
        // per-disk files the lease described, before packaging can delete
        // them (`cleanup_ovf`) or fold them into a single `.ova` member.
        let disk_entries = if job.options.generate_manifest {
            self.collect_disk_entries(&lease, &transfer_outcome.file_paths, &job.options)
                .await?
        } else {
            Vec::new()
        };

        // Package.
        if job.options.format == ExportFormat::Ova {
            let ova_name = if job.options.compress {
                format!("{sanitized_name}.ova.gz")
            } else {
                format!("{sanitized_name}.ova")
            };
            let ova_path = job.options.output_path.join(&ova_name);
            package::build_ova(
                &job.options.output_path,
                &ova_path,
                job.options.compress,
                job.options.compression_level,
            )
            .map_err(|e| ExportError::from(e).with_label("package"))?;

            if job.options.cleanup_ovf {
                for path in &output_files {
                    let _ = tokio::fs::remove_file(path).await;
                }
            }
            output_files = vec![ova_path];
        }

        // Manifest.
        let manifest_path = if job.options.generate_manifest {
            let manifest_path = job.options.output_path.join("artifact-manifest.json");

            let vm_metadata = vms.vm_metadata(&vm.id).await.unwrap_or_else(|err| {
                warn!(%err, "failed to fetch VM metadata, manifest vm block will use defaults");
                crate::vms::VmMetadata::default()
            });

            let source = ManifestSource {
                provider: PROVIDER_TAG.to_string(),
                vm_id: vm.id.clone(),
                vm_name: sanitized_name.clone(),
                datacenter: datacenter_of(&job.vm_path),
                export_method: ExportMethod::Download,
            };
            let vm_block = ManifestVm {
                cpu_count: vm_metadata.cpu_count.unwrap_or(0),
                memory_mb: vm_metadata.memory_mb.unwrap_or(0),
                firmware: vm_metadata
                    .firmware
                    .as_deref()
                    .map(Firmware::parse)
                    .unwrap_or(Firmware::Bios),
                os_hint: vm_metadata
                    .guest_os
                    .as_deref()
                    .map(OsHint::from_guest_os)
                    .unwrap_or(OsHint::Unknown),
                os_version: vm_metadata.os_version.clone(),
                secure_boot: vm_metadata.secure_boot,
            };
            let output_name_source = if job.options.format == ExportFormat::Ova {
                output_files.first()
            } else {
                Some(&descriptor_path)
            };
            let output_block = ManifestOutput {
                directory: job.options.output_path.clone(),
                target_format: job.options.format.as_str().to_string(),
                filename: output_name_source
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            let pipeline_block = ManifestPipeline {
                inspect: job.options.pipeline_inspect,
                fix: job.options.pipeline_fix,
                convert: job.options.pipeline_convert,
                validate: job.options.pipeline_validate,
            };
            let metadata_block = ManifestMetadata {
                hypersdk_version: env!("CARGO_PKG_VERSION").to_string(),
                job_id: sanitized_name.clone(),
                labels: vm_metadata.annotations,
            };

            let mut manifest =
                Manifest::new(source, vm_block, pipeline_block, output_block, metadata_block);
            for disk in disk_entries {
                manifest.push_disk(disk);
            }
            manifest
                .write_to(&manifest_path)
                .map_err(|e| ExportError::from(e).with_label("manifest"))?;

            if job.options.verify_manifest && job.options.format != ExportFormat::Ova {
                let results = manifest
                    .verify_checksums(&job.options.output_path)
                    .await
                    .map_err(|e| ExportError::from(e).with_label("manifest-verify"))?;
                if let Some((disk_id, _)) = results.iter().find(|(_, ok)| !**ok) {
                    warn!(disk_id, "manifest checksum verification failed");
                }
            }
            Some(manifest_path)
        } else {
            None
        };

        // Delete + Finalize.
        if let Err(err) = checkpoint_store.delete() {
            warn!(%err, "failed to delete checkpoint on success");
        }

        let (pipeline_ran, pipeline_notes) = if job.options.enable_pipeline {
            let manifest_for_pipeline = manifest_path
                .clone()
                .unwrap_or_else(|| job.options.output_path.join("artifact-manifest.json"));
            let pipeline_opts = PipelineOptions {
                dry_run: job.options.pipeline_dry_run,
                inspect: job.options.pipeline_inspect,
                fix: job.options.pipeline_fix,
                convert: job.options.pipeline_convert,
                validate: job.options.pipeline_validate,
                timeout: Some(job.options.pipeline_timeout),
            };
            match self.pipeline.invoke(&manifest_for_pipeline, &pipeline_opts).await {
                Ok(outcome) => (outcome.ran, outcome.notes),
                Err(err) => {
                    warn!(%err, "pipeline failed; export still reports success");
                    (false, vec![format!("pipeline failed: {err}")])
                }
            }
        } else {
            (false, Vec::new())
        };

        Ok(ExportOutcome {
            output_files,
            total_size,
            manifest_path,
            pipeline_ran,
            pipeline_notes,
        })
    }

    /// Builds the manifest `disks` array from the lease's file descriptions
    /// and their just-transferred on-disk paths, computing checksums while
    /// the files are still guaranteed to exist in their untouched,
    /// pre-packaging form. The first disk encountered is tagged `boot`
    /// (leases list the boot disk first); the rest are `data`.
    async fn collect_disk_entries(
        &self,
        lease: &crate::vms::ExportLease,
        paths: &[PathBuf],
        options: &ExportOptions,
    ) -> ExportResult<Vec<DiskEntry>> {
        let mut entries = Vec::new();
        let mut boot_assigned = false;
        let mut boot_order = 0u32;
        for (file, path) in lease.files.iter().zip(paths.iter()) {
            if !file.is_disk {
                continue;
            }
            let size = tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .unwrap_or(file.size);
            let checksum = if options.manifest_compute_checksum {
                Some(prefixed_sha256(
                    compute_file_sha256(path)
                        .await
                        .map_err(|e| ExportError::from(e).with_label("manifest"))?,
                ))
            } else {
                None
            };
            let kind = if boot_assigned {
                DiskKind::Data
            } else {
                boot_assigned = true;
                DiskKind::Boot
            };
            let source_format = path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            entries.push(DiskEntry {
                id: file.file_name.clone(),
                source_format,
                path: path.clone(),
                size_bytes: size,
                boot_order_hint: boot_order,
                kind,
                checksum,
            });
            boot_order += 1;
        }
        Ok(entries)
    }

    async fn remove_cdrom_devices(&self, vms: &Arc<dyn VmsClient>, vm_id: &str) -> ExportResult<()> {
        let devices = vms.list_devices(vm_id).await?;
        for device in devices.iter().filter(|d| !d.is_disk) {
            vms.remove_device(vm_id, &device.device_url).await?;
        }
        Ok(())
    }

    async fn transfer_lease_files(
        &self,
        job: &VmExportJob,
        lease: &crate::vms::ExportLease,
        checkpoint_store: &CheckpointStore,
        checkpoint: &Mutex<Checkpoint>,
        cancel: &CancellationToken,
    ) -> ExportResult<crate::transfer::TransferOutcome> {
        let items: Vec<TransferItem> = lease.files.iter().map(TransferItem::from).collect();
        let gate: Arc<dyn NetworkGate> = self.network.clone();
        let download_retry = RetryEngine::new(self.vms_config.download_retry_config(), Some(gate));
        download_all(
            &self.http,
            cancel,
            &download_retry,
            &items,
            &job.options.output_path,
            TransferOptions {
                concurrency: job.options.parallel_downloads as usize,
                bandwidth_limit: job.options.bandwidth_limit,
                bandwidth_burst: job.options.bandwidth_burst,
                checkpoint_interval: job.options.checkpoint_interval,
                progress_callback: job.options.progress_callback.clone(),
            },
            checkpoint_store,
            checkpoint,
        )
        .await
    }
}

/// Inventory paths follow the `/datacenter/vm/name` convention; the first
/// segment is the datacenter. Falls back to `"default"` for a path with no
/// leading segment (e.g. a bare VM name).
fn datacenter_of(vm_path: &str) -> String {
    vm_path
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("default")
        .to_string()
}

/// VMS "not found" lookups must never be retried; everything else flows
/// through C1's ordinary classification.
fn non_retryable_vms_error(err: crate::vms::VmsError) -> ExportError {
    match &err {
        crate::vms::VmsError::NotFound(path) => ExportError::VmNotFound { path: path.clone() },
        crate::vms::VmsError::AuthFailed(message) => ExportError::AuthFailed {
            message: message.clone(),
        },
        _ => ExportError::from(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datacenter_of_takes_first_path_segment() {
        assert_eq!(datacenter_of("/dc1/vm/demo"), "dc1");
        assert_eq!(datacenter_of("dc1/vm/demo"), "dc1");
        assert_eq!(datacenter_of(""), "default");
        assert_eq!(datacenter_of("/"), "default");
    }

    #[test]
    fn not_found_is_marked_non_retryable() {
        let err = non_retryable_vms_error(crate::vms::VmsError::NotFound("x".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn auth_failed_is_marked_non_retryable() {
        let err = non_retryable_vms_error(crate::vms::VmsError::AuthFailed("bad creds".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn transport_errors_remain_retryable() {
        let err = non_retryable_vms_error(crate::vms::VmsError::Request("timeout".into()));
        assert!(err.is_retryable());
    }
}
