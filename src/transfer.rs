//! C5 — Parallel transfer coordinator: bounded-concurrency fan-out across a
//! lease's file items, checkpoint-aware, aggregating per-file errors into a
//! single composite error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ProgressCallback;
use crate::error::ExportError;
use crate::progress::{FileProgress, OverallProgress};
use crate::retry::RetryEngine;
use crate::vms::FileItem;

#[derive(Debug, Clone)]
pub struct TransferItem {
    pub file_name: String,
    pub url: String,
}

impl From<&FileItem> for TransferItem {
    fn from(item: &FileItem) -> Self {
        Self {
            file_name: item.file_name.clone(),
            url: item.device_url.clone(),
        }
    }
}

pub struct TransferOptions {
    pub concurrency: usize,
    pub bandwidth_limit: u64,
    pub bandwidth_burst: u64,
    pub checkpoint_interval: Duration,
    pub progress_callback: Option<ProgressCallback>,
}

pub struct TransferOutcome {
    pub file_paths: Vec<PathBuf>,
    pub total_bytes: u64,
}

enum ItemResult {
    Done { index: usize, path: PathBuf, size: u64 },
    Failed { file_name: String, message: String },
}

/// Download every item in `items` into `output_dir`, respecting
/// `options.concurrency`, checkpointing progress as each file finishes.
pub async fn download_all(
    http: &reqwest::Client,
    cancel: &CancellationToken,
    retry: &RetryEngine,
    items: &[TransferItem],
    output_dir: &Path,
    options: TransferOptions,
    checkpoint_store: &CheckpointStore,
    checkpoint: &Mutex<Checkpoint>,
) -> Result<TransferOutcome, ExportError> {
    let total_count = items.len();
    let overall = Arc::new(OverallProgress::new());
    let concurrency = options.concurrency.max(1);
    // Elapsed-since-epoch sentinel so the very first file's progress always
    // saves regardless of the configured interval.
    let last_save = Mutex::new(Instant::now() - options.checkpoint_interval);

    let outcomes: Vec<ItemResult> = stream::iter(items.iter().enumerate())
        .map(|(index, item)| {
            let overall = overall.clone();
            let callback = options.progress_callback.clone();
            let last_save = &last_save;
            async move {
                transfer_one(
                    http,
                    cancel,
                    retry,
                    index,
                    total_count,
                    item,
                    output_dir,
                    &options,
                    checkpoint_store,
                    checkpoint,
                    last_save,
                    overall,
                    callback,
                )
                .await
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut ordered: Vec<Option<PathBuf>> = vec![None; total_count];
    let mut total_bytes = 0u64;
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            ItemResult::Done { index, path, size } => {
                ordered[index] = Some(path);
                total_bytes += size;
            }
            ItemResult::Failed { file_name, message } => {
                failures.push(format!("{file_name}: {message}"))
            }
        }
    }

    if !failures.is_empty() {
        return Err(ExportError::PartialTransfer {
            failed: failures.len(),
            total: total_count,
            details: failures.join("; "),
        });
    }

    info!(total_count, total_bytes, "transfer batch complete");
    Ok(TransferOutcome {
        file_paths: ordered.into_iter().flatten().collect(),
        total_bytes,
    })
}

/// Claims a checkpoint save slot if `interval` has elapsed since the last
/// claim, atomically advancing the shared clock so concurrent file
/// completions don't all save on the same tick.
async fn due_to_save(last_save: &Mutex<Instant>, interval: Duration) -> bool {
    let mut last = last_save.lock().await;
    if last.elapsed() >= interval {
        *last = Instant::now();
        true
    } else {
        false
    }
}

#[allow(clippy::too_many_arguments)]
async fn transfer_one(
    http: &reqwest::Client,
    cancel: &CancellationToken,
    retry: &RetryEngine,
    index: usize,
    total_count: usize,
    item: &TransferItem,
    output_dir: &Path,
    options: &TransferOptions,
    checkpoint_store: &CheckpointStore,
    checkpoint: &Mutex<Checkpoint>,
    last_save: &Mutex<Instant>,
    overall: Arc<OverallProgress>,
    callback: Option<ProgressCallback>,
) -> ItemResult {
    let path = output_dir.join(&item.file_name);

    let already_done = {
        let guard = checkpoint.lock().await;
        guard
            .files
            .get(&item.file_name)
            .map(|f| f.completed)
            .unwrap_or(false)
    };
    if already_done {
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            overall.add(meta.len());
            return ItemResult::Done {
                index,
                path,
                size: meta.len(),
            };
        }
    }

    let fp = Arc::new(FileProgress::new(
        item.file_name.clone(),
        index,
        total_count,
        callback,
        Some(overall),
    ));

    let label = format!("transfer:{}", item.file_name);
    let url = item.url.clone();
    let path_for_download = path.clone();
    let fp_for_download = fp.clone();
    let bandwidth_limit = options.bandwidth_limit;
    let bandwidth_burst = options.bandwidth_burst;

    let transfer_result = retry
        .run(cancel, &label, |_attempt| {
            crate::download::download_file(
                http,
                cancel,
                &url,
                &path_for_download,
                fp_for_download.clone(),
                bandwidth_limit,
                bandwidth_burst,
            )
        })
        .await;

    match transfer_result {
        Ok(final_size) => {
            let mut guard = checkpoint.lock().await;
            guard.record_progress(&item.file_name, final_size, final_size);
            guard.mark_complete(&item.file_name);
            if due_to_save(last_save, options.checkpoint_interval).await || guard.all_complete() {
                if let Err(err) = checkpoint_store.save(&guard) {
                    warn!(%err, "failed to save checkpoint after file completion");
                }
            } else {
                debug!(file = %item.file_name, "skipping checkpoint save, within interval");
            }
            ItemResult::Done {
                index,
                path,
                size: final_size,
            }
        }
        Err(err) => {
            let mut guard = checkpoint.lock().await;
            let current = guard.resume_offset(&item.file_name);
            guard.record_progress(&item.file_name, current, fp.total());
            if let Err(save_err) = checkpoint_store.save(&guard) {
                warn!(%save_err, "failed to save checkpoint after file failure");
            }
            ItemResult::Failed {
                file_name: item.file_name.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn skips_already_completed_file_with_matching_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk-0.vmdk");
        tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();

        let mut cp = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        cp.record_progress("disk-0.vmdk", 100, 100);
        cp.mark_complete("disk-0.vmdk");
        let checkpoint = Mutex::new(cp);
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        let http = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let retry = RetryEngine::without_network(RetryConfig::default());

        let items = vec![TransferItem {
            file_name: "disk-0.vmdk".into(),
            url: "http://example.invalid/disk-0.vmdk".into(),
        }];

        let outcome = download_all(
            &http,
            &cancel,
            &retry,
            &items,
            dir.path(),
            TransferOptions {
                concurrency: 2,
                bandwidth_limit: 0,
                bandwidth_burst: 0,
                checkpoint_interval: Duration::from_secs(5),
                progress_callback: None,
            },
            &store,
            &checkpoint,
        )
        .await
        .unwrap();

        assert_eq!(outcome.file_paths.len(), 1);
        assert_eq!(outcome.total_bytes, 100);
    }

    #[tokio::test]
    async fn aggregates_failures_into_a_partial_transfer_error() {
        let dir = tempdir().unwrap();
        let cp = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        let checkpoint = Mutex::new(cp);
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        let http = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let mut cfg = RetryConfig::default();
        cfg.max_attempts = 1;
        let retry = RetryEngine::without_network(cfg);

        let items = vec![TransferItem {
            file_name: "disk-0.vmdk".into(),
            url: "http://127.0.0.1:1/disk-0.vmdk".into(),
        }];

        let err = download_all(
            &http,
            &cancel,
            &retry,
            &items,
            dir.path(),
            TransferOptions {
                concurrency: 1,
                bandwidth_limit: 0,
                bandwidth_burst: 0,
                checkpoint_interval: Duration::from_secs(5),
                progress_callback: None,
            },
            &store,
            &checkpoint,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ExportError::PartialTransfer { failed: 1, total: 1, .. }));
    }
}
