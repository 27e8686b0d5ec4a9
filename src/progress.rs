//! Progress reporting shared by the downloader (C4) and transfer coordinator
//! (C5). The core never renders anything itself; it only drives the
//! caller-supplied [`ProgressCallback`](crate::config::ProgressCallback).

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::config::ProgressCallback;

/// Per-file progress state, shared between the downloader and whatever is
/// driving the overall job-level counter.
pub struct FileProgress {
    current: AtomicU64,
    total: AtomicU64,
    file_name: String,
    file_index: usize,
    total_files: usize,
    callback: Option<ProgressCallback>,
    overall: Option<Arc<OverallProgress>>,
}

impl FileProgress {
    pub fn new(
        file_name: impl Into<String>,
        file_index: usize,
        total_files: usize,
        callback: Option<ProgressCallback>,
        overall: Option<Arc<OverallProgress>>,
    ) -> Self {
        Self {
            current: AtomicU64::new(0),
            total: AtomicU64::new(0),
            file_name: file_name.into(),
            file_index,
            total_files,
            callback,
            overall,
        }
    }

    /// Seed `current` without firing the callback, used when resuming from
    /// a checkpoint where the on-disk file already has bytes.
    pub fn seed(&self, bytes: u64) {
        self.current.store(bytes, Ordering::SeqCst);
        if let Some(overall) = &self.overall {
            overall.add(bytes);
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        self.notify();
    }

    /// Record `n` additional bytes transferred and fire the callback exactly
    /// once per call, matching the "tee" contract in the downloader.
    pub fn add(&self, n: u64) {
        self.current.fetch_add(n, Ordering::SeqCst);
        if let Some(overall) = &self.overall {
            overall.add(n);
        }
        self.notify();
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    fn notify(&self) {
        if let Some(callback) = &self.callback {
            callback(
                self.current(),
                self.total(),
                &self.file_name,
                self.file_index,
                self.total_files,
            );
        }
    }
}

/// Cumulative "bytes so far" counter for an entire job, monotonically
/// non-decreasing as required by the coordinator's ordering guarantee.
#[derive(Default)]
pub struct OverallProgress {
    bytes_so_far: AtomicU64,
    total_bytes: AtomicU64,
}

impl OverallProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.total_bytes.store(total, Ordering::SeqCst);
    }

    pub fn add(&self, n: u64) -> u64 {
        self.bytes_so_far.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.bytes_so_far.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }
}

/// Wraps an [`AsyncRead`] so every successful read is tee'd into a
/// [`FileProgress`] before being handed to the caller — the "tee into
/// progress writer" stage of the downloader's read pipeline.
pub struct ProgressReader<R> {
    inner: R,
    progress: Arc<FileProgress>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: Arc<FileProgress>) -> Self {
        Self { inner, progress }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = buf.filled().len() - before;
            if read > 0 {
                self.progress.add(read as u64);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[test]
    fn fires_callback_on_add_and_set_total() {
        let calls: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        let callback: ProgressCallback = Arc::new(move |current, total, _name, _idx, _count| {
            c.lock().unwrap().push((current, total));
        });
        let fp = FileProgress::new("disk-0.vmdk", 0, 1, Some(callback), None);
        fp.set_total(1024);
        fp.add(100);
        fp.add(200);

        let recorded = calls.lock().unwrap();
        assert_eq!(*recorded, vec![(0, 1024), (100, 1024), (300, 1024)]);
    }

    #[test]
    fn feeds_overall_counter() {
        let overall = Arc::new(OverallProgress::new());
        let fp = FileProgress::new("disk-0.vmdk", 0, 1, None, Some(overall.clone()));
        fp.add(50);
        fp.add(25);
        assert_eq!(overall.bytes_so_far(), 75);
    }

    #[tokio::test]
    async fn progress_reader_tees_every_byte_read() {
        let data = vec![1u8; 4096];
        let cursor = std::io::Cursor::new(data.clone());
        let fp = Arc::new(FileProgress::new("x", 0, 1, None, None));
        let mut reader = ProgressReader::new(cursor, fp.clone());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(fp.current(), data.len() as u64);
    }

    #[test]
    fn seed_sets_current_without_double_counting_overall() {
        let overall = Arc::new(OverallProgress::new());
        let fp = FileProgress::new("x", 0, 1, None, Some(overall.clone()));
        fp.seed(512);
        assert_eq!(fp.current(), 512);
        assert_eq!(overall.bytes_so_far(), 512);
    }
}
