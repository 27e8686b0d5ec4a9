//! C4 — Resumable HTTP range downloader.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ExportError;
use crate::progress::FileProgress;
use crate::throttle::TokenBucket;

/// Download `url` into `path`, resuming from the existing file size if any.
/// Returns the final file size (`startPos + bytes copied this call`).
pub async fn download_file(
    http: &reqwest::Client,
    cancel: &CancellationToken,
    url: &str,
    path: &Path,
    progress: Arc<FileProgress>,
    bandwidth_limit: u64,
    bandwidth_burst: u64,
) -> Result<u64, ExportError> {
    let start_pos = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => meta.len(),
        _ => 0,
    };
    if start_pos > 0 {
        progress.seed(start_pos);
    }

    let mut request = http.get(url);
    if start_pos > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={start_pos}-"));
    }

    let response = request.send().await?;
    let status = response.status();
    if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(ExportError::Http(
            response.error_for_status().unwrap_err(),
        ));
    }
    if start_pos > 0 && status != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(ExportError::invalid_input(
            "range",
            format!("server ignored Range request, returned {status}"),
        ));
    }

    let total = total_size(&response, start_pos);
    progress.set_total(total);

    let bucket = if bandwidth_limit > 0 {
        TokenBucket::new(bandwidth_limit, bandwidth_burst)
    } else {
        TokenBucket::unlimited()
    };

    let mut file = if start_pos > 0 {
        OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| ExportError::io(path, e))?
    } else {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExportError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| ExportError::io(path, e))?
    };

    let mut stream = response.bytes_stream();
    let mut copied = 0u64;
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        let chunk = chunk?;
        bucket.take(chunk.len() as u64, cancel).await;
        file.write_all(&chunk)
            .await
            .map_err(|e| ExportError::io(path, e))?;
        progress.add(chunk.len() as u64);
        copied += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| ExportError::io(path, e))?;

    debug!(url, ?path, start_pos, copied, "download complete");
    Ok(start_pos + copied)
}

fn total_size(response: &reqwest::Response, start_pos: u64) -> u64 {
    if let Some(content_range) = response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(total) = parse_content_range_total(content_range) {
            return total;
        }
    }
    response
        .content_length()
        .map(|len| start_pos + len)
        .unwrap_or(start_pos)
}

/// Parses `bytes a-b/total` into `total`.
fn parse_content_range_total(header: &str) -> Option<u64> {
    let rest = header.strip_prefix("bytes ")?;
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_range_total() {
        assert_eq!(
            parse_content_range_total("bytes 524288-1048575/1048576"),
            Some(1048576)
        );
    }

    #[test]
    fn rejects_malformed_content_range() {
        assert_eq!(parse_content_range_total("not a range"), None);
    }
}
