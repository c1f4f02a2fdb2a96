//! Resumable package downloader.
//!
//! Streams a remote package into a local file, resuming from the current
//! file length with an HTTP range request. Progress reports are time-gated
//! and carry a smoothed ETA. Cancellation is cooperative: the read loop wakes
//! on cancellation even while waiting for the next chunk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::config::DownloadConfig;
use crate::error::UpdateError;
use crate::progress::{DownloadProgress, ProgressGate, ThroughputEstimator};
use crate::transport::HttpTransport;

const STATUS_PARTIAL_CONTENT: u16 = 206;
const STATUS_RANGE_NOT_SATISFIABLE: u16 = 416;

/// What to download and where.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub dest: PathBuf,
    /// Size declared by the feed; used for progress and completion
    pub expected_size: u64,
}

/// A download that stopped before completing.
///
/// Bytes already written stay on disk in both cases; `downloaded` is the
/// file length at the time of failure.
#[derive(Debug)]
pub struct DownloadFailure {
    /// Stopped because the caller cancelled, not because of an error
    pub cancelled: bool,
    pub downloaded: u64,
    pub error: UpdateError,
}

impl DownloadFailure {
    fn cancelled(downloaded: u64) -> Self {
        Self {
            cancelled: true,
            downloaded,
            error: UpdateError::Cancelled,
        }
    }

    fn failed(downloaded: u64, error: UpdateError) -> Self {
        Self {
            cancelled: false,
            downloaded,
            error,
        }
    }
}

/// Resumable downloader over an [`HttpTransport`].
pub struct Downloader {
    transport: Arc<dyn HttpTransport>,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(transport: Arc<dyn HttpTransport>, config: DownloadConfig) -> Self {
        Self { transport, config }
    }

    /// Download `request.url` into `request.dest`, resuming from the current
    /// file length.
    ///
    /// The first progress report is delivered once the server has answered,
    /// so callers can use it as the "connected" signal. Returns the final
    /// byte count, which may be short of `expected_size` if the server closed
    /// the stream early.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        cancel: &CancelFlag,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<u64, DownloadFailure> {
        let dest = request.dest.as_path();
        let mut offset = existing_len(dest)
            .await
            .map_err(|e| DownloadFailure::failed(0, e.into()))?;
        if offset > request.expected_size {
            warn!(
                dest = %dest.display(),
                offset,
                expected = request.expected_size,
                "Partial file is larger than the package, restarting download"
            );
            offset = 0;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadFailure::failed(offset, e.into()))?;
        }

        if cancel.is_cancelled() {
            return Err(DownloadFailure::cancelled(offset));
        }

        info!(url = %request.url, dest = %dest.display(), offset, "Starting download");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadFailure::cancelled(offset)),
            r = self.transport.open(&request.url, offset) => {
                r.map_err(|e| DownloadFailure::failed(offset, e))?
            }
        };

        let truncate = match response.status {
            STATUS_RANGE_NOT_SATISFIABLE if offset > 0 && offset == request.expected_size => {
                debug!(offset, "Range not satisfiable at full size, already complete");
                on_progress(DownloadProgress {
                    eta_seconds: Some(0),
                    ..DownloadProgress::new(offset, request.expected_size)
                });
                return Ok(offset);
            }
            STATUS_PARTIAL_CONTENT if offset > 0 => false,
            status if (200..300).contains(&status) => {
                if offset > 0 {
                    warn!(
                        offset,
                        status, "Server ignored range request, restarting download"
                    );
                    offset = 0;
                }
                true
            }
            status => {
                warn!(url = %request.url, status, "Download rejected by server");
                return Err(DownloadFailure::failed(
                    offset,
                    UpdateError::HttpStatus { status },
                ));
            }
        };

        let mut file = open_dest(dest, truncate)
            .await
            .map_err(|e| DownloadFailure::failed(offset, e.into()))?;

        let mut body = response.body;
        let mut downloaded = offset;
        let mut gate = ProgressGate::new(self.config.progress_interval());
        let mut estimator = ThroughputEstimator::new(
            self.config.eta_window(),
            self.config.eta_window_samples,
        );
        let mut last_reported = None;

        let mut report = |downloaded: u64, force: bool| {
            let now = Instant::now();
            estimator.record(now, downloaded);
            let progress = DownloadProgress::new(downloaded, request.expected_size);
            let is_final = force || progress.is_complete();
            if gate.should_emit(now, is_final) && last_reported != Some(downloaded) {
                last_reported = Some(downloaded);
                on_progress(DownloadProgress {
                    eta_seconds: estimator.eta_seconds(progress.remaining()),
                    ..progress
                });
            }
        };

        report(downloaded, false);

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(None),
                next = body.next() => next,
            };

            match next {
                None => break Ok(()),
                Some(Err(e)) => break Err(Some(e)),
                Some(Ok(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        break Err(Some(UpdateError::from(e)));
                    }
                    downloaded += chunk.len() as u64;
                    report(downloaded, false);
                }
            }

            if cancel.is_cancelled() {
                break Err(None);
            }
        };

        // Flush before reporting anything so a resume starts at the real length
        if let Err(e) = finish(&mut file).await {
            return Err(DownloadFailure::failed(downloaded, e.into()));
        }
        report(downloaded, true);

        match outcome {
            Ok(()) => {
                info!(dest = %dest.display(), downloaded, "Download stream finished");
                Ok(downloaded)
            }
            Err(None) => {
                debug!(downloaded, "Download cancelled");
                Err(DownloadFailure::cancelled(downloaded))
            }
            Err(Some(error)) => {
                warn!(downloaded, error = %error, "Download interrupted");
                Err(DownloadFailure::failed(downloaded, error))
            }
        }
    }

    /// Fetch a small metadata file into `dest`.
    ///
    /// The body goes to `<dest>.part` first and is renamed into place only
    /// when complete, so readers never see a truncated file.
    pub async fn fetch_metadata(&self, url: &str, dest: &Path) -> Result<u64, UpdateError> {
        let part = part_path(dest);
        match self.fetch_into(url, &part).await {
            Ok(len) => {
                tokio::fs::rename(&part, dest).await?;
                debug!(url, dest = %dest.display(), len, "Fetched metadata");
                Ok(len)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn fetch_into(&self, url: &str, path: &Path) -> Result<u64, UpdateError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let response = self.transport.open(url, 0).await?;
        if !response.is_success() {
            return Err(UpdateError::HttpStatus {
                status: response.status,
            });
        }

        let mut file = File::create(path).await?;
        let mut body = response.body;
        let mut len = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            len += chunk.len() as u64;
        }
        finish(&mut file).await?;
        Ok(len)
    }
}

/// Temporary path used while a file is being written.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn existing_len(path: &Path) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

async fn open_dest(path: &Path, truncate: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    options.open(path).await
}

async fn finish(file: &mut File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::TransportResponse;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serves a byte buffer in fixed-size chunks.
    pub(crate) struct MemoryTransport {
        data: Vec<u8>,
        chunk: usize,
        honor_range: bool,
        fail_after: Option<usize>,
        stall_after: Option<usize>,
        status: Option<u16>,
        pub(crate) ranges: Mutex<Vec<u64>>,
    }

    impl MemoryTransport {
        pub(crate) fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                chunk: 100,
                honor_range: true,
                fail_after: None,
                stall_after: None,
                status: None,
                ranges: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for MemoryTransport {
        async fn open(
            &self,
            _url: &str,
            range_start: u64,
        ) -> Result<TransportResponse, UpdateError> {
            self.ranges.lock().push(range_start);
            if let Some(status) = self.status {
                return Ok(TransportResponse {
                    status,
                    content_length: None,
                    body: futures_util::stream::empty().boxed(),
                });
            }

            let start = if self.honor_range { range_start as usize } else { 0 };
            if start >= self.data.len() && start > 0 {
                return Ok(TransportResponse {
                    status: STATUS_RANGE_NOT_SATISFIABLE,
                    content_length: None,
                    body: futures_util::stream::empty().boxed(),
                });
            }
            let status = if start > 0 { STATUS_PARTIAL_CONTENT } else { 200 };

            let mut chunks: Vec<Result<Bytes, UpdateError>> = Vec::new();
            let mut served = 0usize;
            for piece in self.data[start..].chunks(self.chunk) {
                if self.fail_after.is_some_and(|limit| served >= limit) {
                    chunks.push(Err(UpdateError::Network("connection reset".into())));
                    break;
                }
                if self.stall_after.is_some_and(|limit| served >= limit) {
                    break;
                }
                chunks.push(Ok(Bytes::copy_from_slice(piece)));
                served += piece.len();
            }

            let body = futures_util::stream::iter(chunks);
            let body = if self.stall_after.is_some() {
                body.chain(futures_util::stream::pending()).boxed()
            } else {
                body.boxed()
            };
            Ok(TransportResponse {
                status,
                content_length: Some((self.data.len() - start) as u64),
                body,
            })
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn downloader(transport: Arc<MemoryTransport>) -> Downloader {
        let config = DownloadConfig {
            progress_interval_ms: 0,
            ..DownloadConfig::default()
        };
        Downloader::new(transport, config)
    }

    fn request(dir: &TempDir, size: u64) -> DownloadRequest {
        DownloadRequest {
            url: "https://updates.example.com/a.zip".into(),
            dest: dir.path().join("pkg").join("a.zip"),
            expected_size: size,
        }
    }

    fn collector() -> (Arc<Mutex<Vec<DownloadProgress>>>, impl Fn(DownloadProgress) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p| sink.lock().push(p))
    }

    #[tokio::test]
    async fn test_download_from_scratch() {
        let dir = TempDir::new().unwrap();
        let data = payload(1000);
        let transport = Arc::new(MemoryTransport::new(data.clone()));
        let req = request(&dir, 1000);
        let (seen, sink) = collector();

        let n = downloader(transport.clone())
            .download(&req, &CancelFlag::new(), &sink)
            .await
            .unwrap();

        assert_eq!(n, 1000);
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);
        assert_eq!(*transport.ranges.lock(), vec![0]);

        let seen = seen.lock();
        assert_eq!(seen.first().unwrap().downloaded, 0);
        assert_eq!(seen.last().unwrap().downloaded, 1000);
        assert_eq!(seen.last().unwrap().percent(), 100);
    }

    #[tokio::test]
    async fn test_resume_appends_from_file_length() {
        let dir = TempDir::new().unwrap();
        let data = payload(1000);
        let req = request(&dir, 1000);
        std::fs::create_dir_all(req.dest.parent().unwrap()).unwrap();
        std::fs::write(&req.dest, &data[..400]).unwrap();

        let transport = Arc::new(MemoryTransport::new(data.clone()));
        let n = downloader(transport.clone())
            .download(&req, &CancelFlag::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(n, 1000);
        assert_eq!(*transport.ranges.lock(), vec![400]);
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let data = payload(1000);
        let req = request(&dir, 1000);
        std::fs::create_dir_all(req.dest.parent().unwrap()).unwrap();
        std::fs::write(&req.dest, vec![0xffu8; 300]).unwrap();

        let mut transport = MemoryTransport::new(data.clone());
        transport.honor_range = false;
        let n = downloader(Arc::new(transport))
            .download(&req, &CancelFlag::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(n, 1000);
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_range_not_satisfiable_at_full_size_is_complete() {
        let dir = TempDir::new().unwrap();
        let data = payload(500);
        let req = request(&dir, 500);
        std::fs::create_dir_all(req.dest.parent().unwrap()).unwrap();
        std::fs::write(&req.dest, &data).unwrap();

        let (seen, sink) = collector();
        let n = downloader(Arc::new(MemoryTransport::new(data)))
            .download(&req, &CancelFlag::new(), &sink)
            .await
            .unwrap();
        assert_eq!(n, 500);
        assert_eq!(seen.lock().last().unwrap().percent(), 100);
    }

    #[tokio::test]
    async fn test_oversized_partial_file_restarts() {
        let dir = TempDir::new().unwrap();
        let data = payload(1000);
        let req = request(&dir, 1000);
        std::fs::create_dir_all(req.dest.parent().unwrap()).unwrap();
        std::fs::write(&req.dest, payload(1200)).unwrap();

        let transport = Arc::new(MemoryTransport::new(data.clone()));
        let n = downloader(transport.clone())
            .download(&req, &CancelFlag::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(n, 1000);
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);
        assert_eq!(*transport.ranges.lock(), vec![0]);
    }

    #[tokio::test]
    async fn test_http_error_is_not_cancellation() {
        let dir = TempDir::new().unwrap();
        let mut transport = MemoryTransport::new(payload(10));
        transport.status = Some(404);

        let err = downloader(Arc::new(transport))
            .download(&request(&dir, 10), &CancelFlag::new(), &|_| {})
            .await
            .unwrap_err();
        assert!(!err.cancelled);
        assert!(matches!(err.error, UpdateError::HttpStatus { status: 404 }));
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_written_bytes() {
        let dir = TempDir::new().unwrap();
        let mut transport = MemoryTransport::new(payload(1000));
        transport.fail_after = Some(300);
        let req = request(&dir, 1000);

        let err = downloader(Arc::new(transport))
            .download(&req, &CancelFlag::new(), &|_| {})
            .await
            .unwrap_err();
        assert!(!err.cancelled);
        assert!(err.error.is_transport());
        assert_eq!(err.downloaded, 300);
        assert_eq!(std::fs::metadata(&req.dest).unwrap().len(), 300);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new(payload(10)));
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = downloader(transport.clone())
            .download(&request(&dir, 10), &cancel, &|_| {})
            .await
            .unwrap_err();
        assert!(err.cancelled);
        assert!(transport.ranges.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_wakes_stalled_stream() {
        let dir = TempDir::new().unwrap();
        let mut transport = MemoryTransport::new(payload(1000));
        transport.stall_after = Some(200);
        let req = request(&dir, 1000);
        let cancel = Arc::new(CancelFlag::new());

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            downloader(Arc::new(transport)).download(&req, &cancel, &|_| {}),
        )
        .await
        .expect("cancel should interrupt the stalled read")
        .unwrap_err();
        canceller.await.unwrap();

        assert!(err.cancelled);
        assert_eq!(err.downloaded, 200);
        assert_eq!(std::fs::metadata(&req.dest).unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_fetch_metadata_renames_on_success() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("meta").join("feed.json");
        let transport = Arc::new(MemoryTransport::new(b"{\"response\":[]}".to_vec()));

        let len = downloader(transport)
            .fetch_metadata("https://updates.example.com/feed.json", &dest)
            .await
            .unwrap();
        assert_eq!(len, 15);
        assert_eq!(std::fs::read(&dest).unwrap(), b"{\"response\":[]}");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fetch_metadata_failure_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("feed.json");
        let mut transport = MemoryTransport::new(payload(300));
        transport.fail_after = Some(100);

        let result = downloader(Arc::new(transport))
            .fetch_metadata("https://updates.example.com/feed.json", &dest)
            .await;
        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
