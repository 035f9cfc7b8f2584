//! Bounded, resumable asset downloads.
//!
//! Tasks run in sequential batches; inside a batch a [`BatchExecutor`] keeps
//! at most `workers` downloads in flight. Destinations that already exist
//! are skipped, so re-running over a populated store writes nothing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::FetchConfig;
use crate::executor::BatchExecutor;
use crate::harvest::traits::{AssetSource, AssetStore, FetchError};
use crate::model::{AssetTask, Cancellation};

/// Per-run download counters. `succeeded` includes `skipped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl FetchSummary {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn merge(&mut self, other: FetchSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Reported after every batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub batch: usize,
    pub batches: usize,
    pub total_tasks: usize,
    pub summary: FetchSummary,
}

enum Outcome {
    Written,
    Skipped,
}

pub struct AssetFetcher {
    source: Arc<dyn AssetSource>,
    store: Arc<dyn AssetStore>,
    batch_size: usize,
    executor: BatchExecutor,
}

impl AssetFetcher {
    pub fn new(
        source: Arc<dyn AssetSource>,
        store: Arc<dyn AssetStore>,
        config: &FetchConfig,
    ) -> Self {
        Self {
            source,
            store,
            batch_size: config.batch_size.max(1),
            executor: BatchExecutor::new(config.workers),
        }
    }

    /// Downloads every task, reporting after each batch. Cancellation is
    /// checked between batches; tasks in unstarted batches are not counted.
    #[instrument(skip(self, tasks, cancel, on_batch), fields(tasks = tasks.len()))]
    pub async fn fetch_all<F>(
        &self,
        tasks: Vec<AssetTask>,
        cancel: &Cancellation,
        mut on_batch: F,
    ) -> FetchSummary
    where
        F: FnMut(BatchProgress),
    {
        let total_tasks = tasks.len();
        let batches = total_tasks.div_ceil(self.batch_size);
        let mut summary = FetchSummary::default();

        for (index, batch) in tasks.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                info!(completed_batches = index, "Asset fetch cancelled");
                break;
            }

            summary.merge(self.fetch_batch(batch.to_vec()).await);
            debug!(
                batch = index + 1,
                batches,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Asset batch finished"
            );
            on_batch(BatchProgress {
                batch: index + 1,
                batches,
                total_tasks,
                summary,
            });
        }

        info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            "Asset fetch finished"
        );
        summary
    }

    async fn fetch_batch(&self, batch: Vec<AssetTask>) -> FetchSummary {
        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let work = Arc::new(move |task: AssetTask| {
            let source = Arc::clone(&source);
            let store = Arc::clone(&store);
            async move {
                let outcome = fetch_one(source.as_ref(), store.as_ref(), &task).await;
                (task, outcome)
            }
        });

        let mut summary = FetchSummary::default();
        for result in self.executor.run_batch(batch, work).await {
            match result {
                Ok((_, Ok(Outcome::Written))) => summary.succeeded += 1,
                Ok((_, Ok(Outcome::Skipped))) => {
                    summary.succeeded += 1;
                    summary.skipped += 1;
                }
                Ok((task, Err(e))) => {
                    warn!(url = %task.url, error = %e, "Asset download failed");
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(error = %FetchError::Worker(e.to_string()), "Asset worker failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

async fn fetch_one(
    source: &dyn AssetSource,
    store: &dyn AssetStore,
    task: &AssetTask,
) -> Result<Outcome, FetchError> {
    if store.exists(&task.destination).await? {
        return Ok(Outcome::Skipped);
    }
    let bytes = source.fetch(&task.url).await?;
    store.write(&task.destination, &bytes).await?;
    Ok(Outcome::Written)
}

// ============================================================================
// HTTP Source
// ============================================================================

pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Flat directory of downloaded files.
///
/// Files are written under a temporary name and renamed into place, so an
/// interrupted write never looks like a finished download.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AssetStore for DirectoryStore {
    async fn exists(&self, name: &str) -> Result<bool, FetchError> {
        Ok(tokio::fs::try_exists(self.root.join(name)).await?)
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<(), FetchError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let target = self.root.join(name);
        let partial = self.root.join(format!("{}.part", name));
        let written = match tokio::fs::write(&partial, bytes).await {
            Ok(()) => tokio::fs::rename(&partial, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                debug!(path = %partial.display(), error = %cleanup, "Partial file not removed");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    files: HashMap<String, Vec<u8>>,
    writes: usize,
}

/// In-memory store; clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> HashSet<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(name).cloned()
    }

    /// Writes performed since creation.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn exists(&self, name: &str) -> Result<bool, FetchError> {
        Ok(self.lock().files.contains_key(name))
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<(), FetchError> {
        let mut state = self.lock();
        state.files.insert(name.to_string(), bytes.to_vec());
        state.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves `<url>` as bytes unless the URL contains "missing".
    #[derive(Default)]
    struct StubSource {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl AssetSource for StubSource {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if url.contains("missing") {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                });
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    fn tasks(n: usize) -> Vec<AssetTask> {
        (0..n)
            .map(|i| AssetTask {
                url: format!("https://img.example/{}.jpg", i),
                destination: format!("asset_{}.jpg", i),
            })
            .collect()
    }

    fn fetcher(source: Arc<StubSource>, store: Arc<dyn AssetStore>) -> AssetFetcher {
        AssetFetcher::new(source, store, &FetchConfig::default())
    }

    #[tokio::test]
    async fn test_second_run_is_fully_skipped() {
        let store = MemoryStore::new();
        let fetcher = fetcher(Arc::new(StubSource::default()), Arc::new(store.clone()));

        let first = fetcher.fetch_all(tasks(23), &Cancellation::new(), |_| {}).await;
        assert_eq!(first.succeeded, 23);
        assert_eq!(store.writes(), 23);

        let second = fetcher.fetch_all(tasks(23), &Cancellation::new(), |_| {}).await;
        assert_eq!(second.succeeded, 23);
        assert_eq!(second.skipped, 23);
        assert_eq!(store.writes(), 23);
    }

    #[tokio::test]
    async fn test_failures_are_counted_per_task() {
        let store = MemoryStore::new();
        let fetcher = fetcher(Arc::new(StubSource::default()), Arc::new(store.clone()));
        let mut work = tasks(4);
        work[2].url = "https://img.example/missing.jpg".to_string();

        let summary = fetcher.fetch_all(work, &Cancellation::new(), |_| {}).await;
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert!(store.get("asset_2.jpg").is_none());
    }

    #[tokio::test]
    async fn test_batches_report_progress_and_bound_workers() {
        let source = Arc::new(StubSource::default());
        let fetcher = fetcher(Arc::clone(&source), Arc::new(MemoryStore::new()));

        let mut reports = Vec::new();
        fetcher
            .fetch_all(tasks(25), &Cancellation::new(), |p| reports.push(p))
            .await;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[2].batches, 3);
        assert_eq!(reports[0].summary.processed(), 10);
        assert_eq!(reports[2].summary.processed(), 25);
        assert!(source.peak.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_batches() {
        let fetcher = fetcher(Arc::new(StubSource::default()), Arc::new(MemoryStore::new()));
        let cancel = Cancellation::new();
        let trigger = cancel.clone();

        let summary = fetcher
            .fetch_all(tasks(30), &cancel, |_| trigger.cancel())
            .await;
        assert_eq!(summary.processed(), 10);
    }

    #[tokio::test]
    async fn test_directory_store_removes_partial_file_on_failed_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        // A non-empty directory at the target path makes the rename fail.
        std::fs::create_dir_all(dir.path().join("taken.jpg").join("inner")).unwrap();

        let result = store.write("taken.jpg", b"bytes").await;
        assert!(matches!(result, Err(FetchError::Store(_))));
        assert!(!dir.path().join("taken.jpg.part").exists());
    }

    /// Serves `/ok.jpg` (200), `/slow.jpg` (stalls) and 404 for anything else.
    async fn serve_assets() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => read += n,
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = match path.as_str() {
                        "/ok.jpg" => ("200 OK", "jpeg-bytes"),
                        "/slow.jpg" => {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            ("200 OK", "late")
                        }
                        _ => ("404 Not Found", "gone"),
                    };
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_source_maps_status_and_timeout() {
        let base = serve_assets().await;
        let config = FetchConfig {
            timeout_secs: 1,
            ..FetchConfig::default()
        };
        let source = HttpSource::new(&config).unwrap();

        let bytes = source.fetch(&format!("{}/ok.jpg", base)).await.unwrap();
        assert_eq!(bytes, b"jpeg-bytes");

        let missing = source.fetch(&format!("{}/missing.jpg", base)).await;
        assert!(matches!(
            missing,
            Err(FetchError::Status { status: 404, ref url }) if url.ends_with("/missing.jpg")
        ));

        let slow = source.fetch(&format!("{}/slow.jpg", base)).await;
        assert!(matches!(slow, Err(FetchError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_directory_store_resumes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("assets"));
        std::fs::create_dir_all(store.root()).unwrap();
        std::fs::write(store.root().join("asset_0.jpg"), b"old").unwrap();

        let fetcher = fetcher(Arc::new(StubSource::default()), Arc::new(store.clone()));
        let summary = fetcher.fetch_all(tasks(2), &Cancellation::new(), |_| {}).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(std::fs::read(store.root().join("asset_0.jpg")).unwrap(), b"old");
        assert_eq!(
            std::fs::read(store.root().join("asset_1.jpg")).unwrap(),
            b"https://img.example/1.jpg"
        );
        assert!(!store.root().join("asset_1.jpg.part").exists());
    }
}
