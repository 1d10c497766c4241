//! Capture orchestration service
//!
//! Coordinates one job end to end: intake validation, session creation, pool
//! lease, traversal, packaging, and the final session transition. Each
//! accepted job runs on its own task; clients poll the session store while a
//! completion channel serves in-process waiters.

use crate::capture::PageCapturer;
use crate::chrome::ChromeLauncher;
use crate::explorer::InteractiveExplorer;
use crate::frontier::{CaptureJob, JobProgress};
use crate::link_crawl::LinkCrawl;
use crate::metrics::JobOutcome;
use crate::packaging::{artifact_filename, ArchiveBuilder, PackageRequest, Packager};
use crate::renderer::PageHandle;
use crate::session::{ArtifactSummary, CaptureSummary, Session, SessionUpdate};
use crate::store::{DurableStore, SessionStore, SqliteStore};
use crate::traversal::{traverse, FrontierStrategy};
use crate::{
    utils, validate_request, BrowserPool, CaptureError, CaptureMode, CaptureOptions,
    CaptureRequest, CapturedArtifact, Config, Metrics, PoolStats, SessionStatus,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

pub const CANCELLED_MESSAGE: &str = "Capture cancelled";
pub const TIMED_OUT_MESSAGE: &str = "Capture timed out";

/// How long shutdown waits for cancelled jobs to record their final state.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Live counters for a job still `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressView {
    pub captured: usize,
    pub failed: usize,
}

struct JobHandle {
    cancel: CancellationToken,
    progress: Arc<JobProgress>,
    done: watch::Receiver<bool>,
}

enum JobEnd {
    Finished(Result<CaptureSummary, CaptureError>),
    Cancelled,
    TimedOut,
}

pub struct CaptureService {
    config: Arc<Config>,
    pool: BrowserPool,
    store: Arc<SessionStore>,
    metrics: Arc<Metrics>,
    capturer: Arc<PageCapturer>,
    packager: Arc<dyn ArchiveBuilder>,
    jobs: DashMap<String, JobHandle>,
    store_sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureService {
    pub fn new(
        config: Arc<Config>,
        pool: BrowserPool,
        store: Arc<SessionStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let capturer = Arc::new(PageCapturer::new(config.capture.clone(), metrics.clone()));
        let packager = Arc::new(Packager::new(config.packaging.compression_level));
        Self {
            config,
            pool,
            store,
            metrics,
            capturer,
            packager,
            jobs: DashMap::new(),
            store_sweeper: Mutex::new(None),
        }
    }

    /// Wires the Chrome launcher and the SQLite store described by `config`.
    /// Without `store.path` sessions are kept in an in-memory database.
    pub fn from_config(config: Config, metrics: Arc<Metrics>) -> Result<Self, CaptureError> {
        config.validate()?;
        let config = Arc::new(config);

        let durable: Arc<dyn DurableStore> = match &config.store.path {
            Some(path) => {
                info!("Session store at {}", path.display());
                Arc::new(SqliteStore::open(path)?)
            }
            None => {
                info!("Session store is in-memory only");
                Arc::new(SqliteStore::open_in_memory()?)
            }
        };
        let store = Arc::new(SessionStore::new(&config.store, durable, metrics.clone()));
        let launcher = Arc::new(ChromeLauncher::new(config.clone()));
        let pool = BrowserPool::new(config.pool.clone(), launcher, metrics.clone());

        Ok(Self::new(config, pool, store, metrics))
    }

    /// Replaces the zip packager, e.g. with one that writes elsewhere.
    pub fn with_archive_builder(mut self, packager: Arc<dyn ArchiveBuilder>) -> Self {
        self.packager = packager;
        self
    }

    /// Starts the pool idle sweep and the session retention sweep.
    pub fn start_background_tasks(&self) {
        self.pool.start_sweeper();
        let handle = self.store.start_sweeper(self.config.store.sweep_interval);
        if let Some(previous) = self.store_sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn cached_sessions(&self) -> usize {
        self.store.cached_len()
    }

    /// Validates `request`, records a `processing` session and starts the
    /// job. Returns as soon as the session exists.
    pub async fn submit(self: &Arc<Self>, request: CaptureRequest) -> Result<Session, CaptureError> {
        let (url, options) = validate_request(&request, &self.config.limits)?;
        let id = Uuid::new_v4().to_string();

        let session = Session::processing(&id);
        self.store.create(session.clone()).await?;

        let cancel = CancellationToken::new();
        let progress = Arc::new(JobProgress::default());
        let (done_tx, done_rx) = watch::channel(false);
        self.jobs.insert(
            id.clone(),
            JobHandle {
                cancel: cancel.clone(),
                progress: progress.clone(),
                done: done_rx,
            },
        );

        info!(
            "Accepted capture {} of {} ({:?} mode, budget {})",
            id,
            url,
            options.mode,
            options.capture_budget()
        );

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service
                .run_job(id, url, Arc::new(options), cancel, progress, done_tx)
                .await;
        });

        Ok(session)
    }

    pub async fn status(&self, id: &str) -> Result<Option<Session>, CaptureError> {
        self.store.get(id).await
    }

    pub fn progress(&self, id: &str) -> Option<ProgressView> {
        self.jobs.get(id).map(|job| ProgressView {
            captured: job.progress.captured(),
            failed: job.progress.failed(),
        })
    }

    pub async fn list(&self) -> Vec<Session> {
        self.store.list_all().await
    }

    /// Archive of a completed session as `(filename, bytes)`.
    pub async fn archive(&self, id: &str) -> Result<(String, Bytes), CaptureError> {
        let session = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| CaptureError::SessionNotFound(id.to_string()))?;

        if session.status != SessionStatus::Completed {
            return Err(CaptureError::ArchiveNotReady(session.status));
        }
        let bytes = self
            .store
            .archive(id)
            .ok_or_else(|| CaptureError::ArchiveMissing(id.to_string()))?;

        Ok((archive_filename(&session), bytes))
    }

    /// Fails a `processing` session with "Capture cancelled" and stops its
    /// job. Finished sessions are left alone.
    pub async fn cancel(&self, id: &str) -> Result<Session, CaptureError> {
        let session = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| CaptureError::SessionNotFound(id.to_string()))?;

        if session.status.is_terminal() {
            return Err(CaptureError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Failed,
            });
        }

        if let Some(job) = self.jobs.get(id) {
            job.cancel.cancel();
        }
        let updated = self
            .store
            .update(id, SessionUpdate::failed(CANCELLED_MESSAGE))
            .await?;
        info!("Capture {} cancelled", id);
        Ok(updated)
    }

    /// Resolves once the job behind `id` has reached a terminal status.
    pub async fn wait(&self, id: &str) -> Result<Session, CaptureError> {
        let receiver = self.jobs.get(id).map(|job| job.done.clone());
        if let Some(mut receiver) = receiver {
            // A closed channel means the job task is gone; the store has the
            // final word either way.
            let _ = receiver.wait_for(|done| *done).await;
        }
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CaptureError::SessionNotFound(id.to_string()))
    }

    /// Cancels every running job, gives them a moment to record their final
    /// state, then closes the pool.
    pub async fn shutdown(&self) {
        info!("Shutting down capture service ({} running job(s))", self.jobs.len());

        let receivers: Vec<watch::Receiver<bool>> = self
            .jobs
            .iter()
            .map(|job| {
                job.cancel.cancel();
                job.done.clone()
            })
            .collect();

        let waits = receivers.into_iter().map(|mut receiver| async move {
            let _ = timeout(SHUTDOWN_GRACE, receiver.wait_for(|done| *done)).await;
        });
        join_all(waits).await;

        if let Some(sweeper) = self.store_sweeper.lock().take() {
            sweeper.abort();
        }
        self.pool.close_all().await;
    }

    async fn run_job(
        self: Arc<Self>,
        id: String,
        url: Url,
        options: Arc<CaptureOptions>,
        cancel: CancellationToken,
        progress: Arc<JobProgress>,
        done: watch::Sender<bool>,
    ) {
        let started = Instant::now();
        self.metrics.jobs_running.increment(1.0);

        let job_timeout = self.config.job_timeout;
        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => JobEnd::Cancelled,
            result = timeout(job_timeout, self.execute(&id, &url, options, progress)) => match result {
                Ok(result) => JobEnd::Finished(result),
                Err(_) => JobEnd::TimedOut,
            },
        };
        // A cancellation that raced with the last page wins.
        let end = if cancel.is_cancelled() {
            JobEnd::Cancelled
        } else {
            end
        };

        let (update, outcome) = match end {
            JobEnd::Finished(Ok(summary)) => {
                info!(
                    "Capture {} completed in {}: {} page(s), {} failed, archive {}",
                    id,
                    utils::format_duration(started.elapsed()),
                    summary.total_pages,
                    summary.failure_count,
                    utils::format_bytes(summary.archive_size)
                );
                (SessionUpdate::completed(summary), JobOutcome::Completed)
            }
            JobEnd::Finished(Err(e)) => {
                error!("Capture {} failed: {}", id, e);
                (SessionUpdate::failed(e.user_message()), JobOutcome::Failed)
            }
            JobEnd::Cancelled => {
                info!("Capture {} stopped after cancellation", id);
                (SessionUpdate::failed(CANCELLED_MESSAGE), JobOutcome::Cancelled)
            }
            JobEnd::TimedOut => {
                warn!("Capture {} exceeded the {:?} job timeout", id, job_timeout);
                (SessionUpdate::failed(TIMED_OUT_MESSAGE), JobOutcome::TimedOut)
            }
        };

        if let Err(e) = self.store.update(&id, update).await {
            // Usually a cancellation that landed first.
            debug!("Final update of capture {} skipped: {}", id, e);
        }

        self.metrics.jobs_running.decrement(1.0);
        self.metrics.record_job(started.elapsed(), outcome);
        let _ = done.send(true);
        self.jobs.remove(&id);
    }

    async fn execute(
        &self,
        id: &str,
        url: &Url,
        options: Arc<CaptureOptions>,
        progress: Arc<JobProgress>,
    ) -> Result<CaptureSummary, CaptureError> {
        let started = Instant::now();

        let lease = self.pool.acquire(options.browser).await?;
        debug!("Capture {} leased browser instance {}", id, lease.id());

        let page = PageGuard::new(id, lease.browser().new_page(&options.viewport).await?);
        let mut job = CaptureJob::new(id, url.clone(), options.clone()).with_progress(progress);

        let strategy: Box<dyn FrontierStrategy> = match options.mode {
            CaptureMode::Links => Box::new(LinkCrawl::new(self.capturer.clone())),
            CaptureMode::Interactive => Box::new(InteractiveExplorer::new(self.capturer.clone())),
        };

        let heartbeat = || lease.touch();
        let traversed = match page.get() {
            Some(handle) => traverse(strategy.as_ref(), handle, &mut job, &heartbeat).await,
            None => Err(CaptureError::CaptureFailure("page already closed".to_string())),
        };

        page.close().await;
        lease.release();
        traversed?;

        let artifacts = job.into_captures();
        let packager = self.packager.clone();
        let job_id = id.to_string();
        let base_url = url.clone();
        let mode = options.mode;
        let elapsed = started.elapsed();

        let (archive, artifacts) = tokio::task::spawn_blocking(move || {
            packager
                .build(&PackageRequest {
                    job_id: &job_id,
                    base_url: &base_url,
                    mode,
                    artifacts: &artifacts,
                    elapsed,
                })
                .map(|bytes| (bytes, artifacts))
        })
        .await
        .map_err(|e| CaptureError::PackagingFailure(format!("packaging task failed: {e}")))??;

        let summary = summarize(url, mode, &artifacts, archive.len());
        self.store.attach_archive(id, archive);
        Ok(summary)
    }
}

/// The job's page. Closed explicitly on the normal path; if the job future
/// is dropped on cancellation or timeout, the close runs on a detached task
/// so the tab does not outlive the job.
struct PageGuard {
    job_id: String,
    page: Option<Box<dyn PageHandle>>,
}

impl PageGuard {
    fn new(job_id: &str, page: Box<dyn PageHandle>) -> Self {
        Self {
            job_id: job_id.to_string(),
            page: Some(page),
        }
    }

    fn get(&self) -> Option<&dyn PageHandle> {
        self.page.as_deref()
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Failed to close page for capture {}: {}", self.job_id, e);
            }
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        let job_id = std::mem::take(&mut self.job_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Closing abandoned page of capture {}", job_id);
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        warn!("Failed to close abandoned page of capture {}: {}", job_id, e);
                    }
                });
            }
            Err(_) => warn!("Page of capture {} left open: no runtime to close it", job_id),
        }
    }
}

fn summarize(
    base_url: &Url,
    mode: CaptureMode,
    artifacts: &[CapturedArtifact],
    archive_size: usize,
) -> CaptureSummary {
    let success_count = artifacts.iter().filter(|a| a.success).count();
    CaptureSummary {
        base_url: base_url.to_string(),
        mode,
        total_pages: artifacts.len(),
        success_count,
        failure_count: artifacts.len() - success_count,
        archive_size,
        artifacts: artifacts
            .iter()
            .map(|a| ArtifactSummary {
                order: a.order,
                url: a.url.clone(),
                title: a.title.clone(),
                filename: artifact_filename(a),
                thumbnail: format!("data:image/png;base64,{}", STANDARD.encode(a.thumbnail.as_slice())),
                success: a.success,
                error: a.error.clone(),
                depth: a.depth,
                triggering_element: a.triggering_element.clone(),
                captured_at: a.captured_at,
            })
            .collect(),
    }
}

/// `capture-<host>-<first 8 chars of the id>.zip`
pub fn archive_filename(session: &Session) -> String {
    let host = session
        .result
        .as_ref()
        .and_then(|result| Url::parse(&result.base_url).ok())
        .and_then(|url| utils::extract_domain(&url))
        .map(|host| utils::sanitize_filename(&host))
        .unwrap_or_else(|| "site".to_string());
    let short: String = session.session_id.chars().take(8).collect();
    format!("capture-{host}-{short}.zip")
}
