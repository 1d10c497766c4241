//! Page Capture Unit
//!
//! Loads one URL on an open page, waits for it to settle, and turns it into a
//! [`CapturedArtifact`]. Nothing escapes this boundary as an error: every
//! failure becomes an artifact with `success = false`.

use crate::renderer::PageHandle;
use crate::{retry_with_backoff, thumbnail, CaptureError, CaptureSettings, Metrics};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// How an artifact came to be captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureAction {
    /// Seed page of an interactive exploration
    InitialLoad,
    /// Page reached by navigating to a URL
    Page,
    /// Page state after clicking an element
    Click,
}

/// Identity of the artifact about to be captured.
#[derive(Debug, Clone)]
pub struct CaptureTarget {
    pub url: String,
    pub depth: u32,
    pub action: CaptureAction,
    pub triggering_element: Option<String>,
}

impl CaptureTarget {
    pub fn page(url: impl Into<String>, depth: u32) -> Self {
        Self {
            url: url.into(),
            depth,
            action: CaptureAction::Page,
            triggering_element: None,
        }
    }
}

/// One captured page. Immutable once recorded in a job.
#[derive(Debug, Clone)]
pub struct CapturedArtifact {
    /// 1-based position in the job, assigned when recorded
    pub order: usize,
    pub url: String,
    pub title: String,
    pub full_image: Arc<Vec<u8>>,
    pub thumbnail: Arc<Vec<u8>>,
    pub success: bool,
    pub error: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub depth: u32,
    pub action: CaptureAction,
    pub triggering_element: Option<String>,
    pub duration: Duration,
}

pub struct PageCapturer {
    settings: CaptureSettings,
    metrics: Arc<Metrics>,
}

impl PageCapturer {
    pub fn new(settings: CaptureSettings, metrics: Arc<Metrics>) -> Self {
        Self { settings, metrics }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Navigates to `url`, retrying transient failures with the configured
    /// backoff. Each attempt is bounded by the navigation timeout.
    pub async fn load(&self, page: &dyn PageHandle, url: &str) -> Result<(), CaptureError> {
        let nav_timeout = self.settings.navigation_timeout;
        retry_with_backoff(
            &self.settings.navigation_retry,
            |attempt| async move {
                if attempt > 0 {
                    self.metrics.navigation_retries.increment(1);
                    debug!("Navigation attempt {} for {}", attempt + 1, url);
                }
                match timeout(nav_timeout, page.navigate(url)).await {
                    Ok(result) => result,
                    Err(_) => Err(CaptureError::navigation(
                        url,
                        format!("navigation timed out after {nav_timeout:?}"),
                    )),
                }
            },
            CaptureError::is_retryable,
        )
        .await
    }

    /// Captures whatever `page` currently shows, after waiting `settle`.
    pub async fn snapshot(
        &self,
        page: &dyn PageHandle,
        target: &CaptureTarget,
        settle: Duration,
    ) -> CapturedArtifact {
        let started = Instant::now();
        if !settle.is_zero() {
            sleep(settle).await;
        }

        let url = match timeout(self.settings.title_timeout, page.current_url()).await {
            Ok(Ok(current)) if !current.is_empty() => current,
            _ => target.url.clone(),
        };
        let title = match timeout(self.settings.title_timeout, page.title()).await {
            Ok(Ok(title)) if !title.trim().is_empty() => title,
            _ => UNKNOWN_TITLE.to_string(),
        };

        let shot = match timeout(self.settings.screenshot_timeout, page.screenshot()).await {
            Ok(Ok(bytes)) if bytes.is_empty() => Err(CaptureError::CaptureFailure(
                "screenshot buffer was empty".to_string(),
            )),
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout(self.settings.screenshot_timeout)),
        };

        match shot {
            Ok(bytes) => {
                let full_image = Arc::new(bytes);
                let thumbnail = self.thumbnail(full_image.clone()).await;
                let artifact = CapturedArtifact {
                    order: 0,
                    url,
                    title,
                    full_image,
                    thumbnail: Arc::new(thumbnail),
                    success: true,
                    error: None,
                    captured_at: Utc::now(),
                    depth: target.depth,
                    action: target.action,
                    triggering_element: target.triggering_element.clone(),
                    duration: started.elapsed(),
                };
                self.metrics.record_page(artifact.duration, true);
                artifact
            }
            Err(e) => {
                let mut artifact = self.failed(target, &e, started.elapsed());
                artifact.url = url;
                artifact.title = title;
                artifact
            }
        }
    }

    /// Decodes and resizes on the blocking pool; full-page PNGs can be large.
    async fn thumbnail(&self, full_image: Arc<Vec<u8>>) -> Vec<u8> {
        let (width, height) = (self.settings.thumbnail_width, self.settings.thumbnail_height);
        match tokio::task::spawn_blocking(move || {
            thumbnail::thumbnail_or_placeholder(&full_image, width, height)
        })
        .await
        {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                warn!("Thumbnail task failed: {}", e);
                thumbnail::placeholder(width, height)
            }
        }
    }

    /// Loads and snapshots `target.url` in one step.
    pub async fn capture(
        &self,
        page: &dyn PageHandle,
        target: &CaptureTarget,
        settle: Duration,
    ) -> CapturedArtifact {
        let started = Instant::now();
        match self.load(page, &target.url).await {
            Ok(()) => self.snapshot(page, target, settle).await,
            Err(e) => self.failed(target, &e, started.elapsed()),
        }
    }

    /// Failed artifact for `target`, carrying a placeholder thumbnail.
    pub fn failed(
        &self,
        target: &CaptureTarget,
        error: &CaptureError,
        duration: Duration,
    ) -> CapturedArtifact {
        warn!("Capture of {} failed: {}", target.url, error);
        self.metrics.record_page(duration, false);

        CapturedArtifact {
            order: 0,
            url: target.url.clone(),
            title: UNKNOWN_TITLE.to_string(),
            full_image: Arc::new(Vec::new()),
            thumbnail: Arc::new(thumbnail::placeholder(
                self.settings.thumbnail_width,
                self.settings.thumbnail_height,
            )),
            success: false,
            error: Some(error.user_message()),
            captured_at: Utc::now(),
            depth: target.depth,
            action: target.action,
            triggering_element: target.triggering_element.clone(),
            duration,
        }
    }
}
