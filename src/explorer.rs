//! Interactive exploration
//!
//! The seed page is captured as the initial load. Each node's clickable
//! elements are then clicked one at a time in priority order; every click
//! yields one artifact. The seed's elements are always clicked. A click that
//! lands on a new internal URL queues that URL for exploration only while its
//! depth stays below `max_depth`.

use crate::capture::{CaptureAction, CaptureTarget, PageCapturer};
use crate::frontier::{element_signature, sort_by_priority, CaptureJob, FrontierNode};
use crate::renderer::{ClickableElement, ElementKind, ElementQuery, PageHandle};
use crate::traversal::{Candidate, Entered, FrontierStrategy, Visit};
use crate::{utils, CaptureError, CapturedArtifact};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use url::Url;

pub struct InteractiveExplorer {
    capturer: Arc<PageCapturer>,
}

impl InteractiveExplorer {
    pub fn new(capturer: Arc<PageCapturer>) -> Self {
        Self { capturer }
    }

    async fn current_url(&self, page: &dyn PageHandle) -> Option<Url> {
        let url = timeout(self.capturer.settings().title_timeout, page.current_url())
            .await
            .ok()?
            .ok()?;
        Url::parse(&url).ok()
    }

    /// Filters raw elements down to clickable, not-yet-clicked, allowed
    /// candidates in priority order.
    fn select(
        &self,
        job: &CaptureJob,
        page_url: &Url,
        elements: Vec<ClickableElement>,
    ) -> Vec<ClickableElement> {
        let mut seen = HashSet::new();
        let mut selected: Vec<ClickableElement> = elements
            .into_iter()
            .filter(|el| match el.href.as_deref() {
                Some(href) if utils::is_non_navigable(href) => false,
                Some(href) if job.options.only_internal_navigation && el.kind == ElementKind::Link => {
                    match utils::normalize_link(page_url, href) {
                        Some(target) => utils::same_origin(&target, &job.base_url),
                        // fragment-only and similar in-page anchors
                        None => true,
                    }
                }
                _ => true,
            })
            .filter(|el| {
                let signature = element_signature(el);
                !job.is_clicked(&signature) && seen.insert(signature)
            })
            .collect();

        sort_by_priority(&mut selected);
        selected
    }

    async fn click_and_capture(
        &self,
        page: &dyn PageHandle,
        job: &CaptureJob,
        node: &FrontierNode,
        element: &ClickableElement,
        target: &CaptureTarget,
    ) -> Result<CapturedArtifact, CaptureError> {
        let on_node = self
            .current_url(page)
            .await
            .map(|current| utils::visit_key(&current) == utils::visit_key(&node.url))
            .unwrap_or(false);

        if !on_node {
            debug!("Returning to {} before clicking {}", node.url, element.selector);
            self.capturer.load(page, node.url.as_str()).await?;
            sleep(job.options.wait_after_load).await;
        }

        let click_timeout = self.capturer.settings().click_timeout;
        match timeout(click_timeout, page.click(&element.selector)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Click on {} failed: {}", element.selector, e);
                return Err(CaptureError::interaction(element.describe(), e.to_string()));
            }
            Err(_) => {
                return Err(CaptureError::interaction(
                    element.describe(),
                    format!("click timed out after {click_timeout:?}"),
                ))
            }
        }

        Ok(self
            .capturer
            .snapshot(page, target, job.options.click_delay)
            .await)
    }
}

#[async_trait]
impl FrontierStrategy for InteractiveExplorer {
    fn name(&self) -> &'static str {
        "interactive"
    }

    async fn enter(
        &self,
        page: &dyn PageHandle,
        job: &mut CaptureJob,
        node: &FrontierNode,
    ) -> Entered {
        if let Err(e) = self.capturer.load(page, node.url.as_str()).await {
            return Entered::Failed {
                artifact: None,
                reason: e.user_message(),
            };
        }

        if node.depth > 0 {
            sleep(job.options.wait_after_load).await;
            return Entered::Loaded(None);
        }

        let target = CaptureTarget {
            url: node.url.to_string(),
            depth: 0,
            action: CaptureAction::InitialLoad,
            triggering_element: None,
        };
        let artifact = self
            .capturer
            .snapshot(page, &target, job.options.wait_after_load)
            .await;

        if artifact.success {
            Entered::Loaded(Some(artifact))
        } else {
            let reason = artifact
                .error
                .clone()
                .unwrap_or_else(|| format!("Could not capture {}", node.url));
            Entered::Failed {
                artifact: Some(artifact),
                reason,
            }
        }
    }

    async fn next_candidates(
        &self,
        page: &dyn PageHandle,
        job: &CaptureJob,
        node: &FrontierNode,
    ) -> Vec<Candidate> {
        let query = ElementQuery {
            include: job.options.selectors.clone(),
            exclude: job.options.exclude_selectors.clone(),
        };
        let elements = match page.clickable_elements(&query).await {
            Ok(elements) => elements,
            Err(e) => {
                warn!("Failed to enumerate clickable elements on {}: {}", node.url, e);
                return Vec::new();
            }
        };

        let page_url = self
            .current_url(page)
            .await
            .unwrap_or_else(|| node.url.clone());

        self.select(job, &page_url, elements)
            .into_iter()
            .map(Candidate::Element)
            .collect()
    }

    async fn visit(
        &self,
        page: &dyn PageHandle,
        job: &mut CaptureJob,
        node: &FrontierNode,
        candidate: Candidate,
    ) -> Visit {
        let Candidate::Element(element) = candidate else {
            return Visit::default();
        };

        if !job.mark_clicked(element_signature(&element)) {
            return Visit::default();
        }

        let target = CaptureTarget {
            url: node.url.to_string(),
            depth: node.depth + 1,
            action: CaptureAction::Click,
            triggering_element: Some(element.describe()),
        };

        let started = Instant::now();
        let mut artifact = match self
            .click_and_capture(page, job, node, &element, &target)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                let elapsed: Duration = started.elapsed();
                return Visit {
                    artifact: Some(self.capturer.failed(&target, &e, elapsed)),
                    discovered: None,
                };
            }
        };

        let landed = Url::parse(&artifact.url).ok();
        let navigated = landed
            .as_ref()
            .map(|url| utils::visit_key(url) != utils::visit_key(&node.url))
            .unwrap_or(false);
        if !navigated {
            artifact.depth = node.depth;
        }

        let discovered = match landed {
            Some(url)
                if navigated
                    && utils::same_origin(&url, &job.base_url)
                    && node.depth + 1 < job.options.max_depth
                    && !job.is_visited(&url) =>
            {
                debug!("Click on {} led to {}", element.describe(), url);
                Some(FrontierNode {
                    url,
                    depth: node.depth + 1,
                })
            }
            _ => None,
        };

        Visit {
            artifact: Some(artifact),
            discovered,
        }
    }
}
