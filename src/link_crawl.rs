//! Link-following breadth traversal
//!
//! Every frontier node is captured as a page. Nodes shallower than
//! `max_depth` contribute their same-origin links as the next layer.

use crate::capture::{CaptureTarget, PageCapturer};
use crate::frontier::{CaptureJob, FrontierNode};
use crate::renderer::PageHandle;
use crate::traversal::{Candidate, Entered, FrontierStrategy, Visit};
use crate::utils;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

pub struct LinkCrawl {
    capturer: Arc<PageCapturer>,
}

impl LinkCrawl {
    pub fn new(capturer: Arc<PageCapturer>) -> Self {
        Self { capturer }
    }
}

#[async_trait]
impl FrontierStrategy for LinkCrawl {
    fn name(&self) -> &'static str {
        "link"
    }

    async fn enter(
        &self,
        page: &dyn PageHandle,
        job: &mut CaptureJob,
        node: &FrontierNode,
    ) -> Entered {
        let target = CaptureTarget::page(node.url.as_str(), node.depth);
        let artifact = self
            .capturer
            .capture(page, &target, job.options.wait_after_load)
            .await;

        if !artifact.success {
            let reason = artifact
                .error
                .clone()
                .unwrap_or_else(|| format!("Could not capture {}", node.url));
            return Entered::Failed {
                artifact: Some(artifact),
                reason,
            };
        }

        // A redirect target counts as visited too, so it is not captured twice.
        if let Ok(landed) = Url::parse(&artifact.url) {
            if job.mark_visited(&landed) {
                debug!("{} redirected to {}", node.url, landed);
            }
        }

        Entered::Loaded(Some(artifact))
    }

    async fn next_candidates(
        &self,
        page: &dyn PageHandle,
        job: &CaptureJob,
        node: &FrontierNode,
    ) -> Vec<Candidate> {
        if node.depth >= job.options.max_depth {
            return Vec::new();
        }

        let hrefs = match page.extract_links().await {
            Ok(hrefs) => hrefs,
            Err(e) => {
                warn!("Failed to extract links from {}: {}", node.url, e);
                return Vec::new();
            }
        };

        let base = match page.current_url().await.ok().and_then(|u| Url::parse(&u).ok()) {
            Some(url) => url,
            None => node.url.clone(),
        };

        let mut seen = HashSet::new();
        hrefs
            .iter()
            .filter_map(|href| utils::normalize_link(&base, href))
            .filter(|url| utils::same_origin(url, &job.base_url))
            .filter(|url| !job.is_visited(url))
            .filter(|url| seen.insert(utils::visit_key(url)))
            .map(Candidate::Link)
            .collect()
    }

    async fn visit(
        &self,
        _page: &dyn PageHandle,
        _job: &mut CaptureJob,
        node: &FrontierNode,
        candidate: Candidate,
    ) -> Visit {
        match candidate {
            Candidate::Link(url) => Visit {
                artifact: None,
                discovered: Some(FrontierNode {
                    url,
                    depth: node.depth + 1,
                }),
            },
            Candidate::Element(_) => Visit::default(),
        }
    }
}
