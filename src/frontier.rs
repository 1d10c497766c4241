//! Traversal substrate shared by both strategies
//!
//! A [`CaptureJob`] is the job-local state: visited URLs, clicked element
//! signatures, the FIFO frontier, and the ordered artifact list. Nothing here
//! is shared between jobs.

use crate::renderer::ClickableElement;
use crate::{utils, CaptureOptions, CapturedArtifact};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// A page waiting to be visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierNode {
    pub url: Url,
    pub depth: u32,
}

impl FrontierNode {
    pub fn seed(url: Url) -> Self {
        Self { url, depth: 0 }
    }
}

/// Counts visible to pollers while a job runs. Not persisted.
#[derive(Debug, Default)]
pub struct JobProgress {
    captured: AtomicUsize,
    failed: AtomicUsize,
}

impl JobProgress {
    pub fn record(&self, success: bool) {
        if success {
            self.captured.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn captured(&self) -> usize {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Stable identity of a clickable element across page states: a SHA-256
/// over tag, selector and visible text.
pub fn element_signature(element: &ClickableElement) -> String {
    let mut hasher = Sha256::new();
    hasher.update(element.tag.as_bytes());
    hasher.update(b"|");
    hasher.update(element.selector.as_bytes());
    hasher.update(b"|");
    hasher.update(element.text.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Click order: links, then buttons, then anything else; shorter text first,
/// ties broken alphabetically.
pub fn sort_by_priority(elements: &mut [ClickableElement]) {
    elements.sort_by(|a, b| {
        a.kind
            .rank()
            .cmp(&b.kind.rank())
            .then_with(|| a.text.chars().count().cmp(&b.text.chars().count()))
            .then_with(|| a.text.cmp(&b.text))
            .then_with(|| a.selector.cmp(&b.selector))
    });
}

pub struct CaptureJob {
    pub job_id: String,
    pub base_url: Url,
    pub options: Arc<CaptureOptions>,
    frontier: VecDeque<FrontierNode>,
    visited_urls: HashSet<String>,
    visited_signatures: HashSet<String>,
    captures: Vec<CapturedArtifact>,
    budget: usize,
    progress: Arc<JobProgress>,
}

impl CaptureJob {
    pub fn new(job_id: impl Into<String>, base_url: Url, options: Arc<CaptureOptions>) -> Self {
        let budget = options.capture_budget();
        let mut frontier = VecDeque::new();
        frontier.push_back(FrontierNode::seed(base_url.clone()));

        Self {
            job_id: job_id.into(),
            base_url,
            options,
            frontier,
            visited_urls: HashSet::new(),
            visited_signatures: HashSet::new(),
            captures: Vec::new(),
            budget,
            progress: Arc::new(JobProgress::default()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<JobProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &Arc<JobProgress> {
        &self.progress
    }

    pub fn pop(&mut self) -> Option<FrontierNode> {
        self.frontier.pop_front()
    }

    /// Queues `node` unless its URL was already visited or it lies beyond
    /// `max_depth`. Returns whether it was queued.
    pub fn push(&mut self, node: FrontierNode) -> bool {
        if node.depth > self.options.max_depth || self.is_visited(&node.url) {
            return false;
        }
        let key = utils::visit_key(&node.url);
        if self
            .frontier
            .iter()
            .any(|queued| utils::visit_key(&queued.url) == key)
        {
            return false;
        }
        self.frontier.push_back(node);
        true
    }

    pub fn queued(&self) -> usize {
        self.frontier.len()
    }

    pub fn is_visited(&self, url: &Url) -> bool {
        self.visited_urls.contains(&utils::visit_key(url))
    }

    /// Returns `false` if the URL had already been visited.
    pub fn mark_visited(&mut self, url: &Url) -> bool {
        self.visited_urls.insert(utils::visit_key(url))
    }

    pub fn visited_count(&self) -> usize {
        self.visited_urls.len()
    }

    pub fn is_clicked(&self, signature: &str) -> bool {
        self.visited_signatures.contains(signature)
    }

    /// Returns `false` if the element had already been clicked.
    pub fn mark_clicked(&mut self, signature: String) -> bool {
        self.visited_signatures.insert(signature)
    }

    pub fn clicked_count(&self) -> usize {
        self.visited_signatures.len()
    }

    pub fn is_full(&self) -> bool {
        self.captures.len() >= self.budget
    }

    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.captures.len())
    }

    /// Appends `artifact` with the next order number. Ignored once the
    /// budget is used up.
    pub fn record(&mut self, mut artifact: CapturedArtifact) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let order = self.captures.len() + 1;
        artifact.order = order;
        self.progress.record(artifact.success);
        self.captures.push(artifact);
        Some(order)
    }

    pub fn captures(&self) -> &[CapturedArtifact] {
        &self.captures
    }

    pub fn into_captures(self) -> Vec<CapturedArtifact> {
        self.captures
    }
}
