//! Breadth-first traversal driver
//!
//! Both capture modes run through [`traverse`]. A [`FrontierStrategy`] decides
//! what entering a node means, which candidates a loaded page offers, and what
//! visiting one produces; the driver owns dedup, budget and seed-failure
//! policy.

use crate::frontier::{CaptureJob, FrontierNode};
use crate::renderer::{ClickableElement, PageHandle};
use crate::{CaptureError, CapturedArtifact};
use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

/// Something reachable from a loaded page.
#[derive(Debug, Clone)]
pub enum Candidate {
    Link(Url),
    Element(ClickableElement),
}

/// Outcome of opening a frontier node.
#[derive(Debug)]
pub enum Entered {
    /// The page is loaded; `Some` when the strategy captures the node itself.
    Loaded(Option<CapturedArtifact>),
    /// The node could not be opened or captured. Never expanded.
    Failed {
        artifact: Option<CapturedArtifact>,
        /// Client-safe reason
        reason: String,
    },
}

/// Outcome of visiting one candidate.
#[derive(Debug, Default)]
pub struct Visit {
    pub artifact: Option<CapturedArtifact>,
    pub discovered: Option<FrontierNode>,
}

#[async_trait]
pub trait FrontierStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn enter(
        &self,
        page: &dyn PageHandle,
        job: &mut CaptureJob,
        node: &FrontierNode,
    ) -> Entered;

    /// Candidates offered by the loaded `node`, in visiting order.
    async fn next_candidates(
        &self,
        page: &dyn PageHandle,
        job: &CaptureJob,
        node: &FrontierNode,
    ) -> Vec<Candidate>;

    async fn visit(
        &self,
        page: &dyn PageHandle,
        job: &mut CaptureJob,
        node: &FrontierNode,
        candidate: Candidate,
    ) -> Visit;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalReport {
    pub nodes_entered: usize,
    pub candidates_visited: usize,
    pub captured: usize,
    pub failed: usize,
}

/// Runs `strategy` over `job` until the frontier is empty or the capture
/// budget is spent.
///
/// A seed page that cannot be captured fails the whole traversal with
/// [`CaptureError::SeedPageFailed`] and records nothing. Later failures are
/// recorded as failed artifacts and traversal continues. `heartbeat` is
/// called after every page operation.
pub async fn traverse(
    strategy: &dyn FrontierStrategy,
    page: &dyn PageHandle,
    job: &mut CaptureJob,
    heartbeat: &(dyn Fn() + Send + Sync),
) -> Result<TraversalReport, CaptureError> {
    let mut report = TraversalReport::default();
    let mut seeded = false;

    while let Some(node) = job.pop() {
        if job.is_full() {
            break;
        }
        if !job.mark_visited(&node.url) {
            continue;
        }

        let entered = strategy.enter(page, job, &node).await;
        heartbeat();
        report.nodes_entered += 1;

        let is_seed = !seeded;
        seeded = true;

        match entered {
            Entered::Loaded(artifact) => {
                if let Some(artifact) = artifact {
                    report.captured += 1;
                    job.record(artifact);
                }
            }
            Entered::Failed { artifact, reason } => {
                if is_seed {
                    return Err(CaptureError::SeedPageFailed(reason));
                }
                debug!("Not expanding {}: {}", node.url, reason);
                if let Some(artifact) = artifact {
                    report.failed += 1;
                    job.record(artifact);
                }
                continue;
            }
        }

        if job.is_full() {
            break;
        }

        let candidates = strategy.next_candidates(page, job, &node).await;
        debug!(
            "{} at depth {} offers {} candidate(s)",
            node.url,
            node.depth,
            candidates.len()
        );

        for candidate in candidates {
            if job.is_full() {
                break;
            }
            let visit = strategy.visit(page, job, &node, candidate).await;
            heartbeat();
            report.candidates_visited += 1;

            if let Some(artifact) = visit.artifact {
                if artifact.success {
                    report.captured += 1;
                } else {
                    report.failed += 1;
                }
                job.record(artifact);
            }
            if let Some(next) = visit.discovered {
                job.push(next);
            }
        }
    }

    info!(
        "{} traversal of {} finished: {} node(s), {} candidate(s), {} captured, {} failed",
        strategy.name(),
        job.base_url,
        report.nodes_entered,
        report.candidates_visited,
        report.captured,
        report.failed
    );
    Ok(report)
}
