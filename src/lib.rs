//! # Page Capture
//!
//! Captures sequences of rendered web pages. Given a starting URL, a job
//! borrows a headless Chrome instance from a bounded pool, walks the site
//! either by following same-origin links or by clicking interactive elements,
//! screenshots every page state it reaches, and packages the results into a
//! zip archive. Clients submit jobs over HTTP and poll a session until it is
//! `completed` or `failed`, then download the archive.
//!
//! ## Architecture
//!
//! | Layer | Modules |
//! |-------|---------|
//! | Rendering boundary | [`renderer`], [`chrome`] |
//! | Resources | [`browser_pool`], [`retry`] |
//! | Capture | [`capture`], [`thumbnail`] |
//! | Traversal | [`frontier`], [`traversal`], [`link_crawl`], [`explorer`] |
//! | Results | [`session`], [`store`], [`packaging`] |
//! | Orchestration | [`service`] |
//! | Surfaces | [`server`], [`cli`], [`health`], [`metrics`] |
//!
//! ## Capture modes
//!
//! - **Links**: breadth-first over same-origin links, bounded by `maxDepth`
//!   and `maxPages`. Every URL is visited at most once per job.
//! - **Interactive**: captures the seed page, then clicks candidates in
//!   priority order (links, buttons, others; shorter text first) up to
//!   `maxElements`. An element is never clicked twice in a job, even after
//!   navigating back to the page that offered it.
//!
//! A seed page that cannot be captured fails the job. Any later page or click
//! failure becomes a failed artifact and the job carries on.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_capture::{CaptureRequest, CaptureService, Config, Metrics};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Arc::new(CaptureService::from_config(
//!         Config::default(),
//!         Arc::new(Metrics::new()),
//!     )?);
//!
//!     let session = service
//!         .submit(CaptureRequest {
//!             url: "https://example.com".to_string(),
//!             options: None,
//!         })
//!         .await?;
//!     let finished = service.wait(&session.session_id).await?;
//!     println!("{}: {:?}", finished.session_id, finished.status);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-capture serve --bind 0.0.0.0:8080
//! page-capture capture --url https://example.com --mode interactive --max-elements 5
//! page-capture validate --config capture.json
//! ```

/// Configuration, request options and Chrome launch settings
pub mod config;

/// Error types and error classification
pub mod error;

/// Retry policy and backoff combinator
pub mod retry;

/// Rendering engine traits
pub mod renderer;

/// chromiumoxide implementation of the rendering traits
pub mod chrome;

/// Bounded pool of browser instances
pub mod browser_pool;

/// Thumbnail generation
pub mod thumbnail;

/// Single page capture with retry and settle
pub mod capture;

/// Job-local traversal state
pub mod frontier;

/// Breadth-first traversal driver
pub mod traversal;

/// Link-following strategy
pub mod link_crawl;

/// Interactive exploration strategy
pub mod explorer;

/// Client-visible session records
pub mod session;

/// Session store
pub mod store;

/// Archive packaging
pub mod packaging;

/// Capture job orchestration
pub mod service;

/// HTTP API
pub mod server;

/// Performance metrics collection
pub mod metrics;

/// Health reporting
pub mod health;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use crate::metrics::*;
pub use browser_pool::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use retry::*;
pub use service::*;
pub use session::*;
pub use utils::*;
