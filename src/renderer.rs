//! Rendering engine boundary
//!
//! The pool, capture unit and traversal strategies only ever talk to these
//! traits. [`crate::chrome`] implements them with chromiumoxide; tests use a
//! scripted in-memory site.

use crate::{BrowserKind, CaptureError, Viewport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One running renderer process.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Opens a fresh blank page sized to `viewport`.
    async fn new_page(&self, viewport: &Viewport) -> Result<Box<dyn PageHandle>, CaptureError>;

    /// Terminates the process. Errors are reported but the instance must be
    /// considered gone either way.
    async fn close(&self) -> Result<(), CaptureError>;

    fn is_alive(&self) -> bool;
}

/// One open page (tab) inside a [`Browser`].
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), CaptureError>;

    async fn title(&self) -> Result<String, CaptureError>;

    /// URL after redirects and client-side navigation.
    async fn current_url(&self) -> Result<String, CaptureError>;

    /// Full-page PNG.
    async fn screenshot(&self) -> Result<Vec<u8>, CaptureError>;

    /// Raw `href` values of every anchor on the page, unresolved.
    async fn extract_links(&self) -> Result<Vec<String>, CaptureError>;

    async fn clickable_elements(
        &self,
        query: &ElementQuery,
    ) -> Result<Vec<ClickableElement>, CaptureError>;

    async fn click(&self, selector: &str) -> Result<(), CaptureError>;

    async fn close(self: Box<Self>) -> Result<(), CaptureError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Starts a new renderer process. `id` is unique for the pool's lifetime.
    async fn launch(&self, id: usize, kind: BrowserKind) -> Result<Arc<dyn Browser>, CaptureError>;
}

/// Candidate filter handed to the renderer.
#[derive(Debug, Clone, Default)]
pub struct ElementQuery {
    /// When non-empty only elements matching one of these are returned
    pub include: Vec<String>,
    /// Elements matching, or nested inside, any of these are dropped
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Link,
    Button,
    Other,
}

impl ElementKind {
    /// Lower ranks are clicked first.
    pub fn rank(self) -> u8 {
        match self {
            ElementKind::Link => 0,
            ElementKind::Button => 1,
            ElementKind::Other => 2,
        }
    }
}

/// An element that can be clicked, as reported by the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClickableElement {
    pub tag: String,
    /// Selector that uniquely addresses the element on its page
    pub selector: String,
    /// Visible text, whitespace-collapsed
    pub text: String,
    pub kind: ElementKind,
    #[serde(default)]
    pub href: Option<String>,
}

impl ClickableElement {
    /// Human label used in artifact metadata.
    pub fn describe(&self) -> String {
        if self.text.is_empty() {
            format!("{} {}", self.tag, self.selector)
        } else {
            format!("{} \"{}\"", self.tag, self.text)
        }
    }
}
