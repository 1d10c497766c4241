use std::time::Duration;
use thiserror::Error;

use crate::SessionStatus;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Browser pool exhausted: all {max} instances are in use")]
    PoolExhausted { max: usize },

    #[error("Browser pool is shutting down")]
    ShuttingDown,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation {
        url: String,
        reason: String,
        transient: bool,
    },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailure(String),

    #[error("Interaction with {element} failed: {reason}")]
    ElementInteraction { element: String, reason: String },

    #[error("Packaging failed: {0}")]
    PackagingFailure(String),

    #[error("Session store write failed: {0}")]
    StoreWriteFailure(String),

    #[error("Session store read failed: {0}")]
    StoreReadFailure(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid capture options: {0}")]
    InvalidOptions(String),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Archive not ready: session is {0}")]
    ArchiveNotReady(SessionStatus),

    #[error("Archive for session {0} is no longer available")]
    ArchiveMissing(String),

    #[error("Seed page could not be captured: {0}")]
    SeedPageFailed(String),

    #[error("Capture cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Fragments of renderer error text that indicate a network-level hiccup
/// worth another navigation attempt.
const TRANSIENT_MARKERS: &[&str] = &[
    "err_name_not_resolved",
    "err_name_resolution_failed",
    "err_connection_reset",
    "err_connection_refused",
    "err_connection_closed",
    "err_connection_timed_out",
    "err_timed_out",
    "err_network_changed",
    "err_internet_disconnected",
    "err_address_unreachable",
    "timeout",
    "timed out",
    "dns",
    "connection reset",
];

impl CaptureError {
    /// Builds a navigation error, classifying the renderer message as
    /// transient (DNS, timeout, connection reset) or permanent.
    pub fn navigation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let lowered = reason.to_lowercase();
        let transient = TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m));
        CaptureError::Navigation {
            url: url.into(),
            reason,
            transient,
        }
    }

    /// Click or script failure on `element`; `reason` is renderer detail
    /// that stays in logs.
    pub fn interaction(element: impl Into<String>, reason: impl Into<String>) -> Self {
        CaptureError::ElementInteraction {
            element: element.into(),
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::Navigation { transient, .. } => *transient,
            CaptureError::Timeout(_) | CaptureError::StoreWriteFailure(_) => true,
            _ => false,
        }
    }

    /// Text safe to show to API clients. Internal details such as renderer
    /// stack output never leave the process.
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::PoolExhausted { .. } => {
                "No browser is available right now, please retry shortly".to_string()
            }
            CaptureError::ShuttingDown => "The capture service is shutting down".to_string(),
            CaptureError::BrowserLaunchFailed(_) => "Could not start a browser".to_string(),
            CaptureError::Navigation { url, transient, .. } => {
                if *transient {
                    format!("Could not reach {url}")
                } else {
                    format!("Could not load {url}")
                }
            }
            CaptureError::Timeout(d) => format!("Timed out after {}s", d.as_secs()),
            CaptureError::CaptureFailure(_) => "Screenshot could not be taken".to_string(),
            CaptureError::ElementInteraction { element, .. } => {
                format!("Could not interact with {element}")
            }
            CaptureError::PackagingFailure(_) => "Failed to build the capture archive".to_string(),
            CaptureError::SeedPageFailed(reason) => {
                format!("The starting page could not be captured: {reason}")
            }
            CaptureError::Cancelled => "Capture cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for CaptureError {
    fn from(err: zip::result::ZipError) -> Self {
        CaptureError::PackagingFailure(err.to_string())
    }
}

impl From<rusqlite::Error> for CaptureError {
    fn from(err: rusqlite::Error) -> Self {
        CaptureError::StoreWriteFailure(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CaptureError {
    fn from(err: tokio::task::JoinError) -> Self {
        CaptureError::Io(format!("background task failed: {err}"))
    }
}
