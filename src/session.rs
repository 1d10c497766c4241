//! Client-visible session records
//!
//! A [`Session`] is the pollable projection of one capture job. It starts
//! `processing` and moves exactly once to `completed` or `failed`.

use crate::{CaptureError, CaptureMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Only `processing -> completed` and `processing -> failed` are allowed.
    /// Re-asserting the current status is a no-op, not a transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        self == next || matches!((self, next), (SessionStatus::Processing, _))
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(SessionStatus::Processing),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(CaptureError::Serialization(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

/// One artifact as reported to clients; image bytes are replaced by the
/// archive filename and an inline thumbnail.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub order: usize,
    pub url: String,
    pub title: String,
    /// Name inside the archive; absent for failed artifacts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// `data:image/png;base64,...`
    pub thumbnail: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering_element: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSummary {
    pub base_url: String,
    pub mode: CaptureMode,
    pub total_pages: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub archive_size: usize,
    pub artifacts: Vec<ArtifactSummary>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CaptureSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn processing(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Processing,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Applies `update`, rejecting any status change that would move the
    /// session backwards.
    pub fn apply(&mut self, update: SessionUpdate) -> Result<(), CaptureError> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(CaptureError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            if next.is_terminal() && self.finished_at.is_none() {
                self.finished_at = Some(Utc::now());
            }
            self.status = next;
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub result: Option<CaptureSummary>,
    pub error: Option<String>,
}

impl SessionUpdate {
    pub fn completed(result: CaptureSummary) -> Self {
        Self {
            status: Some(SessionStatus::Completed),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(SessionStatus::Failed),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Row shape of the durable store: `{id, status, result(json)?, error?,
/// created_at, updated_at, finished_at?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<&Session> for SessionRecord {
    type Error = CaptureError;

    fn try_from(session: &Session) -> Result<Self, Self::Error> {
        let result = session
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        Ok(Self {
            id: session.session_id.clone(),
            status: session.status.to_string(),
            result,
            error: session.error.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            finished_at: session.finished_at,
        })
    }
}

impl TryFrom<SessionRecord> for Session {
    type Error = CaptureError;

    fn try_from(record: SessionRecord) -> Result<Self, Self::Error> {
        let result = record
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Self {
            session_id: record.id,
            status: record.status.parse()?,
            result,
            error: record.error,
            created_at: record.created_at,
            updated_at: record.updated_at,
            finished_at: record.finished_at,
        })
    }
}
