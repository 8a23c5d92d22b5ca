//! Capabilities the matching core consumes from the rest of the system.
//!
//! Cases, frame records, notifications and raw uploads are owned elsewhere;
//! the core only sees these traits. `lookoutd` ships one local implementation
//! of each (see [`crate::cases`], [`crate::db`], [`crate::blob`]).

use chrono::{DateTime, Utc};
use lookout_core::CaseId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("connection lock poisoned")]
    LockPoisoned,
}

/// Account that reported a case and receives its notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub String);

impl FrameId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing state of an ingested frame: Received → Processing → Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameState {
    Received,
    Processing,
    Completed,
}

impl FrameState {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameState::Received => "received",
            FrameState::Processing => "processing",
            FrameState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(FrameState::Received),
            "processing" => Some(FrameState::Processing),
            "completed" => Some(FrameState::Completed),
            _ => None,
        }
    }
}

/// A camera frame submitted by a capture device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    /// Blob store path of the raw uploaded bytes.
    pub image_path: String,
    pub captured_at: DateTime<Utc>,
    pub state: FrameState,
    pub matched_case: Option<CaseId>,
}

impl Frame {
    pub fn processed(&self) -> bool {
        self.state == FrameState::Completed
    }
}

/// A detection to deliver to the reporter of the matched case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user: UserId,
    pub case_id: CaseId,
    pub image_path: String,
    pub detected_at: DateTime<Utc>,
    pub similarity: f32,
}

pub type CloseCallback = Box<dyn Fn(&CaseId) + Send + Sync>;

/// Source of case state.
pub trait CaseProvider: Send + Sync {
    fn active_case_ids(&self) -> Vec<CaseId>;
    fn is_active(&self, case_id: &CaseId) -> bool;
    fn reporter_of(&self, case_id: &CaseId) -> Option<UserId>;
    /// Register a callback fired once per ACTIVE → CLOSED transition.
    fn subscribe_to_close(&self, callback: CloseCallback);
}

/// Durable frame records.
pub trait FrameRepository: Send + Sync {
    fn insert(&self, frame: &Frame) -> Result<(), CollaboratorError>;
    fn get(&self, id: &FrameId) -> Result<Option<Frame>, CollaboratorError>;
    fn mark_processing(&self, id: &FrameId) -> Result<(), CollaboratorError>;
    /// Resolve a frame to Completed. A frame already completed is left untouched.
    fn complete(&self, id: &FrameId, matched_case: Option<&CaseId>) -> Result<(), CollaboratorError>;
    /// Frames a previous run left Received or Processing, oldest first.
    fn unfinished(&self) -> Result<Vec<FrameId>, CollaboratorError>;
}

pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: &Notification) -> Result<(), CollaboratorError>;
}
