//! Artifact records: metadata for one generated-and-executed work unit.
//!
//! Only references to code and output cross into the record; content lives in
//! the blob store.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an artifact.
///
/// `Pending → Executing → {Completed | Failed} → Consumed`. An artifact that
/// fails before submission may move `Pending → Failed` directly. No backward
/// transitions exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Consumed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Consumed => "consumed",
        }
    }

    pub fn can_transition_to(self, next: ArtifactStatus) -> bool {
        use ArtifactStatus::{Completed, Consumed, Executing, Failed, Pending};
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Completed, Consumed)
                | (Failed, Consumed)
        )
    }

    /// Execution has finished one way or the other.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Consumed)
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "consumed" => Ok(Self::Consumed),
            _ => Err(format!("Invalid artifact status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub session_id: String,
    pub iteration: u32,
    pub kind: String,
    pub instruction: String,
    pub code_ref: String,
    pub stdout_ref: Option<String>,
    pub stderr_ref: Option<String>,
    pub status: ArtifactStatus,
    /// Populated whenever the artifact ends up `Failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}
