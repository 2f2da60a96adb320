//! Durable job records, locks, and checkpoints.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Import,
    Delete,
}

impl JobType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    NotStarted,
    Running,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::PartiallySucceeded | Self::Failed | Self::Cancelled
        )
    }

    /// Whether the transition `self -> next` is legal. Transitions are
    /// monotone: `NotStarted -> Running -> terminal`, and terminal states
    /// are final. A state may always be re-asserted.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::NotStarted => matches!(next, Self::NotStarted | Self::Running | Self::Cancelled),
            Self::Running => !matches!(next, Self::NotStarted),
            Self::Succeeded => matches!(next, Self::Succeeded),
            Self::PartiallySucceeded => matches!(next, Self::PartiallySucceeded),
            Self::Failed => matches!(next, Self::Failed),
            Self::Cancelled => matches!(next, Self::Cancelled),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::PartiallySucceeded => "PartiallySucceeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Counters reported on every job record. Monotone while the job runs.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    pub models_created: u64,
    pub models_deleted: u64,
    pub twins_created: u64,
    pub twins_deleted: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_action_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub purge_at: Option<OffsetDateTime>,
    #[serde(flatten)]
    pub counters: JobCounters,
    /// Opaque configuration captured at submission.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub options: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A lock row as reported by the store. Expiry is evaluated by the store's
/// clock, never computed locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLockInfo {
    pub job_id: String,
    pub owner_instance_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub acquired_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub heartbeat_at: OffsetDateTime,
    pub ttl_seconds: u64,
    pub is_expired: bool,
}

/// Bulk-delete phases, in execution order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteSection {
    Relationships,
    Twins,
    Models,
    Completed,
}

/// Durable progress of a bulk-delete job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCheckpoint {
    pub job_id: String,
    pub current_section: DeleteSection,
    pub relationships_completed: bool,
    pub twins_completed: bool,
    pub models_completed: bool,
    pub relationships_deleted: u64,
    pub twins_deleted: u64,
    pub models_deleted: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl DeleteCheckpoint {
    #[must_use]
    pub fn new(job_id: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            job_id: job_id.into(),
            current_section: DeleteSection::Relationships,
            relationships_completed: false,
            twins_completed: false,
            models_completed: false,
            relationships_deleted: 0,
            twins_deleted: 0,
            models_deleted: 0,
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportOptions {
    pub continue_on_failure: bool,
    /// Per-record operation timeout.
    #[serde(with = "duration_seconds")]
    pub operation_timeout: Duration,
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            continue_on_failure: false,
            operation_timeout: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

mod duration_seconds {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
