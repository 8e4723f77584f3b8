use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::ServiceError;

/// Lifecycle status of a research job, plus the item-level `error` status
/// used when no job outcome could be obtained at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Canceled,
    TimedOut,
    Error,
}

impl JobStatus {
    /// A job is terminal once its status leaves {queued, in_progress}.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// A job submitted on a conversation handle. Only poll responses mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub session_handle: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: String, session_handle: String, status: JobStatus) -> Self {
        Self {
            id,
            session_handle,
            status,
            submitted_at: Utc::now(),
        }
    }
}

/// Retry behavior for service calls made before a job exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// delay = base_delay_ms * 2^(attempt - 1), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Whether `err` on the given (1-based) failed attempt warrants another try.
    pub fn should_retry(&self, attempt: u32, err: &ServiceError) -> bool {
        attempt <= self.max_retries && (err.is_retryable() || err.is_session_invalid())
    }

    /// The delay to wait before retrying, honoring a server-provided hint.
    pub fn backoff(&self, attempt: u32, err: &ServiceError) -> Duration {
        match err {
            ServiceError::RateLimited { retry_after_ms } => {
                Duration::from_millis(*retry_after_ms).max(self.delay_for_attempt(attempt))
            }
            _ => self.delay_for_attempt(attempt),
        }
    }
}
