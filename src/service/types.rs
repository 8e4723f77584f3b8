//! Wire types for the threads/messages/runs REST API and the
//! service-neutral views handed to the rest of the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Citation, JobStatus, PartialOutput};

/// Body of `POST /threads/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub role: String,
    pub content: String,
}

/// Body of `POST /threads/{id}/runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub assistant_id: String,
}

/// A thread (conversation) object. Only the id matters here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
}

/// Run status as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
    Incomplete,
    #[serde(other)]
    Unknown,
}

impl From<RunStatus> for JobStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Queued => JobStatus::Queued,
            // Still running from our point of view until the service settles it.
            RunStatus::InProgress | RunStatus::RequiresAction | RunStatus::Cancelling => {
                JobStatus::InProgress
            }
            RunStatus::Cancelled => JobStatus::Canceled,
            RunStatus::Completed => JobStatus::Completed,
            RunStatus::Expired => JobStatus::TimedOut,
            RunStatus::Failed | RunStatus::Incomplete | RunStatus::Unknown => JobStatus::Failed,
        }
    }
}

/// Token usage reported on a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Total tokens, falling back to the sum when the service omits it.
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

/// Error details attached to a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code.is_empty(), self.message.is_empty()) {
            (true, _) => f.write_str(&self.message),
            (false, true) => f.write_str(&self.code),
            (false, false) => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// A run object as returned by the create/get/cancel endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

/// A message on a thread. Content is a list of typed blocks; only text
/// blocks carry anything we read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub role: String,
    /// The run that wrote the message; absent on user messages.
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<TextContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    pub value: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub annotation_type: String,
    #[serde(default)]
    pub url_citation: Option<UrlCitation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlCitation {
    #[serde(default)]
    pub title: String,
    pub url: String,
}

/// Body of `GET /threads/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageList {
    pub data: Vec<ThreadMessage>,
}

impl ThreadMessage {
    pub fn is_agent(&self) -> bool {
        self.role == "assistant" || self.role == "agent"
    }

    pub fn written_by(&self, run_id: &str) -> bool {
        self.is_agent() && self.run_id.as_deref() == Some(run_id)
    }

    /// Text blocks joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.text.as_ref())
            .map(|text| text.value.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// URL citation annotations across all text blocks.
    pub fn citations(&self) -> Vec<Citation> {
        self.content
            .iter()
            .filter_map(|block| block.text.as_ref())
            .flat_map(|text| text.annotations.iter())
            .filter_map(|ann| ann.url_citation.as_ref())
            .map(|c| Citation {
                title: c.title.clone(),
                url: c.url.clone(),
            })
            .collect()
    }
}

/// Status view of a job as seen on one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub usage: Option<Usage>,
    pub last_error: Option<String>,
}

impl From<Run> for JobSnapshot {
    fn from(run: Run) -> Self {
        Self {
            id: run.id,
            status: run.status.into(),
            usage: run.usage,
            last_error: run.last_error.map(|e| e.to_string()),
        }
    }
}

/// Who authored a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
}

/// One message of a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: MessageRole,
    pub text: String,
    pub citations: Vec<Citation>,
    pub created_at: i64,
}

impl From<&ThreadMessage> for TranscriptMessage {
    fn from(message: &ThreadMessage) -> Self {
        Self {
            role: if message.is_agent() {
                MessageRole::Agent
            } else {
                MessageRole::User
            },
            text: message.text(),
            citations: message.citations(),
            created_at: message.created_at,
        }
    }
}

impl From<&ThreadMessage> for PartialOutput {
    fn from(message: &ThreadMessage) -> Self {
        Self {
            text: message.text(),
            citations: message.citations(),
        }
    }
}
