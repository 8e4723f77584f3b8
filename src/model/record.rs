use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// One prompt to research, with optional product context
/// (UPC, short description, ...). Identity is its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, String>>,
}

impl WorkItem {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
        }
    }

    pub fn with_context(prompt: impl Into<String>, context: BTreeMap<String, String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: Some(context),
        }
    }

    /// Short single-line label used in logs and report headings.
    pub fn label(&self, max_chars: usize) -> String {
        let flat = self.prompt.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() <= max_chars {
            flat
        } else {
            let cut: String = flat.chars().take(max_chars).collect();
            format!("{cut}...")
        }
    }
}

/// A source annotation reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
}

/// Latest snapshot of a job's output; replaced on every successful poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialOutput {
    pub text: String,
    pub citations: Vec<Citation>,
}

impl PartialOutput {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Marks the output as cut short by a timeout, keeping what was captured.
    pub fn mark_timed_out(&mut self, timeout: Duration) {
        let secs = seconds_label(timeout);
        if self.is_empty() {
            self.text = format!(
                "Research timed out after {secs} seconds before any output was produced. \
                 Try a more specific question or a longer timeout."
            );
        } else {
            self.text.push_str(&format!(
                "\n\n[Note: this response may be incomplete; research timed out after {secs} seconds.]"
            ));
        }
    }
}

/// Whole seconds print bare; anything finer keeps millisecond precision.
fn seconds_label(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{:.3}", d.as_secs_f64())
    }
}

/// Timing and token usage for one job, or aggregated over a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Seconds until the first non-empty output was observed.
    pub time_to_first_output: Option<f64>,
    pub total_time: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_tokens: u64,
}

impl Metrics {
    pub fn elapsed(elapsed: Duration) -> Self {
        Self {
            total_time: elapsed.as_secs_f64(),
            ..Self::default()
        }
    }
}

/// The persisted outcome of one (role, work item) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub work_item: WorkItem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub metrics: Metrics,
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub extracted_attributes: Vec<String>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<Citation>,
    pub completed_at: DateTime<Utc>,
}

impl ResultRecord {
    /// A record for an item that never produced a job outcome.
    pub fn failed(
        work_item: WorkItem,
        role: Option<String>,
        error: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            work_item,
            role,
            status: JobStatus::Error,
            error: Some(error.into()),
            metrics: Metrics::elapsed(elapsed),
            response_text: String::new(),
            extracted_attributes: Vec::new(),
            citations: Vec::new(),
            annotations: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
