//! Scripted in-memory [`JobService`] for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use super::types::{JobSnapshot, MessageRole, TranscriptMessage, Usage};
use super::{JobService, ServiceError};
use crate::model::{Citation, JobStatus, PartialOutput};

/// How a submitted job behaves, decided from (prompt, agent) at submit time.
#[derive(Debug, Clone)]
pub enum Reply {
    /// In progress until poll number `after`, then completed.
    Complete { after: u32, text: String },
    /// In progress until poll number `after`, then failed with `message`.
    Fail { after: u32, message: String },
    /// Never finishes; `text` is visible as partial output from the first poll.
    Hang { text: String },
    /// `submit_job` itself fails with this HTTP status.
    Reject { status: u16 },
    /// `submit_job` panics.
    Panic,
}

type Responder = dyn Fn(&str, &str) -> Reply + Send + Sync;

struct MockJob {
    reply: Reply,
    polls: u32,
    canceled: bool,
}

/// A message on a mock thread, tagged with the job that wrote it.
struct MockMessage {
    message: TranscriptMessage,
    run_id: Option<String>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    sessions: HashMap<String, Vec<MockMessage>>,
    dead: HashSet<String>,
    jobs: HashMap<String, MockJob>,
    poll_failures: u32,
    submit_failures: u32,
    created: u32,
    canceled: Vec<String>,
    submitted_prompts: Vec<String>,
}

pub struct MockJobService {
    responder: Box<Responder>,
    state: Mutex<MockState>,
}

impl MockJobService {
    pub fn new(responder: impl Fn(&str, &str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Every job completes on its first poll, echoing the prompt.
    pub fn echo() -> Self {
        Self::new(|prompt, _| Reply::Complete {
            after: 1,
            text: format!("Answer to: {prompt}"),
        })
    }

    /// The next `n` polls fail with a 503.
    pub fn with_poll_failures(self, n: u32) -> Self {
        self.lock().poll_failures = n;
        self
    }

    /// The next `n` submits fail with a 503.
    pub fn with_submit_failures(self, n: u32) -> Self {
        self.lock().submit_failures = n;
        self
    }

    /// Forgets a session as if it had expired on the service side.
    pub fn kill_session(&self, handle: &str) {
        self.lock().dead.insert(handle.to_string());
    }

    pub fn sessions_created(&self) -> u32 {
        self.lock().created
    }

    pub fn canceled_jobs(&self) -> Vec<String> {
        self.lock().canceled.clone()
    }

    pub fn submitted_prompts(&self) -> Vec<String> {
        self.lock().submitted_prompts.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking reply must not poison the service for sibling tasks.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockState {
    fn live_session(&mut self, handle: &str) -> Result<&mut Vec<MockMessage>, ServiceError> {
        if self.dead.contains(handle) {
            return Err(ServiceError::NotFound(format!("/threads/{handle}")));
        }
        self.sessions
            .get_mut(handle)
            .ok_or_else(|| ServiceError::NotFound(format!("/threads/{handle}")))
    }
}

fn status_of(job: &MockJob) -> (JobStatus, Option<String>) {
    if job.canceled {
        return (JobStatus::Canceled, None);
    }
    match &job.reply {
        Reply::Complete { after, .. } if job.polls >= *after => (JobStatus::Completed, None),
        Reply::Fail { after, message } if job.polls >= *after => {
            (JobStatus::Failed, Some(message.clone()))
        }
        _ if job.polls == 0 => (JobStatus::Queued, None),
        _ => (JobStatus::InProgress, None),
    }
}

fn text_of(job: &MockJob) -> &str {
    match &job.reply {
        Reply::Complete { text, .. } | Reply::Hang { text } => text,
        _ => "",
    }
}

fn citations_for(text: &str) -> Vec<Citation> {
    if text.contains("http") {
        vec![Citation {
            title: "Source".into(),
            url: "https://example.com/source".into(),
        }]
    } else {
        Vec::new()
    }
}

/// Writes the job's output onto the thread, replacing what it wrote before.
fn record_output(messages: &mut Vec<MockMessage>, job_id: &str, text: String) {
    if let Some(existing) = messages
        .iter_mut()
        .find(|m| m.run_id.as_deref() == Some(job_id))
    {
        existing.message.citations = citations_for(&text);
        existing.message.text = text;
        return;
    }
    let created_at = messages.len() as i64;
    messages.push(MockMessage {
        message: TranscriptMessage {
            role: MessageRole::Agent,
            citations: citations_for(&text),
            text,
            created_at,
        },
        run_id: Some(job_id.to_string()),
    });
}

impl JobService for MockJobService {
    async fn create_session(&self) -> Result<String, ServiceError> {
        let mut state = self.lock();
        state.next_id += 1;
        state.created += 1;
        let handle = format!("thread_{}", state.next_id);
        state.sessions.insert(handle.clone(), Vec::new());
        Ok(handle)
    }

    async fn post_message(&self, handle: &str, text: &str) -> Result<(), ServiceError> {
        let mut state = self.lock();
        let messages = state.live_session(handle)?;
        let created_at = messages.len() as i64;
        messages.push(MockMessage {
            message: TranscriptMessage {
                role: MessageRole::User,
                text: text.to_string(),
                citations: Vec::new(),
                created_at,
            },
            run_id: None,
        });
        Ok(())
    }

    async fn submit_job(&self, handle: &str, agent: &str) -> Result<JobSnapshot, ServiceError> {
        let mut state = self.lock();
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(ServiceError::Api {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        let prompt = state
            .live_session(handle)?
            .iter()
            .rev()
            .find(|m| m.message.role == MessageRole::User)
            .map(|m| m.message.text.clone())
            .unwrap_or_default();
        let reply = (self.responder)(&prompt, agent);
        match reply {
            Reply::Reject { status } => {
                return Err(ServiceError::Api {
                    status,
                    message: "rejected".into(),
                });
            }
            Reply::Panic => {
                drop(state);
                panic!("mock service panicked for agent {agent}");
            }
            _ => {}
        }
        state.submitted_prompts.push(prompt);
        state.next_id += 1;
        let id = format!("run_{}", state.next_id);
        state.jobs.insert(
            id.clone(),
            MockJob {
                reply,
                polls: 0,
                canceled: false,
            },
        );
        Ok(JobSnapshot {
            id,
            status: JobStatus::Queued,
            usage: None,
            last_error: None,
        })
    }

    async fn poll_job(&self, handle: &str, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        let mut state = self.lock();
        if state.poll_failures > 0 {
            state.poll_failures -= 1;
            return Err(ServiceError::Api {
                status: 503,
                message: "poll unavailable".into(),
            });
        }
        let (status, last_error, text) = {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| ServiceError::NotFound(job_id.to_string()))?;
            job.polls += 1;
            let (status, last_error) = status_of(job);
            (status, last_error, text_of(job).to_string())
        };

        // Running and finished jobs both leave their text on the thread.
        if !text.is_empty() && status != JobStatus::Canceled {
            record_output(state.live_session(handle)?, job_id, text);
        }

        let usage = (status == JobStatus::Completed).then_some(Usage {
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
        });
        Ok(JobSnapshot {
            id: job_id.to_string(),
            status,
            usage,
            last_error,
        })
    }

    async fn cancel_job(&self, _handle: &str, job_id: &str) -> Result<(), ServiceError> {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.canceled = true;
        }
        state.canceled.push(job_id.to_string());
        Ok(())
    }

    async fn get_latest_output(
        &self,
        handle: &str,
        job_id: &str,
    ) -> Result<PartialOutput, ServiceError> {
        let mut state = self.lock();
        let output = state
            .live_session(handle)?
            .iter()
            .rev()
            .find(|m| m.message.role == MessageRole::Agent && m.run_id.as_deref() == Some(job_id))
            .map(|m| PartialOutput {
                text: m.message.text.clone(),
                citations: m.message.citations.clone(),
            })
            .unwrap_or_default();
        Ok(output)
    }

    async fn list_messages(&self, handle: &str) -> Result<Vec<TranscriptMessage>, ServiceError> {
        let mut state = self.lock();
        Ok(state
            .live_session(handle)?
            .iter()
            .map(|m| m.message.clone())
            .collect())
    }

    async fn session_exists(&self, handle: &str) -> Result<bool, ServiceError> {
        let state = self.lock();
        Ok(state.sessions.contains_key(handle) && !state.dead.contains(handle))
    }
}
