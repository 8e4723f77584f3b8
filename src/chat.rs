//! Single-shot questions on a conversation kept under a caller-chosen key.
//!
//! The session store maps each key to a service session handle, so a key
//! keeps its conversation across process restarts until it is reset.

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{ResultRecord, RetryPolicy, WorkItem};
use crate::poller::{JobPoller, PollSettings};
use crate::service::{JobService, ServiceError, TranscriptMessage};
use crate::session_store::{SessionBackend, SessionStore};

pub struct KeyedChat<'a, S, B> {
    service: &'a S,
    store: &'a SessionStore<B>,
    agent: String,
    poll: PollSettings,
    retry: RetryPolicy,
}

impl<'a, S: JobService, B: SessionBackend> KeyedChat<'a, S, B> {
    pub fn new(
        service: &'a S,
        store: &'a SessionStore<B>,
        agent: impl Into<String>,
        poll: PollSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            store,
            agent: agent.into(),
            poll,
            retry,
        }
    }

    /// Asks `text` on the session stored under `key`.
    ///
    /// Never fails: errors that outlast the retry policy come back as an
    /// `error` record.
    pub async fn ask(&self, key: &str, text: &str, timeout: Duration) -> ResultRecord {
        let started = Instant::now();
        let item = WorkItem::new(text);
        let poller = JobPoller::new(self.service, self.poll.clone());
        // Handle the message was already posted on, so a retry only resubmits.
        let mut posted_on: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            let result = match self.store.get_or_create(self.service, key).await {
                Ok(handle) if posted_on.as_deref() == Some(handle.as_str()) => {
                    poller.resubmit(&handle, &self.agent, timeout).await
                }
                Ok(handle) => {
                    match self.service.post_message(&handle, text).await {
                        Ok(()) => {
                            posted_on = Some(handle.clone());
                            poller.resubmit(&handle, &self.agent, timeout).await
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(outcome) => {
                    info!(key, status = %outcome.status(), "chat answered");
                    return outcome.into_record(item, None);
                }
                Err(e) => e,
            };

            if err.is_session_invalid() {
                self.store.invalidate(key);
                posted_on = None;
            }
            attempt += 1;
            if !self.retry.should_retry(attempt, &err) {
                warn!(key, attempt, error = %err, "chat failed");
                return ResultRecord::failed(item, None, err.to_string(), started.elapsed());
            }
            let delay = self.retry.backoff(attempt, &err);
            warn!(key, attempt, delay_ms = delay.as_millis() as u64, error = %err, "chat attempt failed, retrying");
            sleep(delay).await;
        }
    }

    /// Messages of the session stored under `key`, oldest first.
    ///
    /// A key without a session, or whose session the service no longer
    /// knows, has an empty history; the stale entry is dropped.
    pub async fn history(&self, key: &str) -> Result<Vec<TranscriptMessage>> {
        let Some(handle) = self.store.get(key) else {
            return Ok(Vec::new());
        };
        match self.service.list_messages(&handle).await {
            Ok(messages) => Ok(messages),
            Err(ServiceError::NotFound(_)) => {
                warn!(key, handle = %handle, "session no longer exists");
                self.store.invalidate(key);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forgets the session under `key` and starts a fresh one.
    pub async fn reset(&self, key: &str) -> Result<String> {
        if let Some(old) = self.store.invalidate(key) {
            info!(key, handle = %old, "session reset");
        }
        Ok(self.store.get_or_create(self.service, key).await?)
    }
}
