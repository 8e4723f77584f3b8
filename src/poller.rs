//! Drives one submitted job to a terminal state.
//!
//! The poller sleeps one tick, fetches the job status and the latest agent
//! output, and repeats until the service reports a terminal status, the
//! timeout elapses (best-effort cancel), or polling keeps failing.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::extract::{extract_attributes, extract_citations};
use crate::model::{Job, JobStatus, Metrics, PartialOutput, ResultRecord, WorkItem};
use crate::service::{JobService, JobSnapshot, ServiceError, Usage};

/// Tunables for the poll loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Sleep between polls; one tick is one unit of elapsed time.
    pub tick: Duration,
    /// Consecutive failed polls tolerated before the job is marked `error`.
    pub max_poll_failures: u32,
    /// Log a heartbeat every this many ticks.
    pub heartbeat_every: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_poll_failures: 3,
            heartbeat_every: 10,
        }
    }
}

impl PollSettings {
    /// Number of ticks after which a job with this timeout is abandoned.
    pub fn ticks_for(&self, timeout: Duration) -> u64 {
        if self.tick.is_zero() {
            return timeout.as_secs();
        }
        let ticks = timeout.as_nanos().div_ceil(self.tick.as_nanos());
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    fn seconds(&self, ticks: u64) -> f64 {
        self.tick.as_secs_f64() * ticks as f64
    }
}

/// What the poll loop observed by the time the job settled.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub job: Job,
    pub output: PartialOutput,
    pub metrics: Metrics,
    pub error: Option<String>,
}

impl PollOutcome {
    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    /// Builds the persisted record, running extraction over the final text.
    pub fn into_record(self, work_item: WorkItem, role: Option<String>) -> ResultRecord {
        let extracted_attributes = extract_attributes(&self.output.text);
        let citations = extract_citations(&self.output.text);
        ResultRecord {
            work_item,
            role,
            status: self.job.status,
            error: self.error,
            metrics: self.metrics,
            response_text: self.output.text,
            extracted_attributes,
            citations,
            annotations: self.output.citations,
            completed_at: chrono::Utc::now(),
        }
    }
}

pub struct JobPoller<'a, S> {
    service: &'a S,
    settings: PollSettings,
}

impl<'a, S: JobService> JobPoller<'a, S> {
    pub fn new(service: &'a S, settings: PollSettings) -> Self {
        Self { service, settings }
    }

    /// Posts `prompt` on the session, submits a job for `agent` and polls it.
    ///
    /// `Err` only when the message or the submission is rejected; everything
    /// that happens after a job exists is reported through the outcome.
    pub async fn run(
        &self,
        handle: &str,
        agent: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<PollOutcome, ServiceError> {
        self.service.post_message(handle, prompt).await?;
        self.resubmit(handle, agent, timeout).await
    }

    /// Submits a new job for the last message already on the session.
    pub async fn resubmit(
        &self,
        handle: &str,
        agent: &str,
        timeout: Duration,
    ) -> Result<PollOutcome, ServiceError> {
        let snapshot = self.service.submit_job(handle, agent).await?;
        info!(job_id = %snapshot.id, handle, agent, "job submitted");
        Ok(self.poll_to_completion(handle, snapshot, timeout).await)
    }

    async fn fetch(
        &self,
        handle: &str,
        job_id: &str,
    ) -> Result<(JobSnapshot, PartialOutput), ServiceError> {
        let snapshot = self.service.poll_job(handle, job_id).await?;
        let output = self.service.get_latest_output(handle, job_id).await?;
        Ok((snapshot, output))
    }

    async fn poll_to_completion(
        &self,
        handle: &str,
        submitted: JobSnapshot,
        timeout: Duration,
    ) -> PollOutcome {
        let mut job = Job::new(submitted.id, handle.to_string(), submitted.status);
        let max_ticks = self.settings.ticks_for(timeout);
        let mut ticks = 0u64;
        let mut first_output_tick = None;
        let mut output = PartialOutput::default();
        let mut usage = submitted.usage.unwrap_or_default();
        let mut last_error = submitted.last_error;
        let mut consecutive_failures = 0u32;
        let mut poll_error = None;

        while !job.status.is_terminal() {
            sleep(self.settings.tick).await;
            ticks += 1;
            if self.settings.heartbeat_every > 0 && ticks % self.settings.heartbeat_every == 0 {
                info!(job_id = %job.id, elapsed = ticks, status = %job.status, "still processing");
            }

            match self.fetch(handle, &job.id).await {
                Ok((snapshot, latest)) => {
                    consecutive_failures = 0;
                    job.status = snapshot.status;
                    if let Some(reported) = snapshot.usage {
                        usage = max_usage(usage, reported);
                    }
                    if snapshot.last_error.is_some() {
                        last_error = snapshot.last_error;
                    }
                    if !latest.is_empty() {
                        if first_output_tick.is_none() {
                            debug!(job_id = %job.id, elapsed = ticks, "first output");
                            first_output_tick = Some(ticks);
                        }
                        output = latest;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(job_id = %job.id, attempt = consecutive_failures, error = %e, "poll failed");
                    if consecutive_failures > self.settings.max_poll_failures {
                        job.status = JobStatus::Error;
                        poll_error = Some(e.to_string());
                        break;
                    }
                }
            }

            if job.status.is_terminal() {
                break;
            }
            if ticks >= max_ticks {
                warn!(job_id = %job.id, timeout_secs = timeout.as_secs(), "timed out, cancelling");
                if let Err(e) = self.service.cancel_job(handle, &job.id).await {
                    warn!(job_id = %job.id, error = %e, "cancel failed");
                }
                output.mark_timed_out(timeout);
                job.status = JobStatus::TimedOut;
            }
        }

        // A job can settle on submit, before the first poll.
        if job.status == JobStatus::Completed && output.is_empty() {
            match self.service.get_latest_output(handle, &job.id).await {
                Ok(latest) => output = latest,
                Err(e) => warn!(job_id = %job.id, error = %e, "could not fetch final output"),
            }
        }

        let error = match job.status {
            JobStatus::Failed => Some(last_error.unwrap_or_else(|| "job failed".to_string())),
            JobStatus::Error => poll_error,
            _ => None,
        };
        let metrics = Metrics {
            time_to_first_output: first_output_tick.map(|t| self.settings.seconds(t)),
            total_time: self.settings.seconds(ticks),
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            total_tokens: usage.total(),
        };
        info!(job_id = %job.id, status = %job.status, elapsed = ticks, "job settled");

        PollOutcome {
            job,
            output,
            metrics,
            error,
        }
    }
}

fn max_usage(a: Usage, b: Usage) -> Usage {
    Usage {
        prompt_tokens: a.prompt_tokens.max(b.prompt_tokens),
        completion_tokens: a.completion_tokens.max(b.completion_tokens),
        total_tokens: a.total_tokens.max(b.total_tokens),
    }
}
