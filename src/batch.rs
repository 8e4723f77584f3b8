//! Sequential, resumable processing of one role's work items.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointFile, pending_items};
use crate::error::Result;
use crate::model::{ResultRecord, RetryPolicy, RoleContext, WorkItem};
use crate::poller::{JobPoller, PollOutcome, PollSettings};
use crate::report::ReportWriter;
use crate::service::{JobService, ServiceError};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Per-item job timeout.
    pub timeout: Duration,
    /// Skip items already present in the checkpoint.
    pub resume: bool,
    pub retry: RetryPolicy,
    pub poll: PollSettings,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            resume: false,
            retry: RetryPolicy::default(),
            poll: PollSettings::default(),
        }
    }
}

/// Running counters, logged after every item.
struct Progress {
    started: Instant,
    total: usize,
    skipped: usize,
    succeeded: usize,
    failed: usize,
}

impl Progress {
    fn new(total: usize, skipped: usize) -> Self {
        Self {
            started: Instant::now(),
            total,
            skipped,
            succeeded: 0,
            failed: 0,
        }
    }

    fn record(&mut self, record: &ResultRecord) {
        if record.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    fn log(&self, role: &str) {
        let processed = self.succeeded + self.failed;
        let done = self.skipped + processed;
        let elapsed = self.started.elapsed().as_secs_f64();
        let remaining = self.total.saturating_sub(done);
        let eta = if processed == 0 {
            0.0
        } else {
            elapsed / processed as f64 * remaining as f64
        };
        let percent = done as f64 / self.total.max(1) as f64 * 100.0;
        info!(
            role,
            done,
            total = self.total,
            succeeded = self.succeeded,
            failed = self.failed,
            "progress {percent:.1}%, elapsed {elapsed:.1}s, eta {eta:.1}s"
        );
    }
}

/// Runs `prompt` for `item` until the job settles, retrying retryable
/// errors with backoff. Every try gets a fresh session, so sessions are never
/// shared between items or attempts. Errors end up in the returned record.
pub(crate) async fn run_on_fresh_session<S: JobService>(
    service: &S,
    settings: &BatchSettings,
    agent: &str,
    prompt: &str,
    item: &WorkItem,
    role: &str,
) -> ResultRecord {
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        match try_once(service, settings, agent, prompt).await {
            Ok(outcome) => return outcome.into_record(item.clone(), Some(role.to_string())),
            Err(err) => {
                attempt += 1;
                if !settings.retry.should_retry(attempt, &err) {
                    error!(role, prompt = %item.label(80), error = %err, "item failed");
                    return ResultRecord::failed(
                        item.clone(),
                        Some(role.to_string()),
                        err.to_string(),
                        started.elapsed(),
                    );
                }
                let delay = settings.retry.backoff(attempt, &err);
                warn!(
                    role,
                    attempt,
                    max = settings.retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying item"
                );
                sleep(delay).await;
            }
        }
    }
}

async fn try_once<S: JobService>(
    service: &S,
    settings: &BatchSettings,
    agent: &str,
    prompt: &str,
) -> std::result::Result<PollOutcome, ServiceError> {
    let handle = service.create_session().await?;
    JobPoller::new(service, settings.poll.clone())
        .run(&handle, agent, prompt, settings.timeout)
        .await
}

pub struct BatchDriver<S> {
    service: Arc<S>,
    settings: BatchSettings,
    reports: ReportWriter,
}

impl<S: JobService> BatchDriver<S> {
    pub fn new(service: Arc<S>, settings: BatchSettings, reports: ReportWriter) -> Self {
        Self {
            service,
            settings,
            reports,
        }
    }

    /// Runs every pending item in input order and returns all records for
    /// the role, including those loaded from the checkpoint.
    ///
    /// Item failures become `error` records; only checkpoint I/O aborts.
    pub async fn run(
        &self,
        items: &[WorkItem],
        role: &RoleContext,
        checkpoint: &CheckpointFile,
    ) -> Result<Vec<ResultRecord>> {
        let mut results = if self.settings.resume {
            checkpoint.load()?
        } else {
            Vec::new()
        };
        let pending = pending_items(items, &results);
        info!(
            role = %role.name,
            total = items.len(),
            already_done = results.len(),
            pending = pending.len(),
            "starting batch"
        );

        let mut progress = Progress::new(items.len(), items.len() - pending.len());
        for (index, item) in pending {
            info!(role = %role.name, item = index + 1, prompt = %item.label(80), "processing");
            let record = self.process_item(&item, role).await;
            progress.record(&record);

            if let Err(e) = self.reports.write_item(&role.name, index + 1, &record) {
                warn!(role = %role.name, item = index + 1, error = %e, "could not write item report");
            }
            results.push(record);
            checkpoint.save(&results)?;
            progress.log(&role.name);
        }

        self.finish(role, &results);
        Ok(results)
    }

    async fn process_item(&self, item: &WorkItem, role: &RoleContext) -> ResultRecord {
        let prompt = role.render_prompt(item);
        run_on_fresh_session(
            self.service.as_ref(),
            &self.settings,
            &role.agent,
            &prompt,
            item,
            &role.name,
        )
        .await
    }

    fn finish(&self, role: &RoleContext, results: &[ResultRecord]) {
        if let Err(e) = self.reports.write_summary(&role.name, results) {
            warn!(role = %role.name, error = %e, "could not write summary");
        }
        if let Err(e) = self.reports.write_attributes(&role.name, results) {
            warn!(role = %role.name, error = %e, "could not write attributes");
        }
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(
            role = %role.name,
            succeeded,
            failed = results.len() - succeeded,
            "batch complete"
        );
    }
}
