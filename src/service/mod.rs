//! Boundary to the external research job service.
//!
//! Everything the orchestrator knows about the service goes through the
//! [`JobService`] trait. [`HttpJobService`] talks to the real REST API; tests
//! use a scripted in-memory implementation.

pub mod client;
pub mod error;
#[cfg(test)]
pub(crate) mod mock;
pub mod types;

use std::future::Future;

pub use client::HttpJobService;
pub use error::ServiceError;
pub use types::{JobSnapshot, MessageRole, TranscriptMessage, Usage};

use crate::model::PartialOutput;

/// Operations the orchestrator needs from the job service.
///
/// A *session handle* is the service's conversation id; a *job* is one run of
/// an agent over the messages posted on that session.
pub trait JobService: Send + Sync {
    /// Opens a new conversation and returns its handle.
    fn create_session(&self) -> impl Future<Output = Result<String, ServiceError>> + Send;

    fn post_message(
        &self,
        handle: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Starts `agent` on the messages of `handle`.
    fn submit_job(
        &self,
        handle: &str,
        agent: &str,
    ) -> impl Future<Output = Result<JobSnapshot, ServiceError>> + Send;

    fn poll_job(
        &self,
        handle: &str,
        job_id: &str,
    ) -> impl Future<Output = Result<JobSnapshot, ServiceError>> + Send;

    fn cancel_job(
        &self,
        handle: &str,
        job_id: &str,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Latest agent output written by `job_id` on the session; empty until
    /// that job has written something. Answers left by earlier jobs on the
    /// same session are never returned.
    fn get_latest_output(
        &self,
        handle: &str,
        job_id: &str,
    ) -> impl Future<Output = Result<PartialOutput, ServiceError>> + Send;

    /// Full session history, oldest first.
    fn list_messages(
        &self,
        handle: &str,
    ) -> impl Future<Output = Result<Vec<TranscriptMessage>, ServiceError>> + Send;

    /// `Ok(false)` when the service no longer knows the handle.
    fn session_exists(&self, handle: &str)
    -> impl Future<Output = Result<bool, ServiceError>> + Send;
}
