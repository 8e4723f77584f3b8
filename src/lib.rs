//! Orchestration of long-running research jobs on an external agent service.
//!
//! Work items run through a [`poller::JobPoller`] one at a time per role
//! ([`batch`]), several roles run side by side ([`scheduler`]), and progress
//! is checkpointed so an interrupted batch resumes where it stopped.
//! Conversations that outlive a process are tracked by the
//! [`session_store`]. The [`analysis`] phase turns a multi-role run into
//! per-product reports, and [`pipeline`] chains the two.

pub mod analysis;
pub mod batch;
pub mod chat;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod input;
pub mod interactive;
pub mod model;
pub mod pipeline;
pub mod poller;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod session_store;
pub mod ui;

pub use error::{ResearchError, Result};
