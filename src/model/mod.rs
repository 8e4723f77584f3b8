pub mod job;
pub mod record;
pub mod role;

pub use job::{Job, JobStatus, RetryPolicy};
pub use record::{Citation, Metrics, PartialOutput, ResultRecord, WorkItem};
pub use role::RoleContext;
