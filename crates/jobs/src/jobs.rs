mod comments;
mod job;
mod status;

pub use job::{ConsistencyViolation, JobOutcome, process_job_event};
pub use status::{
    process_group_resolved, process_task_defined, process_task_failure, process_task_group_defined,
};
