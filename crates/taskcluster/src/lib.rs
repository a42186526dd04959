mod client;
pub mod hawk;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use async_trait::async_trait;
pub use client::QueueClient;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue answered with a non-success status.
    #[error("queue rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("queue request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Unscheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

impl TaskState {
    pub fn is_success(self) -> bool { self == Self::Completed }
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGroupPage {
    pub tasks: Vec<TaskStatus>,
    pub continuation_token: Option<String>,
}

/// Task platform operations needed by the bridge.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit `task` under `task_id`, restricted to `authorized_scopes`.
    async fn create_task(
        &self,
        task_id: &str,
        task: &Value,
        authorized_scopes: &[String],
    ) -> Result<(), QueueError>;

    /// One page of task statuses for a group.
    async fn list_task_group(
        &self,
        task_group_id: &str,
        continuation: Option<&str>,
    ) -> Result<TaskGroupPage, QueueError>;
}

/// Follow continuation tokens until the group listing is exhausted.
pub async fn list_task_group_all(
    queue: &dyn TaskQueue,
    task_group_id: &str,
) -> Result<Vec<TaskStatus>, QueueError> {
    let mut tasks = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = queue.list_task_group(task_group_id, continuation.as_deref()).await?;
        tasks.extend(page.tasks);
        match page.continuation_token {
            Some(token) if !token.is_empty() => continuation = Some(token),
            _ => break,
        }
    }
    Ok(tasks)
}
