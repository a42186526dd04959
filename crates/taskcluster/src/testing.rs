//! Scripted task queue for handler tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;

use crate::{QueueError, TaskGroupPage, TaskQueue, TaskState, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub task_id: String,
    pub task: Value,
    pub authorized_scopes: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    pages: HashMap<String, VecDeque<Vec<TaskStatus>>>,
    submissions: Vec<Submission>,
    reject_submissions: bool,
    listings: usize,
}

/// Records submissions and serves group listings page by page. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedQueue {
    state: Arc<Mutex<State>>,
}

impl ScriptedQueue {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one listing page for `task_group_id`.
    pub fn with_group(self, task_group_id: &str, tasks: &[(&str, TaskState)]) -> Self {
        let page = tasks
            .iter()
            .map(|(task_id, state)| TaskStatus { task_id: task_id.to_string(), state: *state })
            .collect();
        self.state().pages.entry(task_group_id.to_string()).or_default().push_back(page);
        self
    }

    pub fn rejecting_submissions(self) -> Self {
        self.state().reject_submissions = true;
        self
    }

    pub fn submissions(&self) -> Vec<Submission> { self.state().submissions.clone() }

    pub fn listings(&self) -> usize { self.state().listings }
}

#[async_trait]
impl TaskQueue for ScriptedQueue {
    async fn create_task(
        &self,
        task_id: &str,
        task: &Value,
        authorized_scopes: &[String],
    ) -> Result<(), QueueError> {
        let mut state = self.state();
        if state.reject_submissions {
            return Err(QueueError::Rejected {
                status: 403,
                message: format!("client lacks scopes for task {task_id}"),
            });
        }
        state.submissions.push(Submission {
            task_id: task_id.to_string(),
            task: task.clone(),
            authorized_scopes: authorized_scopes.to_vec(),
        });
        Ok(())
    }

    async fn list_task_group(
        &self,
        task_group_id: &str,
        continuation: Option<&str>,
    ) -> Result<TaskGroupPage, QueueError> {
        let mut state = self.state();
        state.listings += 1;
        let pages = state
            .pages
            .get(task_group_id)
            .ok_or_else(|| anyhow!("unknown task group {task_group_id}"))?;
        let index = match continuation {
            Some(token) => token.parse::<usize>().map_err(|e| anyhow!("bad token: {e}"))?,
            None => 0,
        };
        let tasks = pages.get(index).cloned().unwrap_or_default();
        let continuation_token = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(TaskGroupPage { tasks, continuation_token })
    }
}
