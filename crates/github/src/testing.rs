//! Recording code host for handler tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::{
    CheckRunCompletion, CheckRunRef, CodeHost, CodeHostError, CodeHostResult, CommitStatus,
    Installations, NewCheckRun,
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Call {
    CommitComment { repo: String, sha: String, body: String },
    IssueComment { repo: String, number: u64, body: String },
    Status { repo: String, sha: String, status: CommitStatus },
    CreateCheckRun { repo: String, check_run: NewCheckRun },
    CompleteCheckRun { repo: String, check_run_id: u64, completion: CheckRunCompletion },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Failure {
    Forbidden,
    Other,
}

impl Failure {
    fn error(self, what: &str) -> CodeHostError {
        match self {
            Self::Forbidden => CodeHostError::Forbidden(what.to_string()),
            Self::Other => CodeHostError::Other(anyhow!("{what} failed")),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<(String, String), String>,
    file_failure: Option<Failure>,
    tags: HashMap<String, String>,
    members: HashSet<String>,
    collaborators: HashSet<String>,
    collaborator_failure: Option<Failure>,
    check_run_failure: Option<Failure>,
    status_failures: usize,
    next_check_run_id: u64,
    installations: Vec<u64>,
    calls: Vec<Call>,
}

/// In-memory code host. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    state: Arc<Mutex<State>>,
}

impl RecordingHost {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_file(self, path: &str, reference: &str, content: &str) -> Self {
        self.state().files.insert((path.to_string(), reference.to_string()), content.to_string());
        self
    }

    pub fn failing_files(self, failure: Failure) -> Self {
        self.state().file_failure = Some(failure);
        self
    }

    pub fn with_tag(self, tag: &str, sha: &str) -> Self {
        self.state().tags.insert(tag.to_string(), sha.to_string());
        self
    }

    pub fn with_member(self, login: &str) -> Self {
        self.state().members.insert(login.to_string());
        self
    }

    pub fn with_collaborator(self, login: &str) -> Self {
        self.state().collaborators.insert(login.to_string());
        self
    }

    pub fn failing_collaborators(self, failure: Failure) -> Self {
        self.state().collaborator_failure = Some(failure);
        self
    }

    pub fn failing_check_runs(self, failure: Failure) -> Self {
        self.state().check_run_failure = Some(failure);
        self
    }

    /// The next `times` status posts fail.
    pub fn failing_statuses(self, times: usize) -> Self {
        self.state().status_failures = times;
        self
    }

    pub fn calls(&self) -> Vec<Call> { self.state().calls.clone() }

    pub fn installations(&self) -> Vec<u64> { self.state().installations.clone() }

    pub fn commit_comments(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CommitComment { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn issue_comments(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::IssueComment { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<CommitStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Status { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) { self.state().calls.push(call) }
}

#[async_trait]
impl Installations for RecordingHost {
    async fn installation(&self, installation_id: u64) -> Result<Box<dyn CodeHost>> {
        self.state().installations.push(installation_id);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl CodeHost for RecordingHost {
    async fn get_file(
        &self,
        _owner: &str,
        _repo: &str,
        path: &str,
        reference: &str,
    ) -> CodeHostResult<String> {
        let state = self.state();
        if let Some(failure) = state.file_failure {
            return Err(failure.error(path));
        }
        state
            .files
            .get(&(path.to_string(), reference.to_string()))
            .cloned()
            .ok_or_else(|| CodeHostError::NotFound(path.to_string()))
    }

    async fn resolve_tag(&self, _owner: &str, _repo: &str, tag: &str) -> CodeHostResult<String> {
        self.state().tags.get(tag).cloned().ok_or_else(|| CodeHostError::NotFound(tag.to_string()))
    }

    async fn check_org_membership(&self, _org: &str, login: &str) -> CodeHostResult<()> {
        if self.state().members.contains(login) {
            Ok(())
        } else {
            Err(CodeHostError::NotFound(login.to_string()))
        }
    }

    async fn check_collaborator(&self, _owner: &str, _repo: &str, login: &str) -> CodeHostResult<()> {
        let state = self.state();
        if let Some(failure) = state.collaborator_failure {
            return Err(failure.error("collaborator check"));
        }
        if state.collaborators.contains(login) {
            Ok(())
        } else {
            Err(CodeHostError::NotFound(login.to_string()))
        }
    }

    async fn create_commit_comment(
        &self,
        _owner: &str,
        repo: &str,
        sha: &str,
        body: &str,
    ) -> CodeHostResult<()> {
        self.record(Call::CommitComment {
            repo: repo.to_string(),
            sha: sha.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn create_issue_comment(
        &self,
        _owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> CodeHostResult<()> {
        self.record(Call::IssueComment { repo: repo.to_string(), number, body: body.to_string() });
        Ok(())
    }

    async fn create_status(
        &self,
        _owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> CodeHostResult<()> {
        let mut state = self.state();
        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(Failure::Other.error("status"));
        }
        state.calls.push(Call::Status { repo: repo.to_string(), sha: sha.to_string(), status: status.clone() });
        Ok(())
    }

    async fn create_check_run(
        &self,
        _owner: &str,
        repo: &str,
        check_run: &NewCheckRun,
    ) -> CodeHostResult<CheckRunRef> {
        let mut state = self.state();
        if let Some(failure) = state.check_run_failure {
            return Err(failure.error("check run"));
        }
        state.next_check_run_id += 1;
        let id = state.next_check_run_id;
        state.calls.push(Call::CreateCheckRun { repo: repo.to_string(), check_run: check_run.clone() });
        Ok(CheckRunRef { id, check_suite_id: 1000 + id })
    }

    async fn complete_check_run(
        &self,
        _owner: &str,
        repo: &str,
        check_run_id: u64,
        completion: &CheckRunCompletion,
    ) -> CodeHostResult<()> {
        self.record(Call::CompleteCheckRun {
            repo: repo.to_string(),
            check_run_id,
            completion: completion.clone(),
        });
        Ok(())
    }
}
