//! Storage port for builds and check runs.

use async_trait::async_trait;
use taskhook_core::models::{Build, BuildState, CheckRun};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {key} already exists")]
    AlreadyExists { entity: &'static str, key: String },
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub(crate) fn build_exists(task_group_id: &str) -> Self {
        Self::AlreadyExists { entity: "build", key: task_group_id.to_string() }
    }

    pub(crate) fn build_missing(task_group_id: &str) -> Self {
        Self::NotFound { entity: "build", key: task_group_id.to_string() }
    }

    pub(crate) fn check_run_exists(task_group_id: &str, task_id: &str) -> Self {
        Self::AlreadyExists { entity: "check run", key: format!("{task_group_id}/{task_id}") }
    }

    pub(crate) fn check_run_missing(task_group_id: &str, task_id: &str) -> Self {
        Self::NotFound { entity: "check run", key: format!("{task_group_id}/{task_id}") }
    }
}

/// Outcome of [`EntityStore::modify_build`].
#[derive(Debug, Clone)]
pub struct BuildUpdate {
    /// State stored before the update was applied.
    pub previous: BuildState,
    /// Record as stored after the update.
    pub build: Build,
}

impl BuildUpdate {
    pub fn changed(&self) -> bool { self.previous != self.build.state }
}

pub type BuildModifier<'a> = &'a (dyn Fn(&mut Build) + Send + Sync);

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Stores a new build.
    ///
    /// Fails with [`StoreError::AlreadyExists`] when a build with the same
    /// task group id exists.
    async fn create_build(&self, build: &Build) -> StoreResult<()>;

    async fn load_build(&self, task_group_id: &str) -> StoreResult<Build>;

    /// Read-modify-write of a build's `state` and `updated` fields.
    ///
    /// `modify` is applied to the currently stored record and may be invoked
    /// more than once under contention. Changes to key fields are ignored.
    async fn modify_build(
        &self,
        task_group_id: &str,
        modify: BuildModifier<'_>,
    ) -> StoreResult<BuildUpdate>;

    async fn create_check_run(&self, check_run: &CheckRun) -> StoreResult<()>;

    async fn load_check_run(&self, task_group_id: &str, task_id: &str) -> StoreResult<CheckRun>;

    async fn list_check_runs(&self, task_group_id: &str) -> StoreResult<Vec<CheckRun>>;
}
