//! In-memory entity store for tests and single-process setups.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use anyhow::anyhow;
use async_trait::async_trait;
use taskhook_core::models::{Build, CheckRun};

use crate::{BuildModifier, BuildUpdate, EntityStore, StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    builds: HashMap<String, Build>,
    check_runs: BTreeMap<(String, String), CheckRun>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn build_count(&self) -> usize { self.state.read().map_or(0, |s| s.builds.len()) }
}

fn poisoned<T>(_: T) -> StoreError { anyhow!("memory store lock poisoned").into() }

#[async_trait]
impl EntityStore for MemoryStore {
    async fn create_build(&self, build: &Build) -> StoreResult<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        if state.builds.contains_key(&build.task_group_id) {
            return Err(StoreError::build_exists(&build.task_group_id));
        }
        state.builds.insert(build.task_group_id.clone(), build.clone());
        Ok(())
    }

    async fn load_build(&self, task_group_id: &str) -> StoreResult<Build> {
        let state = self.state.read().map_err(poisoned)?;
        state.builds.get(task_group_id).cloned().ok_or_else(|| StoreError::build_missing(task_group_id))
    }

    async fn modify_build(
        &self,
        task_group_id: &str,
        modify: BuildModifier<'_>,
    ) -> StoreResult<BuildUpdate> {
        let mut state = self.state.write().map_err(poisoned)?;
        let stored = state
            .builds
            .get_mut(task_group_id)
            .ok_or_else(|| StoreError::build_missing(task_group_id))?;
        let previous = stored.state;
        let mut build = stored.clone();
        modify(&mut build);
        stored.state = build.state;
        stored.updated = build.updated;
        Ok(BuildUpdate { previous, build: stored.clone() })
    }

    async fn create_check_run(&self, check_run: &CheckRun) -> StoreResult<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        let key = (check_run.task_group_id.clone(), check_run.task_id.clone());
        if state.check_runs.contains_key(&key) {
            return Err(StoreError::check_run_exists(&check_run.task_group_id, &check_run.task_id));
        }
        state.check_runs.insert(key, check_run.clone());
        Ok(())
    }

    async fn load_check_run(&self, task_group_id: &str, task_id: &str) -> StoreResult<CheckRun> {
        let state = self.state.read().map_err(poisoned)?;
        state
            .check_runs
            .get(&(task_group_id.to_string(), task_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::check_run_missing(task_group_id, task_id))
    }

    async fn list_check_runs(&self, task_group_id: &str) -> StoreResult<Vec<CheckRun>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .check_runs
            .values()
            .filter(|run| run.task_group_id == task_group_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use taskhook_core::models::BuildState;
    use time::UtcDateTime;

    use super::*;

    #[tokio::test]
    async fn sticky_modify() {
        let store = MemoryStore::new();
        let now = UtcDateTime::now();
        let build = Build {
            organization: "o".to_string(),
            repository: "r".to_string(),
            sha: "s".to_string(),
            task_group_id: "g".to_string(),
            state: BuildState::Failure,
            installation_id: 1,
            event_type: "push".to_string(),
            event_id: "e".to_string(),
            created: now,
            updated: now,
        };
        store.create_build(&build).await.unwrap();
        let update = store
            .modify_build("g", &|b| {
                if b.state != BuildState::Failure {
                    b.state = BuildState::Success;
                }
            })
            .await
            .unwrap();
        assert!(!update.changed());
        assert_eq!(store.load_build("g").await.unwrap().state, BuildState::Failure);
        assert_eq!(store.build_count(), 1);
    }
}
