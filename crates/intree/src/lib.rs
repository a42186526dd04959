//! Compiles an in-repository pipeline configuration and an event into the
//! scoped set of tasks to submit.

mod fromnow;
mod graph;
mod legacy;
pub mod schema;
pub mod slugid;
mod template;

use std::{str::FromStr, sync::Arc};

pub use fromnow::{format_timestamp, from_now};
pub use schema::{BuiltinValidator, SchemaValidator, SchemaVersion};
use serde::Serialize;
use serde_json::Value;
use taskhook_core::{config::Config, models::EventContext};
use time::UtcDateTime;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("Configuration is invalid for version {version}:\n{}", .errors.join("\n"))]
    Schema { version: SchemaVersion, errors: Vec<String> },
    #[error("{0}")]
    Config(String),
}

/// Who may trigger tasks from a pull request.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum PullRequestPolicy {
    /// Anyone.
    Public,
    /// Organization members and repository collaborators.
    #[default]
    Collaborators,
}

impl FromStr for PullRequestPolicy {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "collaborators" => Ok(Self::Collaborators),
            other => Err(CompileError::Config(format!(
                "`allowPullRequests` must be `public` or `collaborators`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub task_id: String,
    pub task: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGraph {
    pub scopes: Vec<String>,
    pub tasks: Vec<TaskDefinition>,
    pub pull_requests: PullRequestPolicy,
}

impl CompiledGraph {
    pub fn task_group_id(&self) -> Option<&str> { self.tasks.first().map(|t| t.task_id.as_str()) }
}

#[derive(Debug, Clone)]
pub struct CompileSettings {
    pub scheduler_id: String,
    pub provisioner_id: String,
    pub worker_type: String,
    pub root_url: Url,
}

impl CompileSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scheduler_id: config.taskcluster.scheduler_id.clone(),
            provisioner_id: config.intree.provisioner_id.clone(),
            worker_type: config.intree.worker_type.clone(),
            root_url: config.taskcluster.root_url.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            scheduler_id: "taskcluster-github".to_string(),
            provisioner_id: "aws-provisioner-v1".to_string(),
            worker_type: "github-worker".to_string(),
            root_url: Url::parse("https://tc.example.com/").unwrap(),
        }
    }
}

#[derive(Clone)]
pub struct Compiler {
    settings: CompileSettings,
    validator: Arc<dyn SchemaValidator>,
}

/// Parse without compiling.
pub fn check_syntax(text: &str) -> Result<(), CompileError> { parse(text).map(|_| ()) }

fn parse(text: &str) -> Result<Value, CompileError> {
    serde_yaml::from_str(text).map_err(|e| CompileError::Parse(e.to_string()))
}

impl Compiler {
    pub fn new(settings: CompileSettings, validator: Arc<dyn SchemaValidator>) -> Self {
        Self { settings, validator }
    }

    pub fn compile(&self, text: &str, event: &EventContext) -> Result<CompiledGraph, CompileError> {
        self.compile_at(text, event, UtcDateTime::now())
    }

    /// Compile with `now` as the reference for relative timestamps.
    ///
    /// `event` must carry unsanitized organization and repository names.
    pub fn compile_at(
        &self,
        text: &str,
        event: &EventContext,
        now: UtcDateTime,
    ) -> Result<CompiledGraph, CompileError> {
        let mut config = parse(text)?;
        let Some(version) = SchemaVersion::detect(&config) else {
            return Err(CompileError::Schema {
                version: SchemaVersion::V0,
                errors: vec!["`version` must be a non-negative integer".to_string()],
            });
        };
        let errors = self.validator.validate(version, &config);
        if !errors.is_empty() {
            return Err(CompileError::Schema { version, errors });
        }
        let Some(root) = config.as_object_mut() else {
            return Err(CompileError::Schema {
                version,
                errors: vec!["configuration must be a mapping".to_string()],
            });
        };
        root.remove("version");
        let pull_requests = match root.remove("allowPullRequests") {
            None | Some(Value::Null) => PullRequestPolicy::default(),
            Some(Value::String(policy)) => policy.parse()?,
            Some(other) => {
                return Err(CompileError::Config(format!(
                    "`allowPullRequests` must be a string, got {other}"
                )));
            }
        };

        let rendered = match version {
            SchemaVersion::V0 => {
                legacy::render(config, &legacy::params(event, &self.settings, now), now)?
            }
            SchemaVersion::V1 => template::Renderer::new(now)
                .render(&config, &template::context(event, &self.settings))?
                .unwrap_or(Value::Null),
        };
        let tasks = match rendered.get("tasks") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(tasks)) => tasks.clone(),
            Some(_) => return Err(CompileError::Config("`tasks` must be a list".to_string())),
        };

        let mut tasks = graph::select_tasks(tasks, event)?
            .into_iter()
            .map(|task| TaskDefinition { task_id: slugid::nice(), task })
            .collect::<Vec<_>>();
        graph::stamp_group(&mut tasks, &self.settings.scheduler_id);
        let scopes = graph::scopes(event)?;
        graph::inject_env(&mut tasks, event)?;
        tracing::debug!(
            "Compiled {} task(s) for {}/{} ({})",
            tasks.len(),
            event.organization,
            event.repository,
            event.event_type()
        );
        Ok(CompiledGraph { scopes, tasks, pull_requests })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use taskhook_core::models::details;

    use super::*;

    fn compiler() -> Compiler {
        Compiler::new(CompileSettings::for_tests(), Arc::new(BuiltinValidator))
    }

    fn now() -> UtcDateTime { UtcDateTime::from_unix_timestamp(1_500_000_000).unwrap() }

    fn event(event_type: &str, branch: &str) -> EventContext {
        let mut details = BTreeMap::new();
        for (k, v) in [
            (details::EVENT_TYPE, event_type),
            (details::BASE_REPO_BRANCH, branch),
            (details::HEAD_REPO_BRANCH, branch),
            (details::HEAD_SHA, "03e9577bc1ec60f2ff0929d5f1554de36b8f48cf"),
            (details::HEAD_USER_LOGIN, "octocat"),
        ] {
            details.insert(k.to_string(), v.to_string());
        }
        EventContext {
            organization: "mozilla".to_string(),
            repository: "app".to_string(),
            installation_id: 5828,
            event_id: "26370a80-ed65-11e6-8f4c-80082678482d".to_string(),
            details,
        }
    }

    const LEGACY: &str = r#"
version: 0
metadata:
  name: example
tasks:
  - provisionerId: "{{ taskcluster.docker.provisionerId }}"
    workerType: "{{ taskcluster.docker.workerType }}"
    created: "{{ $fromNow }}"
    deadline: "{{ '1 day' | $fromNow }}"
    payload:
      command: ["test", "{{ event.head.sha }}"]
    extra:
      github:
        env: true
        events:
          - pull_request.opened
          - pull_request.synchronize
  - payload: {}
    extra:
      github:
        events: [push]
        excludeBranches: [gh-pages]
"#;

    #[test]
    fn legacy_pull_request() {
        let graph = compiler().compile_at(LEGACY, &event("pull_request.opened", "main"), now()).unwrap();
        assert_eq!(graph.scopes, vec!["assume:repo:github.com/mozilla/app:pull-request"]);
        assert_eq!(graph.pull_requests, PullRequestPolicy::Collaborators);
        assert_eq!(graph.tasks.len(), 1);
        let definition = &graph.tasks[0];
        let task = &definition.task;
        assert_eq!(task["provisionerId"], "aws-provisioner-v1");
        assert_eq!(task["workerType"], "github-worker");
        assert_eq!(task["created"], "2017-07-14T02:40:00.000Z");
        assert_eq!(task["deadline"], "2017-07-15T02:40:00.000Z");
        assert_eq!(task["payload"]["command"][1], "03e9577bc1ec60f2ff0929d5f1554de36b8f48cf");
        assert_eq!(task["payload"]["env"]["GITHUB_EVENT"], "pull_request.opened");
        assert_eq!(task["taskGroupId"], definition.task_id.as_str());
        assert_eq!(task["schedulerId"], "taskcluster-github");
        assert_eq!(graph.task_group_id(), Some(definition.task_id.as_str()));
    }

    #[test]
    fn legacy_push_branch_excluded() {
        let graph = compiler().compile_at(LEGACY, &event("push", "gh-pages"), now()).unwrap();
        assert!(graph.tasks.is_empty());
        assert_eq!(graph.scopes, vec!["assume:repo:github.com/mozilla/app:branch:gh-pages"]);
    }

    #[test]
    fn pull_request_only_task_ignores_push() {
        let config = r#"
version: 0
tasks:
  - extra:
      github:
        events: [pull_request.opened]
"#;
        let graph = compiler().compile_at(config, &event("push", "main"), now()).unwrap();
        assert!(graph.tasks.is_empty());
    }

    #[test]
    fn conflicting_branch_lists() {
        let config = r#"
version: 0
tasks:
  - extra:
      github:
        events: [push]
        branches: [main]
        excludeBranches: [dev]
"#;
        let err = compiler().compile_at(config, &event("push", "main"), now()).unwrap_err();
        assert!(matches!(err, CompileError::Config(_)));
    }

    #[test]
    fn non_ascii_branch() {
        let err = compiler().compile_at(LEGACY, &event("push", "fëature"), now()).unwrap_err();
        assert!(matches!(err, CompileError::Config(_)));
    }

    #[test]
    fn compiling_twice_changes_only_ids() {
        let compiler = compiler();
        let event = event("pull_request.opened", "main");
        let first = compiler.compile_at(LEGACY, &event, now()).unwrap();
        let second = compiler.compile_at(LEGACY, &event, now()).unwrap();
        assert_eq!(first.scopes, second.scopes);
        assert_ne!(first.tasks[0].task_id, second.tasks[0].task_id);
        let strip = |graph: &CompiledGraph| {
            graph
                .tasks
                .iter()
                .map(|t| {
                    let mut task = t.task.clone();
                    task.as_object_mut().unwrap().remove("taskGroupId");
                    task
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&first), strip(&second));
    }

    #[test]
    fn expression_templates() {
        let config = r#"
version: 1
allowPullRequests: public
tasks:
  $let:
    head: ${event.head.sha}
  in:
    - $if: tasks_for == "github-pull-request"
      then:
        metadata:
          name: "PR from ${event.head.user.login}"
        deadline: {$fromNow: "2 hours"}
        payload:
          command: ["check", "${head}"]
        extra:
          github:
            events: ["pull_request.*"]
    - $if: tasks_for == "github-push"
      then:
        extra:
          github:
            events: [push]
"#;
        let graph = compiler().compile_at(config, &event("pull_request.synchronize", "main"), now()).unwrap();
        assert_eq!(graph.pull_requests, PullRequestPolicy::Public);
        assert_eq!(graph.tasks.len(), 1);
        let task = &graph.tasks[0].task;
        assert_eq!(task["metadata"]["name"], "PR from octocat");
        assert_eq!(task["deadline"], "2017-07-14T04:40:00.000Z");
        assert_eq!(task["payload"]["command"][1], "03e9577bc1ec60f2ff0929d5f1554de36b8f48cf");
    }

    #[test]
    fn error_kinds() {
        let compiler = compiler();
        let event = event("push", "main");
        assert!(matches!(
            compiler.compile_at("tasks: [", &event, now()),
            Err(CompileError::Parse(_))
        ));
        assert!(matches!(
            compiler.compile_at("tasks: []", &event, now()),
            Err(CompileError::Schema { .. })
        ));
        assert!(matches!(
            compiler.compile_at("version: 0\ntasks: {}", &event, now()),
            Err(CompileError::Schema { version: SchemaVersion::V0, .. })
        ));
        assert!(matches!(
            compiler.compile_at("version: 0\nallowPullRequests: maybe\ntasks: []", &event, now()),
            Err(CompileError::Config(_))
        ));
        assert!(matches!(
            compiler.compile_at("version: 1\ntasks: ['${nope}']", &event, now()),
            Err(CompileError::Config(_))
        ));
        assert!(check_syntax("a: [1, 2").is_err());
        assert!(check_syntax("a: [1, 2]").is_ok());
    }
}
