use serde_json::{Map, Value};
use taskhook_core::models::{EventContext, details};

use crate::{CompileError, TaskDefinition};

/// Variables merged into `payload.env` for tasks with `extra.github.env` set.
const ENV_VARS: &[(&str, &str)] = &[
    ("GITHUB_EVENT", details::EVENT_TYPE),
    ("GITHUB_BRANCH", details::BASE_REPO_BRANCH),
    ("GITHUB_PULL_REQUEST", details::PULL_NUMBER),
    ("GITHUB_PULL_TITLE", details::TITLE),
    ("GITHUB_BASE_REPO_NAME", details::BASE_REPO_NAME),
    ("GITHUB_BASE_REPO_URL", details::BASE_REPO_URL),
    ("GITHUB_BASE_USER", details::BASE_USER_LOGIN),
    ("GITHUB_BASE_SHA", details::BASE_SHA),
    ("GITHUB_BASE_BRANCH", details::BASE_REPO_BRANCH),
    ("GITHUB_BASE_REF", details::BASE_REF),
    ("GITHUB_HEAD_REPO_NAME", details::HEAD_REPO_NAME),
    ("GITHUB_HEAD_REPO_URL", details::HEAD_REPO_URL),
    ("GITHUB_HEAD_USER", details::HEAD_USER_LOGIN),
    ("GITHUB_HEAD_SHA", details::HEAD_SHA),
    ("GITHUB_HEAD_BRANCH", details::HEAD_REPO_BRANCH),
    ("GITHUB_HEAD_TAG", details::HEAD_TAG),
    ("GITHUB_HEAD_REF", details::HEAD_REF),
    ("GITHUB_HEAD_USER_EMAIL", details::HEAD_USER_EMAIL),
];

fn github_meta(task: &Value) -> Option<&Map<String, Value>> {
    task.get("extra")?.get("github")?.as_object()
}

fn string_list<'a>(meta: &'a Map<String, Value>, key: &str) -> Option<Vec<&'a str>> {
    match meta.get(key)? {
        Value::Array(items) => Some(items.iter().filter_map(Value::as_str).collect()),
        Value::Null => None,
        Value::String(s) => Some(vec![s.as_str()]),
        _ => Some(Vec::new()),
    }
}

/// Keep only the tasks owned by this integration that fire for `event`.
pub(crate) fn select_tasks(
    tasks: Vec<Value>,
    event: &EventContext,
) -> Result<Vec<Value>, CompileError> {
    let event_type = event.event_type();
    let branch = event.detail(details::BASE_REPO_BRANCH).unwrap_or_default();
    let mut selected = Vec::new();
    for task in tasks {
        let Some(meta) = github_meta(&task) else { continue };
        let include = string_list(meta, "branches");
        let exclude = string_list(meta, "excludeBranches");
        if include.is_some() && exclude.is_some() {
            return Err(CompileError::Config(
                "Cannot specify both `branches` and `excludeBranches` in the same task".to_string(),
            ));
        }
        let events = string_list(meta, "events").unwrap_or_default();
        let fires = events.iter().any(|pattern| {
            if !event_type.starts_with(pattern.trim_end_matches('*')) {
                return false;
            }
            if event_type != "push" {
                return true;
            }
            match (&include, &exclude) {
                (Some(include), _) => include.contains(&branch),
                (_, Some(exclude)) => !exclude.contains(&branch),
                _ => true,
            }
        });
        if fires {
            selected.push(task);
        }
    }
    Ok(selected)
}

/// The first task's id becomes the group id of every task.
pub(crate) fn stamp_group(tasks: &mut [TaskDefinition], scheduler_id: &str) {
    let Some(task_group_id) = tasks.first().map(|t| t.task_id.clone()) else { return };
    for definition in tasks {
        if let Some(task) = definition.task.as_object_mut() {
            task.insert("taskGroupId".to_string(), Value::String(task_group_id.clone()));
            task.insert("schedulerId".to_string(), Value::String(scheduler_id.to_string()));
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub(crate) fn inject_env(
    tasks: &mut [TaskDefinition],
    event: &EventContext,
) -> Result<(), CompileError> {
    for definition in tasks {
        let wants_env = github_meta(&definition.task)
            .and_then(|meta| meta.get("env"))
            .is_some_and(truthy);
        let Some(task) = definition.task.as_object_mut().filter(|_| wants_env) else { continue };
        let payload = task.entry("payload").or_insert_with(|| Value::Object(Map::new()));
        let Some(payload) = payload.as_object_mut() else {
            return Err(CompileError::Config("Task `payload` must be a mapping".to_string()));
        };
        let env = payload.entry("env").or_insert_with(|| Value::Object(Map::new()));
        let Some(env) = env.as_object_mut() else {
            return Err(CompileError::Config("Task `payload.env` must be a mapping".to_string()));
        };
        for (name, key) in ENV_VARS {
            if let Some(value) = event.detail(key) {
                env.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
    }
    Ok(())
}

fn printable_ascii(name: &str) -> bool { name.bytes().all(|b| (0x20..=0x7e).contains(&b)) }

/// Scopes ceiling for the submitted task group.
pub(crate) fn scopes(event: &EventContext) -> Result<Vec<String>, CompileError> {
    for key in [details::BASE_REPO_BRANCH, details::HEAD_REPO_BRANCH, details::HEAD_TAG] {
        if let Some(name) = event.detail(key)
            && !printable_ascii(name)
        {
            return Err(CompileError::Config(format!(
                "Branch and tag names must be printable ASCII, got `{name}`"
            )));
        }
    }
    let prefix = format!("assume:repo:github.com/{}/{}", event.organization, event.repository);
    let event_type = event.event_type();
    let scope = match event_type {
        t if t.starts_with("pull_request") => format!("{prefix}:pull-request"),
        "push" => {
            let branch = event.detail(details::BASE_REPO_BRANCH).unwrap_or_default();
            format!("{prefix}:branch:{branch}")
        }
        "release" => format!("{prefix}:release"),
        "tag" => {
            let tag = event.detail(details::HEAD_TAG).unwrap_or_default();
            format!("{prefix}:tag:{tag}")
        }
        _ => return Ok(Vec::new()),
    };
    Ok(vec![scope])
}
