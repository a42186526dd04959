use anyhow::{Context, Result, anyhow};
use futures_util::future::try_join_all;
use taskhook_core::{
    models::{Build, BuildState, EventContext, details},
    util::unsanitize,
};
use taskhook_db::StoreError;
use taskhook_github::{
    CodeHost, CodeHostError,
    permissions::{self, Decision, Denial},
};
use taskhook_intree::{CompiledGraph, PullRequestPolicy, check_syntax};
use thiserror::Error;
use time::UtcDateTime;

use super::comments::{self, Target};
use crate::JobContext;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum JobOutcome {
    /// Nothing to run for this event.
    Skipped,
    /// The event was answered with a feedback comment.
    Commented,
    Submitted { task_group_id: String },
}

/// A redelivered event disagrees with the build already stored for its group.
#[derive(Debug, Error)]
#[error("build {task_group_id} exists with {field} {stored:?}, event has {incoming:?}")]
pub struct ConsistencyViolation {
    pub task_group_id: String,
    pub field: &'static str,
    pub stored: String,
    pub incoming: String,
}

/// Turn a code-host event into a submitted task group.
///
/// User-caused problems (bad configuration, denied pull requests, rejected
/// submissions) are answered with a comment and reported as
/// [`JobOutcome::Commented`]. Anything else is returned as an error so the
/// message is retried.
pub async fn process_job_event(ctx: &JobContext, mut event: EventContext) -> Result<JobOutcome> {
    event.organization = unsanitize(&event.organization);
    event.repository = unsanitize(&event.repository);
    let event = event;
    let organization = event.organization.as_str();
    let repository = event.repository.as_str();
    let event_type = event.event_type();
    tracing::info!("Handling {event_type} event for {organization}/{repository}");

    let host = ctx
        .github
        .installation(event.installation_id)
        .await
        .with_context(|| format!("Failed to authenticate as installation {}", event.installation_id))?;
    let host = host.as_ref();

    let sha = match event.head_sha() {
        Some(sha) => sha.to_string(),
        None => {
            let tag = event
                .detail(details::VERSION)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow!("{event_type} event has neither a head sha nor a version"))?;
            host.resolve_tag(organization, repository, tag)
                .await
                .with_context(|| format!("Failed to resolve tag {tag} of {organization}/{repository}"))?
        }
    };
    let target = Target { organization, repository, sha: &sha, pull_number: event.pull_number() };

    let path = &ctx.config.app.config_path;
    let text = match host.get_file(organization, repository, path, &sha).await {
        Ok(text) => text,
        Err(CodeHostError::NotFound(_)) => {
            tracing::info!("{organization}/{repository}@{sha} has no {path}, skipping");
            return Ok(JobOutcome::Skipped);
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to fetch {path} for {organization}/{repository}@{sha}")));
        }
    };

    if let Err(e) = check_syntax(&text) {
        tracing::info!("{path} for {organization}/{repository}@{sha} is not valid YAML");
        comments::post_exception(host, &target, &e.to_string()).await?;
        return Ok(JobOutcome::Commented);
    }

    let graph = match ctx.compiler.compile(&text, &event) {
        Ok(graph) => graph,
        Err(e) => {
            tracing::info!("{path} for {organization}/{repository}@{sha} did not compile: {e}");
            comments::post_exception(host, &target, &e.to_string()).await?;
            return Ok(JobOutcome::Commented);
        }
    };
    let Some(task_group_id) = graph.task_group_id().map(str::to_string) else {
        tracing::info!("{path} for {organization}/{repository}@{sha} has no tasks for {event_type}");
        return Ok(JobOutcome::Skipped);
    };

    if event.is_pull_request() && graph.pull_requests == PullRequestPolicy::Collaborators {
        let login = event.detail(details::HEAD_USER_LOGIN).unwrap_or_default();
        let decision =
            permissions::evaluate(host, login, organization, repository, Some(&sha)).await?;
        let body = match decision {
            Decision::Allow => None,
            Decision::Deny(Denial::NotCollaborator) => Some(comments::not_collaborator_body(login)),
            Decision::Deny(Denial::InsufficientCredentials) => {
                Some(comments::ALLOW_LIST_UNAVAILABLE_BODY.to_string())
            }
        };
        if let Some(body) = body {
            tracing::info!("Pull request from {login} denied for {organization}/{repository}");
            comments::post(host, &target, &body).await?;
            return Ok(JobOutcome::Commented);
        }
    }

    record_build(ctx, &event, &sha, &task_group_id).await?;

    if let Err(e) = submit(ctx, &graph).await {
        tracing::warn!("Submitting task group {task_group_id} failed: {e:#}");
        comments::post_exception(host, &target, &format!("{e:#}")).await?;
        return Ok(JobOutcome::Commented);
    }

    ctx.publisher
        .publish_task_group_defined(&task_group_id)
        .await
        .context("Failed to publish task group")?;
    tracing::info!(
        "Submitted {} task(s) in group {task_group_id} for {organization}/{repository}@{sha}",
        graph.tasks.len()
    );
    Ok(JobOutcome::Submitted { task_group_id })
}

/// Create the build, or verify the stored one if this event was already seen.
async fn record_build(
    ctx: &JobContext,
    event: &EventContext,
    sha: &str,
    task_group_id: &str,
) -> Result<()> {
    let now = UtcDateTime::now();
    let build = Build {
        organization: event.organization.clone(),
        repository: event.repository.clone(),
        sha: sha.to_string(),
        task_group_id: task_group_id.to_string(),
        state: BuildState::Queued,
        installation_id: event.installation_id,
        event_type: event.event_type().to_string(),
        event_id: event.event_id.clone(),
        created: now,
        updated: now,
    };
    match ctx.store.create_build(&build).await {
        Ok(()) => Ok(()),
        Err(StoreError::AlreadyExists { .. }) => {
            let stored = ctx.store.load_build(task_group_id).await?;
            tracing::debug!("Build {task_group_id} already exists, verifying");
            verify_build(&stored, &build)
        }
        Err(e) => Err(anyhow::Error::new(e).context("Failed to create build")),
    }
}

fn verify_build(stored: &Build, incoming: &Build) -> Result<()> {
    let fields = [
        ("organization", &stored.organization, &incoming.organization),
        ("repository", &stored.repository, &incoming.repository),
        ("sha", &stored.sha, &incoming.sha),
        ("event type", &stored.event_type, &incoming.event_type),
        ("event id", &stored.event_id, &incoming.event_id),
    ];
    for (field, stored_value, incoming_value) in fields {
        if stored_value != incoming_value {
            return Err(ConsistencyViolation {
                task_group_id: stored.task_group_id.clone(),
                field,
                stored: stored_value.clone(),
                incoming: incoming_value.clone(),
            }
            .into());
        }
    }
    Ok(())
}

async fn submit(ctx: &JobContext, graph: &CompiledGraph) -> Result<()> {
    try_join_all(graph.tasks.iter().map(|definition| {
        ctx.queue.create_task(&definition.task_id, &definition.task, &graph.scopes)
    }))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use taskhook_db::EntityStore;
    use taskhook_github::testing::{Failure, RecordingHost};
    use taskhook_taskcluster::testing::ScriptedQueue;

    use super::*;
    use crate::testing::{Harness, SHA};

    const CONFIG: &str = r#"
version: 1
tasks:
  - $if: tasks_for == "github-pull-request" or tasks_for == "github-push"
    then:
      metadata:
        name: "check ${event.head.sha}"
      payload: {}
      extra:
        github:
          events: ["pull_request.*", push]
"#;

    fn event(event_type: &str, extra: &[(&str, &str)]) -> EventContext {
        let mut details = BTreeMap::new();
        details.insert(details::EVENT_TYPE.to_string(), event_type.to_string());
        for (key, value) in extra {
            details.insert(key.to_string(), value.to_string());
        }
        EventContext {
            organization: "mozilla%org".to_string(),
            repository: "app%js".to_string(),
            installation_id: 5828,
            event_id: "delivery-1".to_string(),
            details,
        }
    }

    fn push(branch: &str) -> EventContext {
        event("push", &[
            (details::HEAD_SHA, SHA),
            (details::BASE_REPO_BRANCH, branch),
            (details::HEAD_REPO_BRANCH, branch),
            (details::HEAD_USER_LOGIN, "octocat"),
        ])
    }

    fn pull_request(login: &str) -> EventContext {
        event("pull_request.opened", &[
            (details::HEAD_SHA, SHA),
            (details::BASE_REPO_BRANCH, "main"),
            (details::HEAD_REPO_BRANCH, "feature"),
            (details::HEAD_USER_LOGIN, login),
            (details::PULL_NUMBER, "17"),
        ])
    }

    #[tokio::test]
    async fn push_submits_and_publishes() {
        let host = RecordingHost::new().with_file(".taskcluster.yml", SHA, CONFIG);
        let queue = ScriptedQueue::new();
        let harness = Harness::new(host.clone(), queue.clone()).await;

        let outcome = process_job_event(&harness.context, push("main")).await.unwrap();
        let JobOutcome::Submitted { task_group_id } = outcome else {
            panic!("expected submission, got {outcome:?}");
        };

        let submissions = queue.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].task_id, task_group_id);
        assert_eq!(submissions[0].authorized_scopes, vec![
            "assume:repo:github.com/mozilla.org/app.js:branch:main"
        ]);
        assert_eq!(submissions[0].task["metadata"]["name"], format!("check {SHA}"));

        let build = harness.store.load_build(&task_group_id).await.unwrap();
        assert_eq!(build.organization, "mozilla.org");
        assert_eq!(build.repository, "app.js");
        assert_eq!(build.state, BuildState::Queued);
        assert_eq!(build.event_type, "push");

        assert_eq!(harness.publisher.published(), vec![task_group_id.clone()]);
        assert!(host.calls().is_empty());
        assert_eq!(host.installations(), vec![5828]);
    }

    #[tokio::test]
    async fn missing_config_is_skipped() {
        let host = RecordingHost::new();
        let queue = ScriptedQueue::new();
        let harness = Harness::new(host.clone(), queue.clone()).await;
        let outcome = process_job_event(&harness.context, push("main")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert!(host.calls().is_empty());
        assert!(queue.submissions().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal() {
        let host = RecordingHost::new().failing_files(Failure::Other);
        let harness = Harness::new(host.clone(), ScriptedQueue::new()).await;
        assert!(process_job_event(&harness.context, push("main")).await.is_err());
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_yaml_comments() {
        let host = RecordingHost::new().with_file(".taskcluster.yml", SHA, "tasks: [");
        let harness = Harness::new(host.clone(), ScriptedQueue::new()).await;
        let outcome = process_job_event(&harness.context, push("main")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Commented);
        let comments = host.commit_comments();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].starts_with("<details>"));
        assert_eq!(harness.store.build_count(), 0);
    }

    #[tokio::test]
    async fn no_matching_tasks_is_skipped() {
        let config = "version: 0\ntasks:\n  - extra:\n      github:\n        events: [release]\n";
        let host = RecordingHost::new().with_file(".taskcluster.yml", SHA, config);
        let harness = Harness::new(host.clone(), ScriptedQueue::new()).await;
        let outcome = process_job_event(&harness.context, push("main")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn non_ascii_branch_comments_once() {
        let host = RecordingHost::new().with_file(".taskcluster.yml", SHA, CONFIG);
        let queue = ScriptedQueue::new();
        let harness = Harness::new(host.clone(), queue.clone()).await;
        let outcome = process_job_event(&harness.context, push("fëature")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Commented);
        assert_eq!(host.calls().len(), 1);
        assert_eq!(host.commit_comments().len(), 1);
        assert!(queue.submissions().is_empty());
    }

    #[tokio::test]
    async fn outsider_pull_request_is_denied() {
        let host = RecordingHost::new().with_file(".taskcluster.yml", SHA, CONFIG);
        let queue = ScriptedQueue::new();
        let harness = Harness::new(host.clone(), queue.clone()).await;

        let outcome = process_job_event(&harness.context, pull_request("mallory")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Commented);
        let comments = host.issue_comments();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].contains("No Taskcluster jobs started for this pull request"));
        assert!(comments[0].contains("@mallory"));
        assert_eq!(harness.store.build_count(), 0);
        assert!(queue.submissions().is_empty());
    }

    #[tokio::test]
    async fn collaborator_pull_request_runs() {
        let host = RecordingHost::new()
            .with_file(".taskcluster.yml", SHA, CONFIG)
            .with_collaborator("alice");
        let queue = ScriptedQueue::new();
        let harness = Harness::new(host.clone(), queue.clone()).await;
        let outcome = process_job_event(&harness.context, pull_request("alice")).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Submitted { .. }));
        assert_eq!(queue.submissions()[0].authorized_scopes, vec![
            "assume:repo:github.com/mozilla.org/app.js:pull-request"
        ]);
    }

    #[tokio::test]
    async fn public_pull_requests_skip_permission_check() {
        let config = CONFIG.replace("version: 1", "version: 1\nallowPullRequests: public");
        let host = RecordingHost::new()
            .with_file(".taskcluster.yml", SHA, &config)
            .failing_collaborators(Failure::Other);
        let harness = Harness::new(host.clone(), ScriptedQueue::new()).await;
        let outcome = process_job_event(&harness.context, pull_request("mallory")).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Submitted { .. }));
    }

    #[tokio::test]
    async fn forbidden_collaborator_check() {
        let host = RecordingHost::new()
            .with_file(".taskcluster.yml", SHA, CONFIG)
            .failing_collaborators(Failure::Forbidden);
        let harness = Harness::new(host.clone(), ScriptedQueue::new()).await;
        let outcome = process_job_event(&harness.context, pull_request("mallory")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Commented);
        assert_eq!(host.commit_comments(), vec![
            permissions::INSUFFICIENT_CREDENTIALS_COMMENT.to_string()
        ]);
        assert_eq!(host.issue_comments(), vec![comments::ALLOW_LIST_UNAVAILABLE_BODY.to_string()]);
    }

    #[tokio::test]
    async fn rejected_submission_comments_and_keeps_build() {
        let host = RecordingHost::new().with_file(".taskcluster.yml", SHA, CONFIG);
        let queue = ScriptedQueue::new().rejecting_submissions();
        let harness = Harness::new(host.clone(), queue).await;
        let outcome = process_job_event(&harness.context, pull_request("mozilla.org")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Commented);
        let comments = host.issue_comments();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].contains("client lacks scopes"));
        assert_eq!(harness.store.build_count(), 1);
        assert!(harness.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn release_resolves_tag() {
        let config = "version: 0\ntasks:\n  - extra:\n      github:\n        events: [release]\n";
        let host = RecordingHost::new()
            .with_tag("v1.0.0", SHA)
            .with_file(".taskcluster.yml", SHA, config);
        let queue = ScriptedQueue::new();
        let harness = Harness::new(host, queue.clone()).await;
        let release = event("release", &[
            (details::VERSION, "v1.0.0"),
            (details::HEAD_TAG, "v1.0.0"),
            (details::BASE_REPO_BRANCH, "main"),
        ]);
        let outcome = process_job_event(&harness.context, release).await.unwrap();
        let JobOutcome::Submitted { task_group_id } = outcome else {
            panic!("expected submission, got {outcome:?}");
        };
        assert_eq!(harness.store.load_build(&task_group_id).await.unwrap().sha, SHA);
        assert_eq!(queue.submissions().len(), 1);
    }

    #[tokio::test]
    async fn unknown_tag_is_fatal() {
        let host = RecordingHost::new();
        let harness = Harness::new(host, ScriptedQueue::new()).await;
        let release = event("release", &[(details::VERSION, "v9")]);
        assert!(process_job_event(&harness.context, release).await.is_err());
    }

    fn sample_build() -> Build {
        let now = UtcDateTime::now();
        Build {
            organization: "mozilla".to_string(),
            repository: "app".to_string(),
            sha: SHA.to_string(),
            task_group_id: "g1".to_string(),
            state: BuildState::Queued,
            installation_id: 5828,
            event_type: "push".to_string(),
            event_id: "delivery-1".to_string(),
            created: now,
            updated: now,
        }
    }

    #[tokio::test]
    async fn duplicate_build_is_verified() {
        let harness = Harness::new(RecordingHost::new(), ScriptedQueue::new()).await;
        let mut event = push("main");
        event.organization = "mozilla".to_string();
        event.repository = "app".to_string();
        harness.store.create_build(&sample_build()).await.unwrap();

        record_build(&harness.context, &event, SHA, "g1").await.unwrap();
        assert_eq!(harness.store.build_count(), 1);

        event.event_id = "delivery-2".to_string();
        let err = record_build(&harness.context, &event, SHA, "g1").await.unwrap_err();
        let violation = err.downcast_ref::<ConsistencyViolation>().unwrap();
        assert_eq!(violation.field, "event id");
        assert_eq!(harness.store.build_count(), 1);
    }
}
