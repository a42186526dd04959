//! Reconciles task-platform signals onto the code host.

use std::collections::HashMap;

use anyhow::{Context, Result};
use taskhook_core::{
    models::{Build, BuildState, CheckRun},
    util::{task_details_url, task_group_url},
};
use taskhook_db::StoreError;
use taskhook_github::{CheckRunCompletion, CodeHost, CommitStatus, NewCheckRun};
use taskhook_taskcluster::{TaskState, list_task_group_all};
use time::UtcDateTime;

use super::comments::{self, Target};
use crate::{
    JobContext,
    messages::{TaskEvent, TaskGroupEvent},
};

fn status_context(ctx: &JobContext, build: &Build) -> String {
    format!("{} ({})", ctx.config.app.status_context, build.event_prefix())
}

fn commit_target(build: &Build) -> Target<'_> {
    Target {
        organization: &build.organization,
        repository: &build.repository,
        sha: &build.sha,
        pull_number: None,
    }
}

async fn installation(ctx: &JobContext, build: &Build) -> Result<Box<dyn CodeHost>> {
    ctx.github
        .installation(build.installation_id)
        .await
        .with_context(|| format!("Failed to authenticate as installation {}", build.installation_id))
}

/// Posts the initial pending status for a newly submitted group.
pub async fn process_task_group_defined(ctx: &JobContext, task_group_id: &str) -> Result<()> {
    let build = ctx.store.load_build(task_group_id).await?;
    if build.state != BuildState::Queued {
        tracing::debug!("Task group {task_group_id} already resolved as {}", build.state);
        return Ok(());
    }
    tracing::info!(
        "Task group {task_group_id} defined for {}/{}@{}",
        build.organization,
        build.repository,
        build.sha
    );
    let host = installation(ctx, &build).await?;
    let status = CommitStatus {
        state: build.state.status_state().to_string(),
        target_url: Some(task_group_url(&ctx.config.taskcluster.root_url, task_group_id).into()),
        description: format!("TaskGroup: Pending (for {})", build.event_type),
        context: status_context(ctx, &build),
    };
    host.create_status(&build.organization, &build.repository, &build.sha, &status)
        .await
        .context("Failed to create initial status")?;
    Ok(())
}

/// Creates the check run for a task routed to this integration.
///
/// Failures are reported on the commit before being returned, since nothing
/// else would surface a missing check.
pub async fn process_task_defined(ctx: &JobContext, event: &TaskEvent) -> Result<()> {
    let TaskEvent { task_group_id, task_id } = event;
    let build = ctx.store.load_build(task_group_id).await?;
    match ctx.store.load_check_run(task_group_id, task_id).await {
        Ok(_) => {
            tracing::debug!("Check run for {task_group_id}/{task_id} already exists");
            return Ok(());
        }
        Err(StoreError::NotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let host = installation(ctx, &build).await?;
    let host = host.as_ref();
    let root_url = &ctx.config.taskcluster.root_url;
    let check_run = NewCheckRun {
        name: format!("Task {task_id}: {}", status_context(ctx, &build)),
        head_sha: build.sha.clone(),
        details_url: task_details_url(root_url, task_group_id, task_id).into(),
        title: format!("TaskGroup: Queued (for {})", build.event_type),
        summary: format!("Check for {}", build.event_type),
    };
    let result = host.create_check_run(&build.organization, &build.repository, &check_run).await;
    let created = match result {
        Ok(created) => created,
        Err(e) => {
            let e = anyhow::Error::new(e).context("Failed to create check run");
            report(host, &build, &e).await;
            return Err(e);
        }
    };
    let record = CheckRun {
        task_group_id: task_group_id.clone(),
        task_id: task_id.clone(),
        check_suite_id: created.check_suite_id,
        check_run_id: created.id,
    };
    match ctx.store.create_check_run(&record).await {
        Ok(()) | Err(StoreError::AlreadyExists { .. }) => {}
        Err(e) => {
            let e = anyhow::Error::new(e).context("Failed to record check run");
            report(host, &build, &e).await;
            return Err(e);
        }
    }
    tracing::info!("Created check run {} for {task_group_id}/{task_id}", created.id);
    Ok(())
}

async fn report(host: &dyn CodeHost, build: &Build, error: &anyhow::Error) {
    if let Err(e) = comments::post_exception(host, &commit_target(build), &format!("{error:#}")).await {
        tracing::error!("Failed to report error on {}: {e:#}", build.sha);
    }
}

/// A failed or excepted task fails its group immediately.
pub async fn process_task_failure(ctx: &JobContext, event: &TaskEvent) -> Result<()> {
    let TaskEvent { task_group_id, task_id } = event;
    let build = ctx.store.load_build(task_group_id).await?;
    let host = installation(ctx, &build).await?;
    let host = host.as_ref();
    let build = record_verdict(ctx, host, build, BuildState::Failure).await?;
    match ctx.store.load_check_run(task_group_id, task_id).await {
        Ok(check_run) => complete_check_run(host, &build, &check_run, "failure").await,
        Err(StoreError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A resolved group succeeds only if none of its tasks failed. The full
/// listing is read before deciding, then every recorded check run is
/// completed with the state of its task.
pub async fn process_group_resolved(ctx: &JobContext, event: &TaskGroupEvent) -> Result<()> {
    let task_group_id = &event.task_group_id;
    let tasks = list_task_group_all(ctx.queue.as_ref(), task_group_id)
        .await
        .with_context(|| format!("Failed to list task group {task_group_id}"))?;
    let failed = tasks.iter().any(|t| matches!(t.state, TaskState::Failed | TaskState::Exception));
    let verdict = if failed { BuildState::Failure } else { BuildState::Success };
    tracing::debug!("Task group {task_group_id} resolved with {} task(s): {verdict}", tasks.len());

    let build = ctx.store.load_build(task_group_id).await?;
    let host = installation(ctx, &build).await?;
    let host = host.as_ref();
    let build = record_verdict(ctx, host, build, verdict).await?;

    let states: HashMap<&str, TaskState> =
        tasks.iter().map(|t| (t.task_id.as_str(), t.state)).collect();
    for check_run in ctx.store.list_check_runs(task_group_id).await? {
        let conclusion = match states.get(check_run.task_id.as_str()) {
            Some(TaskState::Completed) => "success",
            Some(TaskState::Failed | TaskState::Exception) => "failure",
            _ => continue,
        };
        complete_check_run(host, &build, &check_run, conclusion).await?;
    }
    Ok(())
}

/// State a build moves to when `verdict` arrives. Failure is final.
fn next_state(current: BuildState, verdict: BuildState) -> BuildState {
    if current == BuildState::Failure { current } else { verdict }
}

/// Moves the build to `verdict` and posts the matching commit status.
///
/// The status is posted before the state is stored: if posting fails the
/// message is retried against the unchanged build.
async fn record_verdict(
    ctx: &JobContext,
    host: &dyn CodeHost,
    build: Build,
    verdict: BuildState,
) -> Result<Build> {
    let task_group_id = build.task_group_id.clone();
    let target = next_state(build.state, verdict);
    if target == build.state {
        tracing::debug!("Task group {task_group_id} already {target}, not updating status");
        return Ok(build);
    }
    post_status(ctx, host, &build, target).await?;

    let update = ctx
        .store
        .modify_build(&task_group_id, &|build: &mut Build| {
            let next = next_state(build.state, verdict);
            if next != build.state {
                build.state = next;
                build.updated = UtcDateTime::now();
            }
        })
        .await?;
    if !update.changed() {
        tracing::debug!("Task group {task_group_id} was already {}", update.previous);
    }
    let build = update.build;
    if build.state != target {
        // Another verdict was stored first; it owns the status
        post_status(ctx, host, &build, build.state).await?;
    }
    tracing::info!(
        "Task group {task_group_id} is now {} for {}/{}@{}",
        build.state,
        build.organization,
        build.repository,
        build.sha
    );
    Ok(build)
}

async fn post_status(
    ctx: &JobContext,
    host: &dyn CodeHost,
    build: &Build,
    state: BuildState,
) -> Result<()> {
    let status = CommitStatus {
        state: state.status_state().to_string(),
        target_url: Some(
            task_group_url(&ctx.config.taskcluster.root_url, &build.task_group_id).into(),
        ),
        description: format!("TaskGroup: {state}"),
        context: status_context(ctx, build),
    };
    host.create_status(&build.organization, &build.repository, &build.sha, &status)
        .await
        .context("Failed to update status")
}

async fn complete_check_run(
    host: &dyn CodeHost,
    build: &Build,
    check_run: &CheckRun,
    conclusion: &str,
) -> Result<()> {
    let completion = CheckRunCompletion {
        conclusion: conclusion.to_string(),
        title: format!("TaskGroup: {}", build.state),
        summary: format!("Task {} {conclusion}", check_run.task_id),
    };
    host.complete_check_run(&build.organization, &build.repository, check_run.check_run_id, &completion)
        .await
        .with_context(|| format!("Failed to complete check run for task {}", check_run.task_id))
}
