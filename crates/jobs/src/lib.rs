mod jobs;
pub mod messages;
mod storage;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use apalis::{
    layers::retry::{
        HasherRng, RetryPolicy,
        backoff::{ExponentialBackoffMaker, MakeBackoff},
    },
    prelude::*,
};
use async_trait::async_trait;
pub use jobs::{
    ConsistencyViolation, JobOutcome, process_group_resolved, process_job_event,
    process_task_defined, process_task_failure, process_task_group_defined,
};
use messages::InboundMessage;
pub use storage::{EventStorage, JobStorage, MessageStorage, Stream};
use taskhook_core::{
    config::{Config, WorkerConfig},
    models::EventContext,
};
use taskhook_db::EntityStore;
use taskhook_github::Installations;
use taskhook_intree::Compiler;
use taskhook_taskcluster::TaskQueue;
use tracing::Instrument;

/// Shared context available to all job handlers.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn EntityStore>,
    pub github: Arc<dyn Installations>,
    pub queue: Arc<dyn TaskQueue>,
    pub compiler: Compiler,
    pub publisher: Arc<dyn Publisher>,
}

/// Announces submitted task groups to the status workers.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_task_group_defined(&self, task_group_id: &str) -> Result<()>;
}

/// Process a queued code-host event.
pub async fn process_event_job(
    event: EventContext,
    ctx: Data<JobContext>,
) -> Result<(), BoxDynError> {
    let span = tracing::info_span!("job", event_id = %event.event_id);
    let outcome = process_job_event(&ctx, event).instrument(span).await.map_err(task_error)?;
    tracing::debug!("Job finished: {outcome:?}");
    Ok(())
}

/// Process a queued task-platform message.
pub async fn process_message_job(
    message: InboundMessage,
    ctx: Data<JobContext>,
) -> Result<(), BoxDynError> {
    let span = tracing::info_span!("reconcile", task_group_id = %message.task_group_id());
    dispatch(&ctx, &message).instrument(span).await.map_err(task_error)
}

async fn dispatch(ctx: &JobContext, message: &InboundMessage) -> Result<()> {
    match message {
        InboundMessage::TaskGroupDefined(m) => process_task_group_defined(ctx, &m.task_group_id).await,
        InboundMessage::TaskDefined(e) => process_task_defined(ctx, e).await,
        InboundMessage::TaskFailed(e) | InboundMessage::TaskException(e) => {
            process_task_failure(ctx, e).await
        }
        InboundMessage::TaskGroupResolved(e) => process_group_resolved(ctx, e).await,
    }
}

/// Errors that retrying cannot fix.
pub fn is_permanent(err: &anyhow::Error) -> bool { err.is::<ConsistencyViolation>() }

/// Permanent errors abort the task instead of scheduling a retry.
fn task_error(err: anyhow::Error) -> BoxDynError {
    if is_permanent(&err) {
        tracing::error!("Aborting: {err:#}");
        Box::new(AbortError::new(err))
    } else {
        err.into()
    }
}

/// Create the job monitor with all workers.
pub fn create_monitor(
    storage: Arc<JobStorage>,
    context: JobContext,
    config: &WorkerConfig,
) -> Monitor {
    let &WorkerConfig {
        job_concurrency,
        group_defined_concurrency,
        task_defined_concurrency,
        status_concurrency,
        retry_attempts,
    } = config;

    let backoff = ExponentialBackoffMaker::new(
        Duration::from_secs(1),
        Duration::from_secs(120),
        1.25,
        HasherRng::default(),
    )
    .expect("Invalid retry backoff")
    .make_backoff();
    let retry_policy = RetryPolicy::retries(retry_attempts)
        .with_backoff(backoff)
        .retry_if(|e: &BoxDynError| e.downcast_ref::<AbortError>().is_none());

    let (storage1, storage2, storage3, storage4) =
        (storage.clone(), storage.clone(), storage.clone(), storage);
    let (ctx1, ctx2, ctx3, ctx4) = (context.clone(), context.clone(), context.clone(), context);
    let (retry1, retry2, retry3, retry4) =
        (retry_policy.clone(), retry_policy.clone(), retry_policy.clone(), retry_policy);

    Monitor::new()
        .register(move |_| {
            WorkerBuilder::new("job-worker")
                .backend(storage1.events.clone())
                .retry(retry1.clone())
                .enable_tracing()
                .catch_panic()
                .concurrency(job_concurrency.max(1))
                .data(ctx1.clone())
                .build(process_event_job)
        })
        .register(move |_| {
            WorkerBuilder::new("task-group-defined-worker")
                .backend(storage2.task_group_defined.clone())
                .retry(retry2.clone())
                .enable_tracing()
                .catch_panic()
                .concurrency(group_defined_concurrency.max(1))
                .data(ctx2.clone())
                .build(process_message_job)
        })
        .register(move |_| {
            WorkerBuilder::new("task-defined-worker")
                .backend(storage3.task_defined.clone())
                .retry(retry3.clone())
                .enable_tracing()
                .catch_panic()
                .concurrency(task_defined_concurrency.max(1))
                .data(ctx3.clone())
                .build(process_message_job)
        })
        .register(move |_| {
            WorkerBuilder::new("status-worker")
                .backend(storage4.status.clone())
                .retry(retry4.clone())
                .enable_tracing()
                .catch_panic()
                .concurrency(status_concurrency.max(1))
                .data(ctx4.clone())
                .build(process_message_job)
        })
        .shutdown_timeout(Duration::from_secs(30))
}


#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use taskhook_github::testing::RecordingHost;
    use taskhook_taskcluster::testing::ScriptedQueue;

    use super::*;
    use crate::{
        messages::TaskGroupDefined,
        testing::{Harness, SHA},
    };

    #[tokio::test]
    async fn published_group_gets_initial_status() {
        let config = "version: 0\ntasks:\n  - extra:\n      github:\n        events: [push]\n";
        let host = RecordingHost::new().with_file(".taskcluster.yml", SHA, config);
        let harness = Harness::new(host.clone(), ScriptedQueue::new()).await;

        let mut details = std::collections::BTreeMap::new();
        details.insert("event.type".to_string(), "push".to_string());
        details.insert("event.head.sha".to_string(), SHA.to_string());
        details.insert("event.base.repo.branch".to_string(), "main".to_string());
        let event = EventContext {
            organization: "mozilla".to_string(),
            repository: "app".to_string(),
            installation_id: 7,
            event_id: "delivery".to_string(),
            details,
        };
        process_job_event(&harness.context, event).await.unwrap();
        assert_eq!(harness.store.build_count(), 1);

        let published = harness.publisher.published();
        assert_eq!(published.len(), 1);
        let message = InboundMessage::TaskGroupDefined(TaskGroupDefined {
            task_group_id: published[0].clone(),
        });
        dispatch(&harness.context, &message).await.unwrap();
        let statuses = host.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, "pending");
        let build = harness.store.load_build(&published[0]).await.unwrap();
        assert_eq!(build.installation_id, 7);
    }

    #[tokio::test]
    async fn monitor_covers_every_stream() {
        let harness = Harness::new(RecordingHost::new(), ScriptedQueue::new()).await;
        let storage = crate::storage::memory_storage().await;
        let config = WorkerConfig { retry_attempts: 3, ..WorkerConfig::default() };
        let _monitor = create_monitor(storage, harness.context.clone(), &config);
    }

    #[test]
    fn consistency_violations_abort() {
        let violation = ConsistencyViolation {
            task_group_id: "g1".to_string(),
            field: "sha",
            stored: "a".to_string(),
            incoming: "b".to_string(),
        };
        let err = task_error(anyhow::Error::new(violation).context("Failed to record build"));
        assert!(err.downcast_ref::<AbortError>().is_some());

        let err = task_error(anyhow!("GitHub returned 502 Bad Gateway"));
        assert!(err.downcast_ref::<AbortError>().is_none());
    }
}
