use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use apalis::prelude::*;
use apalis_codec::json::JsonCodec;
use apalis_sqlite::{CompactType, SqliteStorage, fetcher::SqliteFetcher};
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, migrate::MigrateDatabase};
use taskhook_core::{config::DbConfig, models::EventContext};

use crate::{
    Publisher,
    messages::{InboundMessage, TaskGroupDefined},
};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Stream {
    Job,
    TaskGroupDefined,
    TaskDefined,
    Status,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::TaskGroupDefined => "task-group-defined",
            Self::TaskDefined => "task-defined",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Type alias for the default codec used by SqliteStorage.
type DefaultCodec = JsonCodec<CompactType>;

/// Code-host events waiting for the job orchestrator.
pub type EventStorage = SqliteStorage<EventContext, DefaultCodec, SqliteFetcher>;

/// Task-platform messages. One queue per stream, all sharing the same payload type.
pub type MessageStorage = SqliteStorage<InboundMessage, DefaultCodec, SqliteFetcher>;

/// Storage handles for pushing messages from request handlers and job handlers.
#[derive(Clone)]
pub struct JobStorage {
    pub(crate) events: EventStorage,
    pub(crate) task_group_defined: MessageStorage,
    pub(crate) task_defined: MessageStorage,
    pub(crate) status: MessageStorage,
}

impl JobStorage {
    /// Set up job storage tables and create storage instances.
    pub async fn setup(db: &DbConfig) -> Result<Arc<Self>> {
        if !Sqlite::database_exists(&db.jobs_url).await.unwrap_or(false) {
            tracing::info!(url = %db.jobs_url, "Creating database");
            Sqlite::create_database(&db.jobs_url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&db.jobs_url).await.context("Failed to connect to database")?;
        Self::with_pool(&pool).await
    }

    pub async fn with_pool(pool: &SqlitePool) -> Result<Arc<Self>> {
        SqliteStorage::setup(pool).await.context("Failed to set up job tables")?;
        Ok(Arc::new(Self {
            events: create_storage(pool, Stream::Job),
            task_group_defined: create_storage(pool, Stream::TaskGroupDefined),
            task_defined: create_storage(pool, Stream::TaskDefined),
            status: create_storage(pool, Stream::Status),
        }))
    }

    /// Queue a normalized code-host event for the job orchestrator.
    pub async fn push_job(&self, event: EventContext) -> Result<()> {
        let mut storage = self.events.clone();
        storage.push(event).await.context("Failed to enqueue job")?;
        Ok(())
    }

    /// Queue a relayed task-platform message on the stream that handles it.
    pub async fn push_inbound(&self, message: InboundMessage) -> Result<()> {
        let stream = message.stream();
        let mut storage = match &message {
            InboundMessage::TaskGroupDefined(_) => self.task_group_defined.clone(),
            InboundMessage::TaskDefined(_) => self.task_defined.clone(),
            InboundMessage::TaskFailed(_)
            | InboundMessage::TaskException(_)
            | InboundMessage::TaskGroupResolved(_) => self.status.clone(),
        };
        storage.push(message).await.with_context(|| format!("Failed to enqueue {stream} message"))?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for JobStorage {
    async fn publish_task_group_defined(&self, task_group_id: &str) -> Result<()> {
        let message = TaskGroupDefined { task_group_id: task_group_id.to_string() };
        self.push_inbound(InboundMessage::TaskGroupDefined(message)).await
    }
}

fn create_storage<T>(pool: &SqlitePool, stream: Stream) -> SqliteStorage<T, DefaultCodec, SqliteFetcher> {
    let config = apalis_sqlite::Config::new(stream.as_str()).with_poll_interval(
        StrategyBuilder::new()
            .apply(
                IntervalStrategy::new(Duration::from_millis(100))
                    .with_backoff(BackoffConfig::new(Duration::from_secs(1))),
            )
            .build(),
    );
    SqliteStorage::new_with_config(pool, &config)
}

#[cfg(test)]
pub(crate) async fn memory_storage() -> Arc<JobStorage> {
    // A single connection keeps every query on the same in-memory database
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    JobStorage::with_pool(&pool).await.unwrap()
}
