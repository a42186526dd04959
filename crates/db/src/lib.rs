pub mod memory;
mod store;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
pub use store::{BuildModifier, BuildUpdate, EntityStore, StoreError, StoreResult};
use sqlx::{Pool, Row, Sqlite, SqlitePool, migrate::MigrateDatabase, sqlite::SqliteRow};
use taskhook_core::{
    config::DbConfig,
    models::{Build, BuildState, CheckRun},
};
use time::{PrimitiveDateTime, UtcDateTime, macros::format_description};

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

// Attempts before giving up on a contended modify
const MODIFY_ATTEMPTS: usize = 10;

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) { self.pool.close().await }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|e| e.is_unique_violation())
}

fn build_from_row(row: &SqliteRow) -> Result<Build> {
    let state: String = row.try_get("state")?;
    let installation_id: i64 = row.try_get("installation_id")?;
    Ok(Build {
        organization: row.try_get("organization")?,
        repository: row.try_get("repository")?,
        sha: row.try_get("sha")?,
        task_group_id: row.try_get("task_group_id")?,
        state: state.parse().map_err(|_| anyhow!("Unknown build state {state}"))?,
        installation_id: installation_id as u64,
        event_type: row.try_get("event_type")?,
        event_id: row.try_get("event_id")?,
        created: from_primitive_date_time(row.try_get("created_at")?)?,
        updated: from_primitive_date_time(row.try_get("updated_at")?)?,
    })
}

fn check_run_from_row(row: &SqliteRow) -> Result<CheckRun> {
    let check_suite_id: i64 = row.try_get("check_suite_id")?;
    let check_run_id: i64 = row.try_get("check_run_id")?;
    Ok(CheckRun {
        task_group_id: row.try_get("task_group_id")?,
        task_id: row.try_get("task_id")?,
        check_suite_id: check_suite_id as u64,
        check_run_id: check_run_id as u64,
    })
}

#[async_trait]
impl EntityStore for Database {
    async fn create_build(&self, build: &Build) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO builds (task_group_id, organization, repository, sha, state, installation_id,
                                event_type, event_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&build.task_group_id)
        .bind(&build.organization)
        .bind(&build.repository)
        .bind(&build.sha)
        .bind(build.state.as_str())
        .bind(build.installation_id as i64)
        .bind(&build.event_type)
        .bind(&build.event_id)
        .bind(to_primitive_date_time(build.created))
        .bind(to_primitive_date_time(build.updated))
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::build_exists(&build.task_group_id)),
            Err(e) => Err(anyhow::Error::from(e).context("Failed to insert build").into()),
        }
    }

    async fn load_build(&self, task_group_id: &str) -> StoreResult<Build> {
        let row = sqlx::query("SELECT * FROM builds WHERE task_group_id = ?")
            .bind(task_group_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch build")?;
        match row {
            Some(row) => Ok(build_from_row(&row)?),
            None => Err(StoreError::build_missing(task_group_id)),
        }
    }

    async fn modify_build(
        &self,
        task_group_id: &str,
        modify: BuildModifier<'_>,
    ) -> StoreResult<BuildUpdate> {
        for _ in 0..MODIFY_ATTEMPTS {
            let current = self.load_build(task_group_id).await?;
            let mut build = current.clone();
            modify(&mut build);
            // Key fields are immutable
            let build = Build { state: build.state, updated: build.updated, ..current.clone() };
            let result = sqlx::query(
                r#"
                UPDATE builds SET state = ?, updated_at = ?
                WHERE task_group_id = ? AND state = ? AND updated_at = ?
                "#,
            )
            .bind(build.state.as_str())
            .bind(to_primitive_date_time(build.updated))
            .bind(task_group_id)
            .bind(current.state.as_str())
            .bind(to_primitive_date_time(current.updated))
            .execute(&self.pool)
            .await
            .context("Failed to update build")?;
            if result.rows_affected() == 1 {
                return Ok(BuildUpdate { previous: current.state, build });
            }
            tracing::debug!("Build {} modified concurrently, retrying", task_group_id);
        }
        Err(anyhow!("Build {task_group_id} is too contended to modify").into())
    }

    async fn create_check_run(&self, check_run: &CheckRun) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO check_runs (task_group_id, task_id, check_suite_id, check_run_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&check_run.task_group_id)
        .bind(&check_run.task_id)
        .bind(check_run.check_suite_id as i64)
        .bind(check_run.check_run_id as i64)
        .bind(to_primitive_date_time(UtcDateTime::now()))
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::check_run_exists(&check_run.task_group_id, &check_run.task_id))
            }
            Err(e) => Err(anyhow::Error::from(e).context("Failed to insert check run").into()),
        }
    }

    async fn load_check_run(&self, task_group_id: &str, task_id: &str) -> StoreResult<CheckRun> {
        let row = sqlx::query("SELECT * FROM check_runs WHERE task_group_id = ? AND task_id = ?")
            .bind(task_group_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch check run")?;
        match row {
            Some(row) => Ok(check_run_from_row(&row)?),
            None => Err(StoreError::check_run_missing(task_group_id, task_id)),
        }
    }

    async fn list_check_runs(&self, task_group_id: &str) -> StoreResult<Vec<CheckRun>> {
        let rows = sqlx::query("SELECT * FROM check_runs WHERE task_group_id = ? ORDER BY task_id")
            .bind(task_group_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch check runs")?;
        Ok(rows.iter().map(check_run_from_row).collect::<Result<Vec<_>>>()?)
    }
}

fn to_primitive_date_time(date: UtcDateTime) -> String {
    date.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_default()
}

fn from_primitive_date_time(value: String) -> Result<UtcDateTime> {
    let date = PrimitiveDateTime::parse(
        &value,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .with_context(|| format!("Invalid timestamp {value}"))?;
    Ok(date.as_utc())
}
