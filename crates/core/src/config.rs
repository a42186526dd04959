use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub github: GitHubConfig,
    pub taskcluster: TaskclusterConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub intree: IntreeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    /// Entity store (builds and check runs).
    pub url: String,
    /// Durable message queue.
    pub jobs_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub app: GitHubAppConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubAppConfig {
    pub id: u64,
    pub webhook_secret: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskclusterConfig {
    pub root_url: Url,
    pub scheduler_id: String,
    pub credentials: TaskclusterCredentials,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskclusterCredentials {
    pub client_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Label used for commit statuses and check runs.
    pub status_context: String,
    /// Task routes are matched against `route.<check_task_route>`.
    pub check_task_route: String,
    /// Shared secret for the task event relay.
    pub relay_secret: String,
    /// In-repository pipeline file.
    pub config_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            status_context: "Taskcluster".to_string(),
            check_task_route: "checks".to_string(),
            relay_secret: String::new(),
            config_path: ".taskcluster.yml".to_string(),
        }
    }
}

/// Values exposed to legacy (version 0) templates.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IntreeConfig {
    pub provisioner_id: String,
    pub worker_type: String,
}

impl Default for IntreeConfig {
    fn default() -> Self {
        Self { provisioner_id: "aws-provisioner-v1".to_string(), worker_type: "github-worker".to_string() }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub job_concurrency: usize,
    pub group_defined_concurrency: usize,
    pub task_defined_concurrency: usize,
    pub status_concurrency: usize,
    pub retry_attempts: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_concurrency: 4,
            group_defined_concurrency: 4,
            task_defined_concurrency: 8,
            status_concurrency: 8,
            retry_attempts: 5,
        }
    }
}
