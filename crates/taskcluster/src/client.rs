use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{Method, header::AUTHORIZATION};
use serde::Deserialize;
use serde_json::{Value, json};
use taskhook_core::{config::TaskclusterConfig, util::UrlExt};
use time::UtcDateTime;
use tracing::debug;
use url::Url;

use crate::{
    QueueError, TaskGroupPage, TaskQueue, TaskStatus,
    hawk::{self, Credentials},
};

/// Queue service client signing every request with the configured credentials.
pub struct QueueClient {
    http: reqwest::Client,
    root_url: Url,
    client_id: String,
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEntry {
    status: TaskStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    tasks: Vec<ListEntry>,
    continuation_token: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl QueueClient {
    pub fn new(config: &TaskclusterConfig) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("taskhook/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Arc::new(Self {
            http,
            root_url: config.root_url.clone(),
            client_id: config.credentials.client_id.clone(),
            access_token: config.credentials.access_token.clone(),
        }))
    }

    fn endpoint(&self, path: &str) -> Url {
        self.root_url.with_path(&format!("api/queue/v1/{path}"))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        authorized_scopes: Option<&[String]>,
    ) -> Result<reqwest::Response, QueueError> {
        let ext = match authorized_scopes {
            Some(scopes) => {
                let ext = serde_json::to_vec(&json!({ "authorizedScopes": scopes }))
                    .context("Failed to encode authorized scopes")?;
                Some(STANDARD.encode(ext))
            }
            None => None,
        };
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let header = hawk::authorization(
            &Credentials { id: &self.client_id, key: &self.access_token },
            method.as_str(),
            &url,
            UtcDateTime::now().unix_timestamp(),
            &nonce[..12],
            ext.as_deref(),
        );
        debug!("{} {}", method, url);
        let mut request = self.http.request(method, url).header(AUTHORIZATION, header);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or(text);
        Err(QueueError::Rejected { status: status.as_u16(), message })
    }
}

#[async_trait]
impl TaskQueue for QueueClient {
    async fn create_task(
        &self,
        task_id: &str,
        task: &Value,
        authorized_scopes: &[String],
    ) -> Result<(), QueueError> {
        let url = self.endpoint(&format!("task/{task_id}"));
        self.send(Method::PUT, url, Some(task), Some(authorized_scopes)).await?;
        Ok(())
    }

    async fn list_task_group(
        &self,
        task_group_id: &str,
        continuation: Option<&str>,
    ) -> Result<TaskGroupPage, QueueError> {
        let mut url = self.endpoint(&format!("task-group/{task_group_id}/list"));
        if let Some(token) = continuation {
            url.query_pairs_mut().append_pair("continuationToken", token);
        }
        let response: ListResponse = self.send(Method::GET, url, None, None).await?.json().await?;
        Ok(TaskGroupPage {
            tasks: response.tasks.into_iter().map(|entry| entry.status).collect(),
            continuation_token: response.continuation_token,
        })
    }
}
