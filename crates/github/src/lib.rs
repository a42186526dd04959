pub mod permissions;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod webhook;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use http::StatusCode;
use octocrab::{Octocrab, models::InstallationId};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use taskhook_core::{config::GitHubAppConfig, util::truncate_error_body};
use thiserror::Error;

/// Error kinds surfaced by the code host.
#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CodeHostResult<T> = Result<T, CodeHostError>;

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CommitStatus {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub description: String,
    pub context: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewCheckRun {
    pub name: String,
    pub head_sha: String,
    pub details_url: String,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CheckRunRef {
    pub id: u64,
    pub check_suite_id: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CheckRunCompletion {
    /// `success` or `failure`
    pub conclusion: String,
    pub title: String,
    pub summary: String,
}

/// Operations used against a single installation.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Contents of `path` at `reference`.
    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> CodeHostResult<String>;

    /// Commit sha a tag points to, following annotated tags.
    async fn resolve_tag(&self, owner: &str, repo: &str, tag: &str) -> CodeHostResult<String>;

    /// `Ok` if `login` is a member of `org`, [`CodeHostError::NotFound`] otherwise.
    async fn check_org_membership(&self, org: &str, login: &str) -> CodeHostResult<()>;

    /// `Ok` if `login` is a collaborator, [`CodeHostError::NotFound`] otherwise.
    /// [`CodeHostError::Forbidden`] means the installation cannot list collaborators.
    async fn check_collaborator(&self, owner: &str, repo: &str, login: &str) -> CodeHostResult<()>;

    async fn create_commit_comment(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        body: &str,
    ) -> CodeHostResult<()>;

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> CodeHostResult<()>;

    async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> CodeHostResult<()>;

    async fn create_check_run(
        &self,
        owner: &str,
        repo: &str,
        check_run: &NewCheckRun,
    ) -> CodeHostResult<CheckRunRef>;

    async fn complete_check_run(
        &self,
        owner: &str,
        repo: &str,
        check_run_id: u64,
        completion: &CheckRunCompletion,
    ) -> CodeHostResult<()>;
}

/// Issues installation-scoped clients.
///
/// A client is acquired at the start of a handler invocation and dropped at
/// its end, never cached or shared between handlers.
#[async_trait]
pub trait Installations: Send + Sync {
    async fn installation(&self, installation_id: u64) -> Result<Box<dyn CodeHost>>;
}

/// GitHub App authenticated with its private key.
pub struct GitHubApp {
    app_client: Octocrab,
}

impl GitHubApp {
    pub fn new(config: &GitHubAppConfig) -> Result<Arc<Self>> {
        let app_client = Octocrab::builder()
            .app(
                config.id.into(),
                jsonwebtoken::EncodingKey::from_rsa_pem(config.private_key.as_bytes())
                    .context("Invalid GitHub App private key")?,
            )
            .build()
            .context("Failed to create GitHub client")?;
        tracing::info!("Configured GitHub App {}", config.id);
        Ok(Arc::new(Self { app_client }))
    }
}

#[async_trait]
impl Installations for GitHubApp {
    async fn installation(&self, installation_id: u64) -> Result<Box<dyn CodeHost>> {
        let client = self
            .app_client
            .installation(InstallationId(installation_id))
            .with_context(|| format!("Failed to create client for installation {installation_id}"))?;
        Ok(Box::new(InstallationClient { client }))
    }
}

pub struct InstallationClient {
    client: Octocrab,
}

fn map_error(err: octocrab::Error) -> CodeHostError {
    match err {
        octocrab::Error::GitHub { source, .. } => {
            let message = truncate_error_body(&source.message);
            match source.status_code {
                StatusCode::NOT_FOUND => CodeHostError::NotFound(message),
                StatusCode::FORBIDDEN => CodeHostError::Forbidden(message),
                status => CodeHostError::Other(anyhow!("GitHub returned {status}: {message}")),
            }
        }
        err => CodeHostError::Other(err.into()),
    }
}

#[derive(Deserialize)]
struct ContentFile {
    content: Option<String>,
    encoding: Option<String>,
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct CreatedCheckRun {
    id: u64,
    check_suite: Option<CheckSuite>,
}

#[derive(Deserialize)]
struct CheckSuite {
    id: u64,
}

// Annotated tags may point at other tags
const MAX_TAG_DEPTH: usize = 8;

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Escapes a single route segment.
fn segment(value: &str) -> String { utf8_percent_encode(value, SEGMENT).to_string() }

/// Escapes each segment of a slash separated path, keeping the slashes.
fn segments(value: &str) -> String { value.split('/').map(segment).collect::<Vec<_>>().join("/") }

/// Outcome of a presence check for the given response status, if it is one.
fn presence(status: StatusCode, route: &str) -> Option<CodeHostResult<()>> {
    match status {
        status if status.is_success() => Some(Ok(())),
        // Organizations redirect requesters who cannot see private membership
        StatusCode::NOT_FOUND | StatusCode::FOUND => {
            Some(Err(CodeHostError::NotFound(route.to_string())))
        }
        StatusCode::FORBIDDEN => Some(Err(CodeHostError::Forbidden(route.to_string()))),
        _ => None,
    }
}

impl InstallationClient {
    /// GET an endpoint that answers 204, 302 or 404 without a body.
    async fn check_presence(&self, route: &str) -> CodeHostResult<()> {
        let response = self.client._get(route).await.map_err(map_error)?;
        match presence(response.status(), route) {
            Some(result) => result,
            None => octocrab::map_github_error(response).await.map(drop).map_err(map_error),
        }
    }
}

#[async_trait]
impl CodeHost for InstallationClient {
    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> CodeHostResult<String> {
        let file: ContentFile = self
            .client
            .get(format!("/repos/{}/{}/contents/{}", segment(owner), segment(repo), segments(path)), Some(&[("ref", reference)]))
            .await
            .map_err(map_error)?;
        let (Some(content), Some("base64")) = (file.content, file.encoding.as_deref()) else {
            return Err(anyhow!("{path} in {owner}/{repo}@{reference} is not a file").into());
        };
        let bytes = STANDARD
            .decode(content.replace(['\n', '\r'], ""))
            .with_context(|| format!("Failed to decode {path}"))?;
        Ok(String::from_utf8(bytes).with_context(|| format!("{path} is not valid UTF-8"))?)
    }

    async fn resolve_tag(&self, owner: &str, repo: &str, tag: &str) -> CodeHostResult<String> {
        let reference: GitRef = self
            .client
            .get(format!("/repos/{}/{}/git/ref/tags/{}", segment(owner), segment(repo), segments(tag)), None::<&()>)
            .await
            .map_err(map_error)?;
        let mut object = reference.object;
        for _ in 0..MAX_TAG_DEPTH {
            if object.kind != "tag" {
                return Ok(object.sha);
            }
            let annotated: GitRef = self
                .client
                .get(format!("/repos/{}/{}/git/tags/{}", segment(owner), segment(repo), segment(&object.sha)), None::<&()>)
                .await
                .map_err(map_error)?;
            object = annotated.object;
        }
        Err(anyhow!("Tag {tag} in {owner}/{repo} is nested too deeply").into())
    }

    async fn check_org_membership(&self, org: &str, login: &str) -> CodeHostResult<()> {
        self.check_presence(&format!("/orgs/{}/members/{}", segment(org), segment(login))).await
    }

    async fn check_collaborator(&self, owner: &str, repo: &str, login: &str) -> CodeHostResult<()> {
        self.check_presence(&format!("/repos/{}/{}/collaborators/{}", segment(owner), segment(repo), segment(login))).await
    }

    async fn create_commit_comment(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        body: &str,
    ) -> CodeHostResult<()> {
        let _: serde_json::Value = self
            .client
            .post(format!("/repos/{}/{}/commits/{}/comments", segment(owner), segment(repo), segment(sha)), Some(&json!({ "body": body })))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> CodeHostResult<()> {
        let _: serde_json::Value = self
            .client
            .post(format!("/repos/{}/{}/issues/{number}/comments", segment(owner), segment(repo)), Some(&json!({ "body": body })))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> CodeHostResult<()> {
        let _: serde_json::Value = self
            .client
            .post(format!("/repos/{}/{}/statuses/{}", segment(owner), segment(repo), segment(sha)), Some(status))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn create_check_run(
        &self,
        owner: &str,
        repo: &str,
        check_run: &NewCheckRun,
    ) -> CodeHostResult<CheckRunRef> {
        let body = json!({
            "name": check_run.name,
            "head_sha": check_run.head_sha,
            "details_url": check_run.details_url,
            "status": "queued",
            "output": { "title": check_run.title, "summary": check_run.summary },
        });
        let created: CreatedCheckRun = self
            .client
            .post(format!("/repos/{}/{}/check-runs", segment(owner), segment(repo)), Some(&body))
            .await
            .map_err(map_error)?;
        let check_suite_id = created
            .check_suite
            .map(|suite| suite.id)
            .ok_or_else(|| anyhow!("Check run {} has no check suite", created.id))?;
        Ok(CheckRunRef { id: created.id, check_suite_id })
    }

    async fn complete_check_run(
        &self,
        owner: &str,
        repo: &str,
        check_run_id: u64,
        completion: &CheckRunCompletion,
    ) -> CodeHostResult<()> {
        let body = json!({
            "status": "completed",
            "conclusion": completion.conclusion,
            "output": { "title": completion.title, "summary": completion.summary },
        });
        let _: serde_json::Value = self
            .client
            .patch(format!("/repos/{}/{}/check-runs/{check_run_id}", segment(owner), segment(repo)), Some(&body))
            .await
            .map_err(map_error)?;
        Ok(())
    }
}
