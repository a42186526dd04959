use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use taskhook_core::{
    config::Config,
    models::{EventContext, details},
    util::sanitize,
};

/// Verify and extract a GitHub webhook delivery.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    /// `X-GitHub-Event`
    pub kind: String,
    /// `X-GitHub-Delivery`
    pub delivery: String,
    pub body: Bytes,
}

/// Check an `sha256=<hex>` signature header against `body`.
pub fn verify_signature(secret: &str, header: &str, body: &[u8]) -> Result<(), &'static str> {
    let signature = header.strip_prefix("sha256=").ok_or("sha256= prefix missing")?;
    let signature = hex::decode(signature).map_err(|_| "signature malformed")?;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| "invalid secret")?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| "signature mismatch")
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(status: StatusCode, m: impl Display) -> Response {
            tracing::error!("{m}");
            (status, m.to_string()).into_response()
        }
        // Owned copies, so no borrow of the request is held across the body read
        let (kind, delivery, signature) = {
            let headers = req.headers();
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| err(StatusCode::BAD_REQUEST, format!("{name} header missing")))
            };
            (header("X-GitHub-Event")?, header("X-GitHub-Delivery")?, header("X-Hub-Signature-256")?)
        };
        let config = <Arc<Config>>::from_ref(state);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| err(StatusCode::BAD_REQUEST, "error reading body"))?;
        verify_signature(&config.github.app.webhook_secret, &signature, &body)
            .map_err(|m| err(StatusCode::UNAUTHORIZED, format!("X-Hub-Signature-256: {m}")))?;
        Ok(GitHubEvent { kind, delivery, body })
    }
}

#[derive(Deserialize)]
struct User {
    login: String,
}

#[derive(Deserialize)]
struct Repository {
    name: String,
    clone_url: String,
    owner: User,
}

#[derive(Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Deserialize)]
struct Pusher {
    email: Option<String>,
}

#[derive(Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    reference: String,
    before: String,
    after: String,
    #[serde(default)]
    deleted: bool,
    repository: Repository,
    sender: User,
    pusher: Option<Pusher>,
    installation: Installation,
}

#[derive(Deserialize)]
struct PullRequestEvent {
    action: String,
    number: u64,
    pull_request: PullRequest,
    repository: Repository,
    installation: Installation,
}

#[derive(Deserialize)]
struct PullRequest {
    title: String,
    user: User,
    base: PullRequestRef,
    head: PullRequestRef,
}

#[derive(Deserialize)]
struct PullRequestRef {
    #[serde(rename = "ref")]
    reference: String,
    sha: String,
    user: User,
    repo: Option<Repository>,
}

#[derive(Deserialize)]
struct ReleaseEvent {
    action: String,
    release: Release,
    repository: Repository,
    sender: User,
    installation: Installation,
}

#[derive(Deserialize)]
struct Release {
    tag_name: String,
    target_commitish: String,
    name: Option<String>,
}

/// Normalize a webhook delivery into an event context.
///
/// Returns `Ok(None)` for deliveries that never start tasks.
pub fn event_context(kind: &str, delivery: &str, body: &[u8]) -> Result<Option<EventContext>> {
    let mut details = BTreeMap::new();
    let mut set = |key: &str, value: &str| {
        details.insert(key.to_string(), value.to_string());
    };
    let (repository, installation) = match kind {
        "push" => {
            let event: PushEvent = serde_json::from_slice(body).context("Invalid push payload")?;
            if event.deleted {
                return Ok(None);
            }
            if let Some(tag) = event.reference.strip_prefix("refs/tags/") {
                set(details::EVENT_TYPE, "tag");
                set(details::HEAD_TAG, tag);
            } else if let Some(branch) = event.reference.strip_prefix("refs/heads/") {
                set(details::EVENT_TYPE, "push");
                set(details::BASE_REPO_BRANCH, branch);
                set(details::HEAD_REPO_BRANCH, branch);
            } else {
                return Ok(None);
            }
            for prefix in ["event.base", "event.head"] {
                set(&format!("{prefix}.repo.name"), &event.repository.name);
                set(&format!("{prefix}.repo.url"), &event.repository.clone_url);
                set(&format!("{prefix}.user.login"), &event.sender.login);
                set(&format!("{prefix}.ref"), &event.reference);
            }
            set(details::BASE_SHA, &event.before);
            set(details::HEAD_SHA, &event.after);
            if let Some(email) = event.pusher.and_then(|p| p.email) {
                set(details::HEAD_USER_EMAIL, &email);
            }
            (event.repository, event.installation)
        }
        "pull_request" => {
            let event: PullRequestEvent =
                serde_json::from_slice(body).context("Invalid pull_request payload")?;
            if !matches!(event.action.as_str(), "opened" | "synchronize" | "reopened") {
                return Ok(None);
            }
            let pr = &event.pull_request;
            set(details::EVENT_TYPE, &format!("pull_request.{}", event.action));
            set(details::PULL_NUMBER, &event.number.to_string());
            set(details::TITLE, &pr.title);
            for (prefix, side) in [("event.base", &pr.base), ("event.head", &pr.head)] {
                set(&format!("{prefix}.sha"), &side.sha);
                set(&format!("{prefix}.ref"), &format!("refs/heads/{}", side.reference));
                set(&format!("{prefix}.repo.branch"), &side.reference);
                if let Some(repo) = &side.repo {
                    set(&format!("{prefix}.repo.name"), &repo.name);
                    set(&format!("{prefix}.repo.url"), &repo.clone_url);
                }
            }
            set(details::BASE_USER_LOGIN, &pr.base.user.login);
            set(details::HEAD_USER_LOGIN, &pr.user.login);
            (event.repository, event.installation)
        }
        "release" => {
            let event: ReleaseEvent =
                serde_json::from_slice(body).context("Invalid release payload")?;
            if event.action != "published" {
                return Ok(None);
            }
            set(details::EVENT_TYPE, "release");
            set(details::VERSION, &event.release.tag_name);
            set(details::HEAD_TAG, &event.release.tag_name);
            set(details::BASE_REPO_BRANCH, &event.release.target_commitish);
            if let Some(name) = &event.release.name {
                set(details::TITLE, name);
            }
            for prefix in ["event.base", "event.head"] {
                set(&format!("{prefix}.repo.name"), &event.repository.name);
                set(&format!("{prefix}.repo.url"), &event.repository.clone_url);
                set(&format!("{prefix}.user.login"), &event.sender.login);
            }
            (event.repository, event.installation)
        }
        _ => return Ok(None),
    };
    Ok(Some(EventContext {
        organization: sanitize(&repository.owner.login),
        repository: sanitize(&repository.name),
        installation_id: installation.id,
        event_id: delivery.to_string(),
        details,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn repository() -> serde_json::Value {
        json!({
            "name": "app.js",
            "clone_url": "https://github.com/mozilla.org/app.js.git",
            "owner": {"login": "mozilla.org"},
        })
    }

    #[test]
    fn signatures() {
        let body = br#"{"zen":"Keep it logically awesome."}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert_eq!(verify_signature("secret", &header, body), Ok(()));
        assert_eq!(verify_signature("other", &header, body), Err("signature mismatch"));
        assert!(verify_signature("secret", "sha1=abcd", body).is_err());
        assert!(verify_signature("secret", "sha256=zz", body).is_err());
    }

    fn config() -> Arc<Config> {
        let config = json!({
            "server": {"port": 0},
            "db": {"url": "sqlite::memory:", "jobs_url": "sqlite::memory:"},
            "github": {"app": {"id": 1, "webhook_secret": "secret", "private_key": ""}},
            "taskcluster": {
                "root_url": "https://tc.example.com",
                "scheduler_id": "taskcluster-github",
                "credentials": {"client_id": "github", "access_token": "token"},
            },
        });
        Arc::new(serde_json::from_value(config).unwrap())
    }

    fn delivery(body: &'static [u8], signature: Option<&str>) -> Request {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/github")
            .header("X-GitHub-Event", "ping")
            .header("X-GitHub-Delivery", "d1");
        if let Some(signature) = signature {
            builder = builder.header("X-Hub-Signature-256", signature);
        }
        builder.body(axum::body::Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn extracts_signed_deliveries() {
        let body = br#"{"zen":"Design for failure."}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        // Spawning requires the extractor future to be Send
        let config = config();
        let request = delivery(body, Some(&signature));
        let event = tokio::spawn(async move { GitHubEvent::from_request(request, &config).await })
            .await
            .unwrap()
            .map_err(|r| r.status())
            .unwrap();
        assert_eq!(event.kind, "ping");
        assert_eq!(event.delivery, "d1");
        assert_eq!(&event.body[..], body);

        let rejected = GitHubEvent::from_request(delivery(body, None), &self::config()).await;
        assert_eq!(rejected.map(drop).map_err(|r| r.status()), Err(StatusCode::BAD_REQUEST));
        let rejected =
            GitHubEvent::from_request(delivery(body, Some("sha256=00")), &self::config()).await;
        assert_eq!(rejected.map(drop).map_err(|r| r.status()), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn push_to_branch() {
        let body = json!({
            "ref": "refs/heads/main",
            "before": "b4",
            "after": "af",
            "repository": repository(),
            "sender": {"login": "alice"},
            "pusher": {"name": "alice", "email": "alice@example.com"},
            "installation": {"id": 5828},
        });
        let event = event_context("push", "d1", body.to_string().as_bytes()).unwrap().unwrap();
        assert_eq!(event.organization, "mozilla%org");
        assert_eq!(event.repository, "app%js");
        assert_eq!(event.installation_id, 5828);
        assert_eq!(event.event_id, "d1");
        assert_eq!(event.event_type(), "push");
        assert_eq!(event.detail(details::BASE_REPO_BRANCH), Some("main"));
        assert_eq!(event.head_sha(), Some("af"));
        assert_eq!(event.detail(details::BASE_SHA), Some("b4"));
        assert_eq!(event.detail(details::HEAD_USER_EMAIL), Some("alice@example.com"));
        assert_eq!(event.detail(details::HEAD_REF), Some("refs/heads/main"));
    }

    #[test]
    fn push_of_tag() {
        let body = json!({
            "ref": "refs/tags/v1.2.0",
            "before": "0000",
            "after": "af",
            "repository": repository(),
            "sender": {"login": "alice"},
            "installation": {"id": 1},
        });
        let event = event_context("push", "d2", body.to_string().as_bytes()).unwrap().unwrap();
        assert_eq!(event.event_type(), "tag");
        assert_eq!(event.detail(details::HEAD_TAG), Some("v1.2.0"));
        assert_eq!(event.detail(details::BASE_REPO_BRANCH), None);
    }

    #[test]
    fn pull_request() {
        let side = |reference: &str, sha: &str, login: &str| {
            json!({"ref": reference, "sha": sha, "user": {"login": login}, "repo": repository()})
        };
        let body = json!({
            "action": "synchronize",
            "number": 17,
            "pull_request": {
                "title": "Fix things",
                "user": {"login": "contributor"},
                "base": side("main", "b4", "mozilla.org"),
                "head": side("fix", "af", "contributor"),
            },
            "repository": repository(),
            "installation": {"id": 9},
        });
        let event =
            event_context("pull_request", "d3", body.to_string().as_bytes()).unwrap().unwrap();
        assert_eq!(event.event_type(), "pull_request.synchronize");
        assert_eq!(event.pull_number(), Some(17));
        assert_eq!(event.detail(details::HEAD_USER_LOGIN), Some("contributor"));
        assert_eq!(event.detail(details::HEAD_REPO_BRANCH), Some("fix"));
        assert_eq!(event.detail(details::BASE_REF), Some("refs/heads/main"));

        let closed = body.to_string().replace("synchronize", "closed");
        assert!(event_context("pull_request", "d4", closed.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn release_and_others() {
        let body = json!({
            "action": "published",
            "release": {"tag_name": "v2", "target_commitish": "main", "name": null},
            "repository": repository(),
            "sender": {"login": "alice"},
            "installation": {"id": 3},
        });
        let event = event_context("release", "d5", body.to_string().as_bytes()).unwrap().unwrap();
        assert_eq!(event.event_type(), "release");
        assert_eq!(event.detail(details::VERSION), Some("v2"));
        assert_eq!(event.head_sha(), None);
        assert!(event_context("issues", "d6", b"{}").unwrap().is_none());
        assert!(event_context("push", "d7", b"{").is_err());
    }
}
