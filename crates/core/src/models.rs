use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::UtcDateTime;

/// Dotted keys of the event detail bag.
pub mod details {
    pub const EVENT_TYPE: &str = "event.type";
    pub const PULL_NUMBER: &str = "event.pullNumber";
    pub const TITLE: &str = "event.title";
    pub const VERSION: &str = "event.version";
    pub const BASE_REPO_NAME: &str = "event.base.repo.name";
    pub const BASE_REPO_URL: &str = "event.base.repo.url";
    pub const BASE_REPO_BRANCH: &str = "event.base.repo.branch";
    pub const BASE_USER_LOGIN: &str = "event.base.user.login";
    pub const BASE_SHA: &str = "event.base.sha";
    pub const BASE_REF: &str = "event.base.ref";
    pub const HEAD_REPO_NAME: &str = "event.head.repo.name";
    pub const HEAD_REPO_URL: &str = "event.head.repo.url";
    pub const HEAD_REPO_BRANCH: &str = "event.head.repo.branch";
    pub const HEAD_USER_LOGIN: &str = "event.head.user.login";
    pub const HEAD_USER_EMAIL: &str = "event.head.user.email";
    pub const HEAD_SHA: &str = "event.head.sha";
    pub const HEAD_TAG: &str = "event.head.tag";
    pub const HEAD_REF: &str = "event.head.ref";
}

/// A normalized code-host event, as carried on the job stream.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    /// Organization login, with `.` replaced by `%` for transport.
    pub organization: String,
    /// Repository name, with `.` replaced by `%` for transport.
    pub repository: String,
    pub installation_id: u64,
    pub event_id: String,
    pub details: BTreeMap<String, String>,
}

impl EventContext {
    pub fn detail(&self, key: &str) -> Option<&str> { self.details.get(key).map(String::as_str) }

    pub fn event_type(&self) -> &str { self.detail(details::EVENT_TYPE).unwrap_or_default() }

    /// `pull_request.opened` -> `pull_request`
    pub fn event_prefix(&self) -> &str { event_prefix(self.event_type()) }

    pub fn is_pull_request(&self) -> bool { self.event_type().starts_with("pull_request.") }

    pub fn head_sha(&self) -> Option<&str> {
        self.detail(details::HEAD_SHA).filter(|sha| !sha.is_empty())
    }

    pub fn pull_number(&self) -> Option<u64> {
        self.detail(details::PULL_NUMBER).and_then(|n| n.parse().ok())
    }
}

pub fn event_prefix(event_type: &str) -> &str {
    event_type.split_once('.').map_or(event_type, |(prefix, _)| prefix)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Queued,
    Success,
    Failure,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Commit status state reported to the code host.
    pub fn status_state(&self) -> &'static str {
        match self {
            Self::Queued => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl FromStr for BuildState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" | "pending" => Ok(Self::Queued),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A submitted task group and its aggregate state.
///
/// Key fields are immutable once created. Once `state` is `failure` it is
/// never overwritten.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Build {
    pub organization: String,
    pub repository: String,
    pub sha: String,
    pub task_group_id: String,
    pub state: BuildState,
    pub installation_id: u64,
    pub event_type: String,
    pub event_id: String,
    pub created: UtcDateTime,
    pub updated: UtcDateTime,
}

impl Build {
    pub fn event_prefix(&self) -> &str { event_prefix(&self.event_type) }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CheckRun {
    pub task_group_id: String,
    pub task_id: String,
    pub check_suite_id: u64,
    pub check_run_id: u64,
}
