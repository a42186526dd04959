//! Inbound task-platform messages.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::Stream;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_group_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroupEvent {
    pub task_group_id: String,
}

/// Published once a task group was submitted. Carries only the group id;
/// handlers read everything else from the stored build.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroupDefined {
    pub task_group_id: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InboundMessage {
    TaskDefined(TaskEvent),
    TaskFailed(TaskEvent),
    TaskException(TaskEvent),
    TaskGroupResolved(TaskGroupEvent),
    TaskGroupDefined(TaskGroupDefined),
}

impl InboundMessage {
    pub fn task_group_id(&self) -> &str {
        match self {
            Self::TaskDefined(e) | Self::TaskFailed(e) | Self::TaskException(e) => &e.task_group_id,
            Self::TaskGroupResolved(e) => &e.task_group_id,
            Self::TaskGroupDefined(e) => &e.task_group_id,
        }
    }

    /// Stream whose worker handles this message.
    pub fn stream(&self) -> Stream {
        match self {
            Self::TaskDefined(_) => Stream::TaskDefined,
            Self::TaskFailed(_) | Self::TaskException(_) | Self::TaskGroupResolved(_) => {
                Stream::Status
            }
            Self::TaskGroupDefined(_) => Stream::TaskGroupDefined,
        }
    }
}

/// A task-platform message as forwarded by the event relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub routes: Vec<String>,
    pub payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayTaskStatus {
    task_id: String,
    task_group_id: String,
    #[serde(default)]
    scheduler_id: String,
}

#[derive(Deserialize)]
struct RelayTaskPayload {
    status: RelayTaskStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayGroupPayload {
    task_group_id: String,
    #[serde(default)]
    scheduler_id: String,
}

/// Filters applied at the relay boundary.
#[derive(Debug, Clone)]
pub struct RelayFilter<'a> {
    /// Task-defined messages must be routed through `route.<check_task_route>`.
    pub check_task_route: &'a str,
    /// Status messages must belong to this scheduler.
    pub scheduler_id: &'a str,
}

impl RelayMessage {
    /// Final segment of the exchange name, e.g. `task-failed`.
    pub fn kind(&self) -> &str { self.exchange.rsplit('/').next().unwrap_or_default() }

    fn routed_via(&self, route: &str) -> bool {
        let cc = format!("route.{route}");
        self.routing_key == cc || self.routes.iter().any(|r| *r == cc || r == route)
    }

    /// Maps a relayed message onto the inbound union. Messages that are not
    /// ours, or of a kind nothing consumes, yield `None`.
    pub fn classify(&self, filter: &RelayFilter<'_>) -> Result<Option<InboundMessage>> {
        let kind = self.kind();
        let message = match kind {
            "task-defined" | "task-failed" | "task-exception" => {
                let RelayTaskPayload { status } =
                    serde_json::from_value(self.payload.clone())
                        .with_context(|| format!("Malformed {kind} payload"))?;
                if kind == "task-defined" {
                    if !self.routed_via(filter.check_task_route) {
                        return Ok(None);
                    }
                } else if status.scheduler_id != filter.scheduler_id {
                    return Ok(None);
                }
                let event =
                    TaskEvent { task_group_id: status.task_group_id, task_id: status.task_id };
                match kind {
                    "task-defined" => InboundMessage::TaskDefined(event),
                    "task-failed" => InboundMessage::TaskFailed(event),
                    _ => InboundMessage::TaskException(event),
                }
            }
            "task-group-resolved" => {
                let payload: RelayGroupPayload = serde_json::from_value(self.payload.clone())
                    .context("Malformed task-group-resolved payload")?;
                if payload.scheduler_id != filter.scheduler_id {
                    return Ok(None);
                }
                InboundMessage::TaskGroupResolved(TaskGroupEvent {
                    task_group_id: payload.task_group_id,
                })
            }
            "task-group-defined" => {
                let payload: TaskGroupDefined = serde_json::from_value(self.payload.clone())
                    .context("Malformed task-group-defined payload")?;
                InboundMessage::TaskGroupDefined(payload)
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const FILTER: RelayFilter<'static> =
        RelayFilter { check_task_route: "checks", scheduler_id: "taskcluster-github" };

    fn relay(exchange: &str, routes: &[&str], payload: Value) -> RelayMessage {
        RelayMessage {
            exchange: format!("exchange/taskcluster-queue/v1/{exchange}"),
            routing_key: "primary.abc.0.worker.id.proj.type.taskcluster-github.g1._".to_string(),
            routes: routes.iter().map(|r| r.to_string()).collect(),
            payload,
        }
    }

    fn status(scheduler: &str) -> Value {
        json!({
            "status": {
                "taskId": "t1",
                "taskGroupId": "g1",
                "schedulerId": scheduler,
                "state": "failed",
            },
            "runId": 0,
        })
    }

    #[test]
    fn task_defined_requires_check_route() {
        let message = relay("task-defined", &["route.checks"], status("other"));
        assert_eq!(
            message.classify(&FILTER).unwrap(),
            Some(InboundMessage::TaskDefined(TaskEvent {
                task_group_id: "g1".to_string(),
                task_id: "t1".to_string(),
            }))
        );
        let message = relay("task-defined", &["route.index.foo"], status("taskcluster-github"));
        assert_eq!(message.classify(&FILTER).unwrap(), None);
    }

    #[test]
    fn status_requires_scheduler() {
        let failed = relay("task-failed", &[], status("taskcluster-github"));
        let message = failed.classify(&FILTER).unwrap().unwrap();
        assert!(matches!(message, InboundMessage::TaskFailed(_)));
        assert_eq!(message.stream(), Stream::Status);

        let exception = relay("task-exception", &[], status("taskcluster-github"));
        assert!(matches!(
            exception.classify(&FILTER).unwrap(),
            Some(InboundMessage::TaskException(_))
        ));

        let foreign = relay("task-failed", &[], status("someone-else"));
        assert_eq!(foreign.classify(&FILTER).unwrap(), None);
    }

    #[test]
    fn group_resolved() {
        let message = relay(
            "task-group-resolved",
            &[],
            json!({"taskGroupId": "g1", "schedulerId": "taskcluster-github"}),
        );
        assert_eq!(
            message.classify(&FILTER).unwrap(),
            Some(InboundMessage::TaskGroupResolved(TaskGroupEvent {
                task_group_id: "g1".to_string()
            }))
        );
    }

    #[test]
    fn unknown_and_malformed() {
        let completed = relay("task-completed", &[], status("taskcluster-github"));
        assert_eq!(completed.classify(&FILTER).unwrap(), None);
        let malformed = relay("task-failed", &[], json!({"nope": true}));
        assert!(malformed.classify(&FILTER).is_err());
    }

    #[test]
    fn stored_form_is_tagged() {
        let message = InboundMessage::TaskGroupDefined(TaskGroupDefined {
            task_group_id: "g1".to_string(),
        });
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded, json!({"kind": "task-group-defined", "taskGroupId": "g1"}));
        assert_eq!(serde_json::from_value::<InboundMessage>(encoded).unwrap(), message);
    }
}
