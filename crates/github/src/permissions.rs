//! Decides whether an actor may trigger tasks for a repository.

use crate::{CodeHost, CodeHostError, CodeHostResult};

pub const INSUFFICIENT_CREDENTIALS_COMMENT: &str = "Taskcluster does not have permission to check \
for repository collaborators. Ensure that it is a member of a team with __write__ access to this \
repository!";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Denial {
    /// Neither an organization member nor a collaborator.
    NotCollaborator,
    /// The installation is not allowed to list collaborators.
    InsufficientCredentials,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

/// Short-circuits on the first positive answer: the organization itself, an
/// organization member, then a repository collaborator.
///
/// When the collaborator lookup is forbidden an explanatory comment is posted
/// on `sha` (if given) before denying. Errors other than "not found" propagate.
pub async fn evaluate(
    host: &dyn CodeHost,
    login: &str,
    organization: &str,
    repository: &str,
    sha: Option<&str>,
) -> CodeHostResult<Decision> {
    if login.eq_ignore_ascii_case(organization) {
        tracing::debug!("{login} is the organization {organization}");
        return Ok(Decision::Allow);
    }

    match host.check_org_membership(organization, login).await {
        Ok(()) => {
            tracing::debug!("{login} is a member of {organization}");
            return Ok(Decision::Allow);
        }
        Err(CodeHostError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    match host.check_collaborator(organization, repository, login).await {
        Ok(()) => {
            tracing::debug!("{login} is a collaborator on {organization}/{repository}");
            Ok(Decision::Allow)
        }
        Err(CodeHostError::NotFound(_)) => Ok(Decision::Deny(Denial::NotCollaborator)),
        Err(CodeHostError::Forbidden(_)) => {
            tracing::warn!(
                "Insufficient permissions to check collaborators of {organization}/{repository}"
            );
            if let Some(sha) = sha {
                host.create_commit_comment(
                    organization,
                    repository,
                    sha,
                    INSUFFICIENT_CREDENTIALS_COMMENT,
                )
                .await?;
            }
            Ok(Decision::Deny(Denial::InsufficientCredentials))
        }
        Err(e) => Err(e),
    }
}
