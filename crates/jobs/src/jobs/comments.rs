//! Feedback posted on commits and pull requests.

use taskhook_github::CodeHost;

pub const SUBMISSION_FAILED_SUMMARY: &str = "Submitting the task to Taskcluster failed. Details";

/// Collapsed block with the error details.
pub fn exception_body(error: &str) -> String {
    let summary = format!("<summary>{SUBMISSION_FAILED_SUMMARY}</summary>");
    ["<details>\n", summary.as_str(), "", error, "", "</details>"].join("\n")
}

pub fn not_collaborator_body(login: &str) -> String {
    format!(
        "<details>\n\n<summary>No Taskcluster jobs started for this pull request</summary>\n\n\
         The `allowPullRequests` configuration for this repository (in `.taskcluster.yml`) does \
         not allow starting tasks for pull requests from @{login}. Only organization members and \
         repository collaborators can trigger tasks.\n\n</details>"
    )
}

pub const ALLOW_LIST_UNAVAILABLE_BODY: &str = "<details>\n\n<summary>No Taskcluster jobs started \
for this pull request</summary>\n\nThe `allowPullRequests` configuration for this repository could \
not be evaluated because Taskcluster is not allowed to list its collaborators.\n\n</details>";

/// Where feedback for an event ends up.
pub struct Target<'a> {
    pub organization: &'a str,
    pub repository: &'a str,
    pub sha: &'a str,
    pub pull_number: Option<u64>,
}

/// Comment on the pull request when known, otherwise on the commit.
pub async fn post(host: &dyn CodeHost, target: &Target<'_>, body: &str) -> anyhow::Result<()> {
    let &Target { organization, repository, sha, pull_number } = target;
    match pull_number {
        Some(number) => {
            tracing::debug!("Commenting on {organization}/{repository}#{number}");
            host.create_issue_comment(organization, repository, number, body).await?;
        }
        None => {
            tracing::debug!("Commenting on {organization}/{repository}@{sha}");
            host.create_commit_comment(organization, repository, sha, body).await?;
        }
    }
    Ok(())
}

pub async fn post_exception(
    host: &dyn CodeHost,
    target: &Target<'_>,
    error: &str,
) -> anyhow::Result<()> {
    post(host, target, &exception_body(error)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_layout() {
        assert_eq!(
            exception_body("bad yaml"),
            "<details>\n\n<summary>Submitting the task to Taskcluster failed. \
             Details</summary>\n\nbad yaml\n\n</details>"
        );
    }
}
