use url::Url;

pub trait UrlExt {
    fn with_path(&self, path: &str) -> Url;
}

impl UrlExt for Url {
    /// Appends `path` to the existing path, keeping any path prefix of the root.
    #[inline]
    fn with_path(&self, path: &str) -> Url {
        let mut out = self.clone();
        let joined = format!("{}/{}", self.path().trim_end_matches('/'), path.trim_start_matches('/'));
        out.set_path(&joined);
        out
    }
}

/// Reverse the `.` -> `%` substitution applied to organization and repository
/// names on the job stream.
pub fn unsanitize(value: &str) -> String { value.replace('%', ".") }

pub fn sanitize(value: &str) -> String { value.replace('.', "%") }

const HTML_TRAILER: &str = "</body>\n</html>\n";

/// Shorten full HTML error pages returned by the code host.
pub fn truncate_error_body(message: &str) -> String {
    if message.len() > 10000 && message.ends_with(HTML_TRAILER) {
        let mut out: String = message.chars().take(100).collect();
        out.push_str("...");
        out
    } else {
        message.to_string()
    }
}

/// Task group page on the task platform.
pub fn task_group_url(root_url: &Url, task_group_id: &str) -> Url {
    root_url.with_path(&format!("tasks/groups/{task_group_id}"))
}

/// Task details page on the task platform.
pub fn task_details_url(root_url: &Url, task_group_id: &str, task_id: &str) -> Url {
    root_url.with_path(&format!("tasks/groups/{task_group_id}/tasks/{task_id}/details"))
}
