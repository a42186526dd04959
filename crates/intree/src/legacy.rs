//! Version 0 templates: `{{ name }}` substitution.

use std::{collections::BTreeMap, sync::OnceLock};

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use taskhook_core::models::EventContext;
use time::UtcDateTime;

use crate::{
    CompileError, CompileSettings,
    fromnow::{format_timestamp, from_now},
};

pub(crate) type Params = BTreeMap<String, Value>;

pub(crate) fn params(event: &EventContext, settings: &CompileSettings, now: UtcDateTime) -> Params {
    let mut params: Params =
        event.details.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    params.insert("timestamp".to_string(), Value::from(millis as i64));
    params.insert("organization".to_string(), Value::String(event.organization.clone()));
    params.insert("repository".to_string(), Value::String(event.repository.clone()));
    params.insert(
        "taskcluster.docker.provisionerId".to_string(),
        Value::String(settings.provisioner_id.clone()),
    );
    params.insert(
        "taskcluster.docker.workerType".to_string(),
        Value::String(settings.worker_type.clone()),
    );
    params
}

pub(crate) fn render(value: Value, params: &Params, now: UtcDateTime) -> Result<Value, CompileError> {
    Ok(match value {
        Value::String(s) => substitute(&s, params, now)?,
        Value::Array(items) => Value::Array(
            items.into_iter().map(|v| render(v, params, now)).collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                let key = match substitute(&key, params, now)? {
                    Value::String(key) => key,
                    other => other.to_string(),
                };
                out.insert(key, render(value, params, now)?);
            }
            Value::Object(out)
        }
        other => other,
    })
}

fn placeholder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").unwrap())
}

fn substitute(input: &str, params: &Params, now: UtcDateTime) -> Result<Value, CompileError> {
    let regex = placeholder_regex();
    if let Some(captures) = regex.captures(input)
        && captures.get(0).is_some_and(|m| m.len() == input.len())
    {
        return evaluate(&captures[1], params, now);
    }
    let mut error = None;
    let out = regex.replace_all(input, |captures: &Captures| {
        match evaluate(&captures[1], params, now) {
            Ok(Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            }
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(Value::String(out.into_owned())),
    }
}

fn evaluate(expr: &str, params: &Params, now: UtcDateTime) -> Result<Value, CompileError> {
    static PIPE: OnceLock<Regex> = OnceLock::new();
    let pipe = PIPE.get_or_init(|| Regex::new(r#"^(?:'([^']*)'|"([^"]*)")\s*\|\s*\$fromNow$"#).unwrap());
    let offset = if expr == "$fromNow" {
        Some("")
    } else {
        pipe.captures(expr).and_then(|c| c.get(1).or_else(|| c.get(2))).map(|m| m.as_str())
    };
    if let Some(offset) = offset {
        let at = from_now(offset, now)
            .ok_or_else(|| CompileError::Config(format!("Invalid time offset `{offset}`")))?;
        return Ok(Value::String(format_timestamp(at)));
    }
    params
        .get(expr)
        .cloned()
        .ok_or_else(|| CompileError::Config(format!("Undefined template parameter `{expr}`")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn now() -> UtcDateTime { UtcDateTime::from_unix_timestamp(1_500_000_000).unwrap() }

    fn test_params() -> Params {
        Params::from([
            ("event.head.sha".to_string(), json!("abc123")),
            ("organization".to_string(), json!("mozilla")),
            ("timestamp".to_string(), json!(1_500_000_000_000i64)),
        ])
    }

    #[test]
    fn substitutes_values() {
        let rendered = render(
            json!({
                "command": "checkout {{ event.head.sha }} in {{organization}}",
                "created": "{{ $fromNow }}",
                "deadline": "{{ '1 day' | $fromNow }}",
                "stamp": "{{ timestamp }}",
                "{{ organization }}-key": ["{{event.head.sha}}"],
            }),
            &test_params(),
            now(),
        )
        .unwrap();
        assert_eq!(
            rendered,
            json!({
                "command": "checkout abc123 in mozilla",
                "created": "2017-07-14T02:40:00.000Z",
                "deadline": "2017-07-15T02:40:00.000Z",
                "stamp": 1_500_000_000_000i64,
                "mozilla-key": ["abc123"],
            })
        );
    }

    #[test]
    fn unknown_parameter() {
        let err = render(json!({"a": "x {{ nope }}"}), &test_params(), now()).unwrap_err();
        assert!(matches!(err, CompileError::Config(msg) if msg.contains("`nope`")));
    }

    #[test]
    fn bad_offset() {
        let err = render(json!("{{ \"soon\" | $fromNow }}"), &test_params(), now()).unwrap_err();
        assert!(matches!(err, CompileError::Config(_)));
        let huge = json!("{{ '99999999999999999 weeks' | $fromNow }}");
        let err = render(huge, &test_params(), now()).unwrap_err();
        assert!(matches!(err, CompileError::Config(msg) if msg.contains("99999999999999999 weeks")));
    }
}
