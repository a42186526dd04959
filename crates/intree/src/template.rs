//! Version 1 templates: `${expr}` interpolation and `$`-prefixed operators,
//! with Jinja expressions evaluated by minijinja.

use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value as JinjaValue};
use serde_json::{Map, Value};
use taskhook_core::models::EventContext;
use time::UtcDateTime;

use crate::{
    CompileError, CompileSettings,
    fromnow::{format_timestamp, from_now},
};

pub(crate) fn tasks_for(event_type: &str) -> String {
    match event_type {
        t if t.starts_with("pull_request") => "github-pull-request".to_string(),
        t => format!("github-{t}"),
    }
}

/// Build the template context for `event`.
pub(crate) fn context(event: &EventContext, settings: &CompileSettings) -> Map<String, Value> {
    let mut nested = Map::new();
    for (key, value) in &event.details {
        let Some(path) = key.strip_prefix("event.") else { continue };
        insert_path(&mut nested, path, value);
    }
    let mut context = Map::new();
    context.insert("tasks_for".to_string(), Value::String(tasks_for(event.event_type())));
    context.insert("event".to_string(), Value::Object(nested));
    context.insert("organization".to_string(), Value::String(event.organization.clone()));
    context.insert("repository".to_string(), Value::String(event.repository.clone()));
    context.insert(
        "taskcluster_root_url".to_string(),
        Value::String(settings.root_url.as_str().trim_end_matches('/').to_string()),
    );
    context
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: &str) {
    match path.split_once('.') {
        None => {
            map.entry(path.to_string()).or_insert_with(|| Value::String(value.to_string()));
        }
        Some((head, rest)) => {
            let entry = map.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

pub(crate) struct Renderer {
    env: Environment<'static>,
    now: UtcDateTime,
}

impl Renderer {
    pub(crate) fn new(now: UtcDateTime) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::SemiStrict);
        env.add_function("fromNow", move |offset: Option<String>| {
            let offset = offset.unwrap_or_default();
            from_now(&offset, now).map(format_timestamp).ok_or_else(|| {
                minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("invalid time offset `{offset}`"),
                )
            })
        });
        Self { env, now }
    }

    /// Render `value`. Returns `None` when the value was removed by a false
    /// `$if` without an `else` branch.
    pub(crate) fn render(
        &self,
        value: &Value,
        ctx: &Map<String, Value>,
    ) -> Result<Option<Value>, CompileError> {
        Ok(Some(match value {
            Value::String(s) => Value::String(self.interpolate(s, ctx)?),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(item) = self.render(item, ctx)? {
                        out.push(item);
                    }
                }
                Value::Array(out)
            }
            Value::Object(map) => {
                if let Some(operator) = map.keys().find(|k| is_operator(k)) {
                    return self.render_operator(operator, map, ctx);
                }
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    let key = match key.strip_prefix("$$") {
                        Some(rest) => format!("${rest}"),
                        None => self.interpolate(key, ctx)?,
                    };
                    if let Some(value) = self.render(value, ctx)? {
                        out.insert(key, value);
                    }
                }
                Value::Object(out)
            }
            other => other.clone(),
        }))
    }

    fn render_operator(
        &self,
        operator: &str,
        map: &Map<String, Value>,
        ctx: &Map<String, Value>,
    ) -> Result<Option<Value>, CompileError> {
        let operand = &map[operator];
        match operator {
            "$eval" => {
                let expr = operand.as_str().ok_or_else(|| operator_error("$eval", "a string"))?;
                self.eval(expr, ctx).map(Some)
            }
            "$if" => {
                let expr = operand.as_str().ok_or_else(|| operator_error("$if", "a string"))?;
                let branch = if self.eval_raw(expr, ctx)?.is_true() { "then" } else { "else" };
                match map.get(branch) {
                    Some(value) => self.render(value, ctx),
                    None => Ok(None),
                }
            }
            "$let" => {
                let Value::Object(bindings) = operand else {
                    return Err(operator_error("$let", "a mapping"));
                };
                let body = map.get("in").ok_or_else(|| operator_error("$let", "used with `in`"))?;
                let mut scope = ctx.clone();
                for (name, value) in bindings {
                    if let Some(value) = self.render(value, ctx)? {
                        scope.insert(name.clone(), value);
                    }
                }
                self.render(body, &scope)
            }
            "$json" => {
                let value = self.render(operand, ctx)?.unwrap_or(Value::Null);
                serde_json::to_string(&value)
                    .map(|s| Some(Value::String(s)))
                    .map_err(|e| CompileError::Config(e.to_string()))
            }
            "$fromNow" => {
                let offset = match self.render(operand, ctx)? {
                    Some(Value::String(offset)) => offset,
                    _ => return Err(operator_error("$fromNow", "a string")),
                };
                let at = from_now(&offset, self.now).ok_or_else(|| {
                    CompileError::Config(format!("Invalid time offset `{offset}`"))
                })?;
                Ok(Some(Value::String(format_timestamp(at))))
            }
            other => Err(CompileError::Config(format!("Unknown template operator `{other}`"))),
        }
    }

    fn eval_raw(&self, expr: &str, ctx: &Map<String, Value>) -> Result<JinjaValue, CompileError> {
        let expression = self
            .env
            .compile_expression_owned(expr.to_string())
            .map_err(|e| CompileError::Config(format!("Invalid expression `{expr}`: {e}")))?;
        expression
            .eval(ctx)
            .map_err(|e| CompileError::Config(format!("Failed to evaluate `{expr}`: {e}")))
    }

    fn eval(&self, expr: &str, ctx: &Map<String, Value>) -> Result<Value, CompileError> {
        let value = self.eval_raw(expr, ctx)?;
        if value.is_undefined() {
            return Err(CompileError::Config(format!("`{expr}` is undefined")));
        }
        serde_json::to_value(&value).map_err(|e| CompileError::Config(e.to_string()))
    }

    fn interpolate(&self, input: &str, ctx: &Map<String, Value>) -> Result<String, CompileError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            if rest[..start].ends_with('$') {
                // `$${` is an escaped literal
                out.push_str(&rest[..start - 1]);
                out.push_str("${");
                rest = &rest[start + 2..];
                continue;
            }
            out.push_str(&rest[..start]);
            let body = &rest[start + 2..];
            let end = closing_brace(body).ok_or_else(|| {
                CompileError::Config(format!("Unterminated interpolation in `{input}`"))
            })?;
            let expr = body[..end].trim();
            match self.eval(expr, ctx)? {
                Value::String(s) => out.push_str(&s),
                value @ (Value::Number(_) | Value::Bool(_)) => out.push_str(&value.to_string()),
                _ => {
                    return Err(CompileError::Config(format!(
                        "`{expr}` cannot be interpolated into a string"
                    )));
                }
            }
            rest = &body[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn is_operator(key: &str) -> bool {
    key.strip_prefix('$').is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_alphabetic()))
}

fn operator_error(operator: &str, expected: &str) -> CompileError {
    CompileError::Config(format!("`{operator}` must be {expected}"))
}

/// Index of the `}` closing an interpolation, skipping nested braces and quoted
/// strings.
fn closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = None;
    for (index, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '{') => depth += 1,
            (None, '}') if depth == 0 => return Some(index),
            (None, '}') => depth -= 1,
            _ => {}
        }
    }
    None
}
