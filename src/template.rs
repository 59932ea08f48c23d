//! `{{var}}` template substitution against an execution context.
//!
//! Rendering is pure: the input template and the context are never
//! mutated. Placeholders resolve depth-first, left-to-right, each
//! independently. An unresolved placeholder is a typed error carrying
//! the variable name and the node path, never silently-left literal
//! text; callers decide whether that is fatal.

use crate::context::ExecutionContext;
use crate::error::VariableNotFound;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Matches `{{ key }}` with optional whitespace, capturing the key.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}")
        .expect("failed to compile placeholder regex")
});

/// Render a string template. Non-placeholder content is copied
/// byte-identically.
pub fn render_str(
    template: &str,
    ctx: &ExecutionContext,
    path: &str,
) -> Result<String, VariableNotFound> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let value =
            ctx.resolve(name).ok_or_else(|| VariableNotFound {
                name: name.to_string(),
                path: path.to_string(),
            })?;

        out.push_str(&template[last..whole.start()]);
        out.push_str(&value_to_text(&value));
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(out)
}

/// Render a JSON structure, substituting placeholders in every string
/// leaf. A string that is exactly one placeholder is replaced by the
/// typed variable value so numbers and objects survive substitution
/// into request bodies.
pub fn render_value(
    template: &Value,
    ctx: &ExecutionContext,
    path: &str,
) -> Result<Value, VariableNotFound> {
    match template {
        Value::String(s) => {
            if let Some(name) = sole_placeholder(s) {
                return ctx.resolve(name).ok_or_else(|| {
                    VariableNotFound {
                        name: name.to_string(),
                        path: path.to_string(),
                    }
                });
            }
            Ok(Value::String(render_str(s, ctx, path)?))
        }
        Value::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                let item_path = format!("{path}.{idx}");
                rendered.push(render_value(item, ctx, &item_path)?);
            }
            Ok(Value::Array(rendered))
        }
        Value::Object(map) => {
            let mut rendered = serde_json::Map::new();
            for (key, value) in map {
                let entry_path = format!("{path}.{key}");
                rendered.insert(
                    key.clone(),
                    render_value(value, ctx, &entry_path)?,
                );
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// If the whole string is one placeholder, return its key.
fn sole_placeholder(s: &str) -> Option<&str> {
    let caps = PLACEHOLDER_RE.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

/// Textual form of a variable when interpolated into a string.
/// Strings are inserted bare (no quotes); other values use their JSON
/// representation.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
