// SPDX-License-Identifier: MIT OR Apache-2.0
//! `${ctx.path}` / `${inputs.x}` variable substitution over Step `input` JSON
//! (§4.2). `${inputs.x}` is sugar for `${ctx.inputs.x}`: both walk the same
//! context map, since `ctx["inputs"]` already holds the Flow's inputs.

use serde_json::Value;

/// Walk dot-separated `path` against `ctx`, returning `Value::Null` for any
/// missing segment rather than raising (§4.2: "missing path -> null").
pub fn resolve_path(ctx: &Value, path: &str) -> Value {
    let mut current = ctx;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn placeholder_path(raw: &str) -> &str {
    raw.strip_prefix("ctx.").unwrap_or(raw)
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") {
        return None;
    }
    Some(inner)
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Substitute every `${...}` placeholder found in `s` against `ctx`.
///
/// A string that, once trimmed, is exactly one placeholder yields the
/// resolved value's own JSON type (an object, array, number, etc. passes
/// through whole). Otherwise every placeholder is coerced to a string and
/// spliced into the surrounding text, with a missing/null resolution
/// contributing the empty string.
fn substitute_str(s: &str, ctx: &Value) -> Value {
    if let Some(inner) = whole_placeholder(s) {
        return resolve_path(ctx, placeholder_path(inner));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let path = placeholder_path(&after[..end]);
        out.push_str(&coerce_to_string(&resolve_path(ctx, path)));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// Recursively walk a JSON value tree, substituting every string leaf
/// against `ctx`.
pub fn substitute_value(value: &Value, ctx: &Value) -> Value {
    match value {
        Value::String(s) => substitute_str(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, ctx)).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, ctx));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({"inputs": {"name": "ada", "count": 3}, "result": {"ok": true}})
    }

    #[test]
    fn whole_value_placeholder_preserves_type() {
        let out = substitute_value(&json!("${ctx.result}"), &ctx());
        assert_eq!(out, json!({"ok": true}));
    }

    #[test]
    fn inputs_prefix_is_sugar_for_ctx_inputs() {
        let a = substitute_value(&json!("${inputs.name}"), &ctx());
        let b = substitute_value(&json!("${ctx.inputs.name}"), &ctx());
        assert_eq!(a, json!("ada"));
        assert_eq!(a, b);
    }

    #[test]
    fn embedded_placeholder_coerces_to_string() {
        let out = substitute_value(&json!("hello ${inputs.name}, count=${inputs.count}"), &ctx());
        assert_eq!(out, json!("hello ada, count=3"));
    }

    #[test]
    fn missing_path_yields_null_without_raising() {
        assert_eq!(resolve_path(&ctx(), "inputs.missing"), Value::Null);
        let out = substitute_value(&json!("x=${inputs.missing}"), &ctx());
        assert_eq!(out, json!("x="));
    }

    #[test]
    fn nested_object_and_array_leaves_are_walked() {
        let input = json!({"a": ["${inputs.name}", 1], "b": "${inputs.count}"});
        let out = substitute_value(&input, &ctx());
        assert_eq!(out, json!({"a": ["ada", 1], "b": 3}));
    }
}
