//! Run-time resolution of reference tokens in block inputs.
//!
//! Input values may contain `<source.path>` tokens referencing the output of
//! an earlier block (by id or normalized name), the current loop item
//! (`<loop.item>`, `<loop.index>`), the current parallel branch
//! (`<parallel.item>`, `<parallel.index>`), or a workflow variable
//! (`<variable.name>`). `{{NAME}}` substitutes environment variables.
//! A string that is exactly one token resolves to the referenced value with
//! its type intact; otherwise matches are interpolated as strings.

use indexmap::IndexMap;
use serde_json::Value;

use crate::context::{BlockState, ExecutionContext};
use crate::error::BlockError;
use crate::graph::{Block, Workflow};

/// Where a block is being resolved from: top level, inside a loop iteration,
/// or inside one parallel branch.
#[derive(Default)]
pub struct ResolveScope<'a> {
    pub loop_container: Option<&'a str>,
    pub parallel_container: Option<&'a str>,
    pub parallel_index: Option<u32>,
    pub parallel_item: Option<&'a Value>,
    /// Branch-local states keyed by template id; consulted before the shared
    /// context so sibling branches never observe each other.
    pub local_states: Option<&'a IndexMap<String, BlockState>>,
}

/// Resolve every input value of `block`, leaving non-string values and
/// strings without tokens untouched.
pub fn resolve_inputs(
    block: &Block,
    workflow: &Workflow,
    ctx: &ExecutionContext,
    scope: &ResolveScope<'_>,
) -> Result<Value, BlockError> {
    let mut out = serde_json::Map::new();
    for (key, value) in &block.inputs {
        out.insert(key.clone(), resolve_value(value, workflow, ctx, scope)?);
    }
    Ok(Value::Object(out))
}

fn resolve_value(
    value: &Value,
    workflow: &Workflow,
    ctx: &ExecutionContext,
    scope: &ResolveScope<'_>,
) -> Result<Value, BlockError> {
    match value {
        Value::String(s) => resolve_string(s, workflow, ctx, scope),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, workflow, ctx, scope)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, workflow, ctx, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    s: &str,
    workflow: &Workflow,
    ctx: &ExecutionContext,
    scope: &ResolveScope<'_>,
) -> Result<Value, BlockError> {
    let substituted = substitute_env(s, &ctx.environment_variables);
    let tokens = find_tokens(&substituted);

    if tokens.is_empty() {
        return Ok(Value::String(substituted));
    }

    // A lone token keeps the referenced value's type.
    if tokens.len() == 1 {
        let (start, end) = tokens[0];
        if start == 0 && end == substituted.len() {
            let inner = &substituted[start + 1..end - 1];
            return resolve_token(inner, workflow, ctx, scope);
        }
    }

    let mut result = String::new();
    let mut cursor = 0;
    for (start, end) in tokens {
        result.push_str(&substituted[cursor..start]);
        let inner = &substituted[start + 1..end - 1];
        let resolved = resolve_token(inner, workflow, ctx, scope)?;
        match resolved {
            Value::String(s) => result.push_str(&s),
            other => result.push_str(&other.to_string()),
        }
        cursor = end;
    }
    result.push_str(&substituted[cursor..]);
    Ok(Value::String(result))
}

/// Byte ranges (inclusive of delimiters) of well-formed `<source.path>`
/// tokens. Angle brackets around anything else are left alone.
fn find_tokens(s: &str) -> Vec<(usize, usize)> {
    let bytes = s.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' {
            if let Some(rel_end) = s[i + 1..].find('>') {
                let end = i + 1 + rel_end;
                let inner = &s[i + 1..end];
                if is_reference(inner) {
                    tokens.push((i, end + 1));
                    i = end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    tokens
}

fn is_reference(inner: &str) -> bool {
    inner.contains('.')
        && !inner.is_empty()
        && inner
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
}

fn substitute_env(s: &str, env: &IndexMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        if let Some(rel_end) = rest[start + 2..].find("}}") {
            let name = &rest[start + 2..start + 2 + rel_end];
            out.push_str(&rest[..start]);
            match env.get(name.trim()) {
                Some(val) => out.push_str(val),
                None => {
                    // Unknown env names pass through untouched.
                    out.push_str(&rest[start..start + 2 + rel_end + 2]);
                }
            }
            rest = &rest[start + 2 + rel_end + 2..];
        } else {
            break;
        }
    }
    out.push_str(rest);
    out
}

fn resolve_token(
    inner: &str,
    workflow: &Workflow,
    ctx: &ExecutionContext,
    scope: &ResolveScope<'_>,
) -> Result<Value, BlockError> {
    let (source, path) = inner.split_once('.').ok_or_else(|| {
        BlockError::ReferenceError(format!("malformed reference token: <{}>", inner))
    })?;

    match source {
        "loop" => resolve_loop_accessor(path, ctx, scope),
        "parallel" => resolve_parallel_accessor(path, scope),
        "variable" => ctx
            .workflow_variables
            .get(path)
            .cloned()
            .ok_or_else(|| BlockError::ReferenceError(format!("unknown variable: {}", path))),
        _ => resolve_block_reference(source, path, workflow, ctx, scope),
    }
}

fn resolve_loop_accessor(
    path: &str,
    ctx: &ExecutionContext,
    scope: &ResolveScope<'_>,
) -> Result<Value, BlockError> {
    let container = scope.loop_container.ok_or_else(|| {
        BlockError::ReferenceError(format!("<loop.{}> used outside a loop container", path))
    })?;
    match path {
        "item" => ctx.loop_items.get(container).cloned().ok_or_else(|| {
            BlockError::ReferenceError(format!("loop {} has no current item", container))
        }),
        "index" => Ok(Value::from(
            ctx.loop_iterations.get(container).copied().unwrap_or(0),
        )),
        other => Err(BlockError::ReferenceError(format!(
            "unknown loop accessor: <loop.{}>",
            other
        ))),
    }
}

fn resolve_parallel_accessor(
    path: &str,
    scope: &ResolveScope<'_>,
) -> Result<Value, BlockError> {
    match path {
        "item" => scope.parallel_item.cloned().ok_or_else(|| {
            BlockError::ReferenceError("<parallel.item> used outside a parallel branch".into())
        }),
        "index" => scope.parallel_index.map(Value::from).ok_or_else(|| {
            BlockError::ReferenceError("<parallel.index> used outside a parallel branch".into())
        }),
        other => Err(BlockError::ReferenceError(format!(
            "unknown parallel accessor: <parallel.{}>",
            other
        ))),
    }
}

fn resolve_block_reference(
    source: &str,
    path: &str,
    workflow: &Workflow,
    ctx: &ExecutionContext,
    scope: &ResolveScope<'_>,
) -> Result<Value, BlockError> {
    let block_id = lookup_block_id(source, workflow).ok_or_else(|| {
        BlockError::ReferenceError(format!("reference to unknown block: {}", source))
    })?;

    let state = scope
        .local_states
        .and_then(|local| local.get(&block_id))
        .or_else(|| ctx.block_states.get(&block_id))
        .ok_or_else(|| {
            BlockError::ReferenceError(format!(
                "block {} referenced before execution",
                source
            ))
        })?;

    navigate(&state.output, path).ok_or_else(|| {
        BlockError::ReferenceError(format!("path {} not found in output of {}", path, source))
    })
}

/// Match a reference source against block ids first, then normalized names
/// ("Email Sender" is referenced as `<emailsender.field>`).
fn lookup_block_id(source: &str, workflow: &Workflow) -> Option<String> {
    if workflow.block(source).is_some() {
        return Some(source.to_string());
    }
    let wanted = normalize_name(source);
    workflow
        .blocks()
        .find(|b| normalize_name(&b.name) == wanted)
        .map(|b| b.id.clone())
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

fn navigate(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
