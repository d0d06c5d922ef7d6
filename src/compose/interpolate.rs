//! Variable interpolation for Compose documents
//!
//! Supports `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
//! `${VAR:?error}`, `${VAR?error}`, `${VAR:+replacement}`, `${VAR+replacement}`
//! and `$$` escapes. Defaults may themselves contain references.

use crate::error::{Result, StackError};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Scalar type a path is cast to after substitution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cast {
    Int,
    Float,
    Bool,
}

/// Paths whose string values become typed after interpolation; `*` matches
/// any single key or list index
const CASTS: &[(&str, Cast)] = &[
    ("services.*.deploy.replicas", Cast::Int),
    ("services.*.deploy.update_config.parallelism", Cast::Int),
    ("services.*.deploy.update_config.max_failure_ratio", Cast::Float),
    ("services.*.deploy.rollback_config.parallelism", Cast::Int),
    ("services.*.deploy.rollback_config.max_failure_ratio", Cast::Float),
    ("services.*.deploy.restart_policy.max_attempts", Cast::Int),
    ("services.*.deploy.placement.max_replicas_per_node", Cast::Int),
    ("services.*.deploy.resources.limits.pids", Cast::Int),
    ("services.*.healthcheck.retries", Cast::Int),
    ("services.*.healthcheck.disable", Cast::Bool),
    ("services.*.ports.*.target", Cast::Int),
    ("services.*.ulimits.*", Cast::Int),
    ("services.*.ulimits.*.hard", Cast::Int),
    ("services.*.ulimits.*.soft", Cast::Int),
    ("services.*.secrets.*.mode", Cast::Int),
    ("services.*.configs.*.mode", Cast::Int),
    ("services.*.read_only", Cast::Bool),
    ("services.*.stdin_open", Cast::Bool),
    ("services.*.tty", Cast::Bool),
    ("services.*.init", Cast::Bool),
    ("services.*.privileged", Cast::Bool),
    ("services.*.volumes.*.read_only", Cast::Bool),
    ("services.*.volumes.*.volume.nocopy", Cast::Bool),
    ("networks.*.external", Cast::Bool),
    ("networks.*.internal", Cast::Bool),
    ("networks.*.attachable", Cast::Bool),
    ("volumes.*.external", Cast::Bool),
    ("secrets.*.external", Cast::Bool),
    ("configs.*.external", Cast::Bool),
];

/// Variable lookup used during substitution
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<&str>;
}

impl Lookup for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl Lookup for std::collections::HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// Interpolate every scalar string of a parsed document in place
pub fn interpolate_document<L: Lookup>(document: &mut Value, env: &L) -> Result<()> {
    let mut missing = BTreeSet::new();
    let mut path = Vec::new();
    walk(document, env, &mut path, &mut missing)?;

    if !missing.is_empty() {
        let names: Vec<String> = missing.into_iter().collect();
        return Err(StackError::Interpolation(format!(
            "required variables are not set: {}",
            names.join(", ")
        )));
    }
    Ok(())
}

fn walk<L: Lookup>(
    value: &mut Value,
    env: &L,
    path: &mut Vec<String>,
    missing: &mut BTreeSet<String>,
) -> Result<()> {
    match value {
        Value::String(s) => {
            let substituted = substitute_collecting(s, env, missing).map_err(|e| match e {
                StackError::Interpolation(msg) => StackError::Interpolation(format!(
                    "invalid interpolation format for {}: {}",
                    path.join("."),
                    msg
                )),
                other => other,
            })?;
            *value = cast(path, substituted)?;
        }
        Value::Mapping(map) => {
            for (key, child) in map.iter_mut() {
                let key = match key {
                    Value::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)?.trim().to_string(),
                };
                path.push(key);
                walk(child, env, path, missing)?;
                path.pop();
            }
        }
        Value::Sequence(items) => {
            for (idx, child) in items.iter_mut().enumerate() {
                path.push(idx.to_string());
                walk(child, env, path, missing)?;
                path.pop();
            }
        }
        Value::Tagged(tagged) => walk(&mut tagged.value, env, path, missing)?,
        _ => {}
    }
    Ok(())
}

fn cast(path: &[String], text: String) -> Result<Value> {
    let Some(kind) = CASTS
        .iter()
        .find(|(pattern, _)| path_matches(pattern, path))
        .map(|(_, kind)| *kind)
    else {
        return Ok(Value::String(text));
    };

    let invalid = |what: &str| {
        StackError::Validation(format!(
            "{}: cannot convert {:?} to {}",
            path.join("."),
            text,
            what
        ))
    };

    match kind {
        Cast::Int => text
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| invalid("integer")),
        Cast::Float => text
            .trim()
            .parse::<f64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| invalid("float")),
        Cast::Bool => match text.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" | "on" => Ok(Value::Bool(true)),
            "n" | "no" | "false" | "off" => Ok(Value::Bool(false)),
            _ => Err(invalid("boolean")),
        },
    }
}

fn path_matches(pattern: &str, path: &[String]) -> bool {
    let parts: Vec<&str> = pattern.split('.').collect();
    parts.len() == path.len()
        && parts
            .iter()
            .zip(path)
            .all(|(p, actual)| *p == "*" || p == actual)
}

/// Substitute a single string; any unset variable without a default is an error
pub fn substitute<L: Lookup>(template: &str, env: &L) -> Result<String> {
    let mut missing = BTreeSet::new();
    let out = substitute_collecting(template, env, &mut missing)?;
    if let Some(name) = missing.into_iter().next() {
        return Err(StackError::Interpolation(format!(
            "variable {:?} is not set",
            name
        )));
    }
    Ok(out)
}

fn substitute_collecting<L: Lookup>(
    template: &str,
    env: &L,
    missing: &mut BTreeSet<String>,
) -> Result<String> {
    if !template.contains('$') {
        return Ok(template.to_string());
    }

    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        match chars.get(i + 1) {
            Some('$') => {
                out.push('$');
                i += 2;
            }
            Some('{') => {
                let close = matching_brace(&chars, i + 1).ok_or_else(|| {
                    StackError::Interpolation(format!("invalid template: {:?}", template))
                })?;
                let inner: String = chars[i + 2..close].iter().collect();
                out.push_str(&expand_braced(&inner, template, env, missing)?);
                i = close + 1;
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                match env.lookup(&name) {
                    Some(v) => out.push_str(v),
                    None => {
                        missing.insert(name);
                    }
                }
                i = end;
            }
            _ => {
                return Err(StackError::Interpolation(format!(
                    "invalid template: {:?}",
                    template
                )))
            }
        }
    }

    Ok(out)
}

fn matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0;
    for (idx, c) in chars.iter().enumerate().skip(open) {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn expand_braced<L: Lookup>(
    inner: &str,
    template: &str,
    env: &L,
    missing: &mut BTreeSet<String>,
) -> Result<String> {
    let name_end = inner
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(inner.len());
    let (name, rest) = inner.split_at(name_end);

    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(StackError::Interpolation(format!(
            "invalid template: {:?}",
            template
        )));
    }

    let value = env.lookup(name);
    let set = value.is_some();
    let non_empty = value.map(|v| !v.is_empty()).unwrap_or(false);

    let (op, arg) = if let Some(arg) = rest.strip_prefix(":-") {
        (":-", arg)
    } else if let Some(arg) = rest.strip_prefix(":?") {
        (":?", arg)
    } else if let Some(arg) = rest.strip_prefix(":+") {
        (":+", arg)
    } else if let Some(arg) = rest.strip_prefix('-') {
        ("-", arg)
    } else if let Some(arg) = rest.strip_prefix('?') {
        ("?", arg)
    } else if let Some(arg) = rest.strip_prefix('+') {
        ("+", arg)
    } else if rest.is_empty() {
        ("", "")
    } else {
        return Err(StackError::Interpolation(format!(
            "invalid template: {:?}",
            template
        )));
    };

    let current = value.unwrap_or_default().to_string();
    match op {
        "" => {
            if !set {
                missing.insert(name.to_string());
            }
            Ok(current)
        }
        ":-" if non_empty => Ok(current),
        ":-" => substitute_collecting(arg, env, missing),
        "-" if set => Ok(current),
        "-" => substitute_collecting(arg, env, missing),
        ":?" if non_empty => Ok(current),
        "?" if set => Ok(current),
        ":?" | "?" => {
            let message = substitute_collecting(arg, env, missing)?;
            Err(StackError::Interpolation(format!(
                "required variable {} is missing a value: {}",
                name, message
            )))
        }
        ":+" if non_empty => substitute_collecting(arg, env, missing),
        "+" if set => substitute_collecting(arg, env, missing),
        _ => Ok(String::new()),
    }
}
