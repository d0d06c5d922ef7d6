//! Compose to Swarm conversion
//!
//! Conversion reads the normalized Compose model and a stack namespace and
//! produces engine request objects. Apart from reading secret and config
//! files it performs no I/O.

pub mod compose;
pub mod service;
pub mod volume;

use crate::error::{Result, StackError};
use std::collections::BTreeMap;

pub use compose::{configs, networks, secrets, services_networks};
pub use service::{services, ObjectIds};
pub use volume::volumes;

/// Label carrying the stack name on every stack resource
pub const LABEL_NAMESPACE: &str = "com.docker.stack.namespace";

/// Label carrying the image as written in the Compose file
pub const LABEL_IMAGE: &str = "com.docker.stack.image";

/// Name of the implicit network
pub const DEFAULT_NETWORK: &str = "default";

/// A stack name and the scoping rule it implies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    name: String,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<namespace>_<local>`
    pub fn scope(&self, local: &str) -> String {
        format!("{}_{}", self.name, local)
    }

    /// Server name: the explicit name when set, the scoped local name otherwise
    pub fn resolve(&self, local: &str, explicit: Option<&str>) -> String {
        match explicit.filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => self.scope(local),
        }
    }

    /// Strip the namespace prefix from a server name
    pub fn descope<'a>(&self, name: &'a str) -> &'a str {
        name.strip_prefix(&self.name)
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(name)
    }
}

/// Copy `labels` and add the stack label
pub fn add_stack_label(
    namespace: &Namespace,
    labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = labels.clone();
    out.insert(LABEL_NAMESPACE.to_string(), namespace.name().to_string());
    out
}

/// Label filter value selecting a stack's resources
pub fn namespace_filter(namespace: &str) -> String {
    format!("{}={}", LABEL_NAMESPACE, namespace)
}

/// Parse a Go-style duration (`1h30m`, `10s`, `1.5s`, `300ms`) into nanoseconds
pub fn parse_duration(text: &str) -> Result<i64> {
    let invalid = || StackError::Validation(format!("invalid duration: {:?}", text));
    let trimmed = text.trim();
    let (negative, mut rest) = match trimmed.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if rest == "0" {
        return Ok(0);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: f64 = 0.0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale: f64 = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        total += value * scale;
        rest = &rest[unit_end..];
    }

    let nanos = total.round() as i64;
    Ok(if negative { -nanos } else { nanos })
}

/// Parse an optional duration field
pub fn parse_duration_opt(text: Option<&str>) -> Result<Option<i64>> {
    text.map(parse_duration).transpose()
}
