//! Docker Engine API
//!
//! [`EngineApi`] is the seam between the stack commands and the daemon.
//! [`EngineClient`] speaks HTTP/1.1 to a real engine; tests use an in-memory
//! fake that records every call.

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod transport;

use crate::error::{Result, StackError};
use crate::swarm::config::IdResponse;
use crate::swarm::network::NetworkCreateResponse;
use crate::swarm::service::{ServiceCreateResponse, ServiceUpdateResponse};
use crate::swarm::{
    Config, ConfigSpec, NetworkCreate, NetworkResource, Node, ObjectVersion, Secret, SecretSpec,
    ServerVersion, Service, ServiceSpec, SystemInfo, Task,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

pub use client::EngineClient;

/// Highest API version this client speaks
pub const DEFAULT_API_VERSION: &str = "1.47";

/// Engine operations used by the stack commands
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn server_version(&self) -> Result<ServerVersion>;
    async fn info(&self) -> Result<SystemInfo>;

    async fn service_list(&self, options: &ServiceListOptions) -> Result<Vec<Service>>;
    async fn service_inspect(&self, id: &str) -> Result<Service>;
    async fn service_create(
        &self,
        spec: &ServiceSpec,
        options: &ServiceCreateOptions,
    ) -> Result<ServiceCreateResponse>;
    async fn service_update(
        &self,
        id: &str,
        version: ObjectVersion,
        spec: &ServiceSpec,
        options: &ServiceUpdateOptions,
    ) -> Result<ServiceUpdateResponse>;
    async fn service_remove(&self, id: &str) -> Result<()>;

    async fn network_list(&self, filters: &Filters) -> Result<Vec<NetworkResource>>;
    async fn network_inspect(&self, id: &str) -> Result<NetworkResource>;
    async fn network_create(&self, request: &NetworkCreate) -> Result<NetworkCreateResponse>;
    async fn network_remove(&self, id: &str) -> Result<()>;

    async fn secret_list(&self, filters: &Filters) -> Result<Vec<Secret>>;
    async fn secret_inspect(&self, id: &str) -> Result<Secret>;
    async fn secret_create(&self, spec: &SecretSpec) -> Result<IdResponse>;
    async fn secret_update(&self, id: &str, version: ObjectVersion, spec: &SecretSpec)
        -> Result<()>;
    async fn secret_remove(&self, id: &str) -> Result<()>;

    async fn config_list(&self, filters: &Filters) -> Result<Vec<Config>>;
    async fn config_inspect(&self, id: &str) -> Result<Config>;
    async fn config_create(&self, spec: &ConfigSpec) -> Result<IdResponse>;
    async fn config_update(&self, id: &str, version: ObjectVersion, spec: &ConfigSpec)
        -> Result<()>;
    async fn config_remove(&self, id: &str) -> Result<()>;

    async fn task_list(&self, filters: &Filters) -> Result<Vec<Task>>;

    async fn node_list(&self, filters: &Filters) -> Result<Vec<Node>>;
    async fn node_inspect(&self, id: &str) -> Result<Node>;
}

/// Service list options
#[derive(Debug, Clone, Default)]
pub struct ServiceListOptions {
    pub filters: Filters,
    /// Ask the engine for running and desired task counts
    pub status: bool,
}

/// Service create options
#[derive(Debug, Clone, Default)]
pub struct ServiceCreateOptions {
    /// Value of the `X-Registry-Auth` header
    pub encoded_registry_auth: Option<String>,
    /// Let the engine resolve the image digest against the registry
    pub query_registry: bool,
}

/// Service update options
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdateOptions {
    pub encoded_registry_auth: Option<String>,
    /// `spec` or `previous-spec`
    pub registry_auth_from: Option<String>,
    pub query_registry: bool,
}

/// The engine's `filters` query argument
///
/// Renders as `{"label":["k=v"],"name":["x"]}`. Parsing also accepts the
/// older `{"label":{"k=v":true}}` form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    fields: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FilterValues {
    List(Vec<String>),
    Map(BTreeMap<String, bool>),
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Filters::add`]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.add(key, value);
        self
    }

    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.fields
            .entry(key.to_string())
            .or_default()
            .insert(value.into());
    }

    /// Replace every value of `key`
    pub fn set(&mut self, key: &str, values: impl IntoIterator<Item = String>) {
        let values: BTreeSet<String> = values.into_iter().collect();
        if values.is_empty() {
            self.fields.remove(key);
        } else {
            self.fields.insert(key.to_string(), values);
        }
    }

    pub fn get(&self, key: &str) -> Vec<&str> {
        self.fields
            .get(key)
            .map(|values| values.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Add every pair of `other`
    pub fn extend(&mut self, other: &Filters) {
        for (key, values) in &other.fields {
            for value in values {
                self.add(key, value.clone());
            }
        }
    }

    /// Parse a `-f key=value` command-line argument
    pub fn parse_arg(&mut self, arg: &str) -> Result<()> {
        match arg.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                self.add(&key.trim().to_lowercase(), value.to_string());
                Ok(())
            }
            _ => Err(StackError::Usage(format!(
                "bad format of filter (expected name=value): {}",
                arg
            ))),
        }
    }

    /// Parse the JSON form used in query strings
    pub fn from_json(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let raw: BTreeMap<String, FilterValues> = serde_json::from_str(text)?;
        let mut filters = Self::default();
        for (key, values) in raw {
            match values {
                FilterValues::List(list) => filters.set(&key, list),
                FilterValues::Map(map) => {
                    filters.set(&key, map.into_iter().filter(|(_, v)| *v).map(|(k, _)| k))
                }
            }
        }
        Ok(filters)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_render_and_parse() {
        let filters = Filters::new()
            .with("label", "com.docker.stack.namespace=s")
            .with("name", "web");
        let json = filters.to_json();
        assert_eq!(
            json,
            r#"{"label":["com.docker.stack.namespace=s"],"name":["web"]}"#
        );
        assert_eq!(Filters::from_json(&json).unwrap(), filters);
    }

    #[test]
    fn test_filters_accept_legacy_map_form() {
        let filters = Filters::from_json(r#"{"name":{"foo":true,"bar":false}}"#).unwrap();
        assert_eq!(filters.get("name"), vec!["foo"]);
        assert!(Filters::from_json("").unwrap().is_empty());
    }

    #[test]
    fn test_filter_args() {
        let mut filters = Filters::new();
        filters.parse_arg("Name=web").unwrap();
        filters.parse_arg("label=a=b").unwrap();
        assert_eq!(filters.get("name"), vec!["web"]);
        assert_eq!(filters.get("label"), vec!["a=b"]);
        assert!(filters.parse_arg("novalue").is_err());
    }

    #[test]
    fn test_filters_set_replaces() {
        let mut filters = Filters::new().with("name", "a");
        filters.set("name", vec!["b".to_string()]);
        assert_eq!(filters.get("name"), vec!["b"]);
        filters.set("name", Vec::new());
        assert!(!filters.contains("name"));
    }
}
