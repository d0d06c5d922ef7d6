//! In-memory engine used by tests
//!
//! Reads are served from [`FakeState`]; every mutating call is appended to
//! `calls` so ordering can be asserted.

use super::{EngineApi, Filters, ServiceCreateOptions, ServiceListOptions, ServiceUpdateOptions};
use crate::error::{Result, StackError};
use crate::swarm::config::IdResponse;
use crate::swarm::network::NetworkCreateResponse;
use crate::swarm::service::{ServiceCreateResponse, ServiceUpdateResponse};
use crate::swarm::{
    Config, ConfigSpec, NetworkCreate, NetworkResource, Node, ObjectVersion, Secret, SecretSpec,
    ServerVersion, Service, ServiceSpec, SystemInfo, Task,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// A mutating engine call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ServiceCreate {
        spec: ServiceSpec,
        registry_auth: Option<String>,
        query_registry: bool,
    },
    ServiceUpdate {
        id: String,
        version: u64,
        spec: ServiceSpec,
        registry_auth_from: Option<String>,
        query_registry: bool,
    },
    ServiceRemove(String),
    NetworkCreate(NetworkCreate),
    NetworkRemove(String),
    SecretCreate(SecretSpec),
    SecretUpdate { id: String, version: u64 },
    SecretRemove(String),
    ConfigCreate(ConfigSpec),
    ConfigUpdate { id: String, version: u64 },
    ConfigRemove(String),
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub version: ServerVersion,
    pub info: SystemInfo,
    pub services: Vec<Service>,
    pub networks: Vec<NetworkResource>,
    pub secrets: Vec<Secret>,
    pub configs: Vec<Config>,
    pub tasks: Vec<Task>,
    pub nodes: Vec<Node>,
    pub calls: Vec<Call>,
    /// Warnings returned by every service update
    pub update_warnings: Vec<String>,
    /// Service names whose create or update fails
    pub failing_services: BTreeSet<String>,
    /// Object IDs whose removal fails
    pub failing_removals: BTreeSet<String>,
}

pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    /// A swarm manager speaking the current API version
    pub fn new() -> Self {
        let mut state = FakeState::default();
        state.version.api_version = super::DEFAULT_API_VERSION.to_string();
        state.info.swarm.control_available = true;
        state.info.swarm.local_node_state = "active".to_string();
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn add_service(&self, id: &str, spec: ServiceSpec) {
        self.state().services.push(Service {
            id: id.to_string(),
            version: ObjectVersion { index: 1 },
            spec,
            ..Default::default()
        });
    }

    pub fn add_network(&self, id: &str, name: &str, scope: &str, labels: &[(&str, &str)]) {
        self.state().networks.push(NetworkResource {
            id: id.to_string(),
            name: name.to_string(),
            scope: scope.to_string(),
            driver: "overlay".to_string(),
            labels: to_map(labels),
            ..Default::default()
        });
    }

    pub fn add_secret(&self, id: &str, name: &str, labels: &[(&str, &str)]) {
        self.state().secrets.push(Secret {
            id: id.to_string(),
            version: ObjectVersion { index: 1 },
            spec: SecretSpec {
                name: name.to_string(),
                labels: to_map(labels),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    pub fn add_config(&self, id: &str, name: &str, labels: &[(&str, &str)]) {
        self.state().configs.push(Config {
            id: id.to_string(),
            version: ObjectVersion { index: 1 },
            spec: ConfigSpec {
                name: name.to_string(),
                labels: to_map(labels),
                ..Default::default()
            },
            ..Default::default()
        });
    }
}

pub fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn not_found(kind: &str, id: &str) -> StackError {
    StackError::Remote {
        status: 404,
        message: format!("{} {} not found", kind, id),
    }
}

/// Engine-style filter matching on labels, names and IDs
fn matches(filters: &Filters, id: &str, name: &str, labels: &BTreeMap<String, String>) -> bool {
    filters.iter().all(|(key, values)| match key {
        "label" => values.iter().all(|wanted| match wanted.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|have| have == v),
            None => labels.contains_key(wanted),
        }),
        "name" => values.iter().any(|wanted| name.starts_with(wanted.as_str())),
        "id" => values.iter().any(|wanted| id.starts_with(wanted.as_str())),
        _ => true,
    })
}

fn task_labels(task: &Task) -> BTreeMap<String, String> {
    task.spec
        .container_spec
        .as_ref()
        .map(|c| c.labels.clone())
        .unwrap_or_default()
}

#[async_trait]
impl EngineApi for FakeEngine {
    async fn server_version(&self) -> Result<ServerVersion> {
        Ok(self.state().version.clone())
    }

    async fn info(&self) -> Result<SystemInfo> {
        Ok(self.state().info.clone())
    }

    async fn service_list(&self, options: &ServiceListOptions) -> Result<Vec<Service>> {
        Ok(self
            .state()
            .services
            .iter()
            .filter(|s| matches(&options.filters, &s.id, &s.spec.name, &s.spec.labels))
            .cloned()
            .collect())
    }

    async fn service_inspect(&self, id: &str) -> Result<Service> {
        self.state()
            .services
            .iter()
            .find(|s| s.id == id || s.spec.name == id)
            .cloned()
            .ok_or_else(|| not_found("service", id))
    }

    async fn service_create(
        &self,
        spec: &ServiceSpec,
        options: &ServiceCreateOptions,
    ) -> Result<ServiceCreateResponse> {
        let mut state = self.state();
        state.calls.push(Call::ServiceCreate {
            spec: spec.clone(),
            registry_auth: options.encoded_registry_auth.clone(),
            query_registry: options.query_registry,
        });
        if state.failing_services.contains(&spec.name) {
            return Err(StackError::Remote {
                status: 500,
                message: format!("cannot create {}", spec.name),
            });
        }
        let id = format!("{}-id", spec.name);
        state.services.push(Service {
            id: id.clone(),
            version: ObjectVersion { index: 1 },
            spec: spec.clone(),
            ..Default::default()
        });
        Ok(ServiceCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn service_update(
        &self,
        id: &str,
        version: ObjectVersion,
        spec: &ServiceSpec,
        options: &ServiceUpdateOptions,
    ) -> Result<ServiceUpdateResponse> {
        let mut state = self.state();
        state.calls.push(Call::ServiceUpdate {
            id: id.to_string(),
            version: version.index,
            spec: spec.clone(),
            registry_auth_from: options.registry_auth_from.clone(),
            query_registry: options.query_registry,
        });
        if state.failing_services.contains(&spec.name) {
            return Err(StackError::Remote {
                status: 500,
                message: format!("cannot update {}", spec.name),
            });
        }
        let warnings = state.update_warnings.clone();
        let service = state
            .services
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| not_found("service", id))?;
        if service.version != version {
            return Err(StackError::Remote {
                status: 500,
                message: "update out of sequence".to_string(),
            });
        }
        service.previous_spec = Some(std::mem::replace(&mut service.spec, spec.clone()));
        service.version.index += 1;
        Ok(ServiceUpdateResponse { warnings })
    }

    async fn service_remove(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::ServiceRemove(id.to_string()));
        if state.failing_removals.contains(id) {
            return Err(StackError::Remote {
                status: 500,
                message: format!("cannot remove service {}", id),
            });
        }
        state.services.retain(|s| s.id != id);
        Ok(())
    }

    async fn network_list(&self, filters: &Filters) -> Result<Vec<NetworkResource>> {
        Ok(self
            .state()
            .networks
            .iter()
            .filter(|n| matches(filters, &n.id, &n.name, &n.labels))
            .cloned()
            .collect())
    }

    async fn network_inspect(&self, id: &str) -> Result<NetworkResource> {
        self.state()
            .networks
            .iter()
            .find(|n| n.id == id || n.name == id)
            .cloned()
            .ok_or_else(|| not_found("network", id))
    }

    async fn network_create(&self, request: &NetworkCreate) -> Result<NetworkCreateResponse> {
        let mut state = self.state();
        state.calls.push(Call::NetworkCreate(request.clone()));
        let id = format!("{}-id", request.name);
        state.networks.push(NetworkResource {
            id: id.clone(),
            name: request.name.clone(),
            scope: "swarm".to_string(),
            driver: request.driver.clone().unwrap_or_default(),
            internal: request.internal,
            attachable: request.attachable,
            labels: request.labels.clone(),
        });
        Ok(NetworkCreateResponse {
            id,
            warning: String::new(),
        })
    }

    async fn network_remove(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::NetworkRemove(id.to_string()));
        if state.failing_removals.contains(id) {
            return Err(StackError::Remote {
                status: 500,
                message: format!("network {} has active endpoints", id),
            });
        }
        state.networks.retain(|n| n.id != id);
        Ok(())
    }

    async fn secret_list(&self, filters: &Filters) -> Result<Vec<Secret>> {
        Ok(self
            .state()
            .secrets
            .iter()
            .filter(|s| matches(filters, &s.id, &s.spec.name, &s.spec.labels))
            .cloned()
            .collect())
    }

    async fn secret_inspect(&self, id: &str) -> Result<Secret> {
        self.state()
            .secrets
            .iter()
            .find(|s| s.id == id || s.spec.name == id)
            .cloned()
            .ok_or_else(|| not_found("secret", id))
    }

    async fn secret_create(&self, spec: &SecretSpec) -> Result<IdResponse> {
        let mut state = self.state();
        state.calls.push(Call::SecretCreate(spec.clone()));
        let id = format!("{}-id", spec.name);
        state.secrets.push(Secret {
            id: id.clone(),
            version: ObjectVersion { index: 1 },
            spec: spec.clone(),
            ..Default::default()
        });
        Ok(IdResponse { id })
    }

    async fn secret_update(
        &self,
        id: &str,
        version: ObjectVersion,
        spec: &SecretSpec,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::SecretUpdate {
            id: id.to_string(),
            version: version.index,
        });
        let secret = state
            .secrets
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| not_found("secret", id))?;
        secret.spec = spec.clone();
        secret.version.index += 1;
        Ok(())
    }

    async fn secret_remove(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::SecretRemove(id.to_string()));
        if state.failing_removals.contains(id) {
            return Err(StackError::Remote {
                status: 500,
                message: format!("secret {} is in use", id),
            });
        }
        state.secrets.retain(|s| s.id != id);
        Ok(())
    }

    async fn config_list(&self, filters: &Filters) -> Result<Vec<Config>> {
        Ok(self
            .state()
            .configs
            .iter()
            .filter(|c| matches(filters, &c.id, &c.spec.name, &c.spec.labels))
            .cloned()
            .collect())
    }

    async fn config_inspect(&self, id: &str) -> Result<Config> {
        self.state()
            .configs
            .iter()
            .find(|c| c.id == id || c.spec.name == id)
            .cloned()
            .ok_or_else(|| not_found("config", id))
    }

    async fn config_create(&self, spec: &ConfigSpec) -> Result<IdResponse> {
        let mut state = self.state();
        state.calls.push(Call::ConfigCreate(spec.clone()));
        let id = format!("{}-id", spec.name);
        state.configs.push(Config {
            id: id.clone(),
            version: ObjectVersion { index: 1 },
            spec: spec.clone(),
            ..Default::default()
        });
        Ok(IdResponse { id })
    }

    async fn config_update(
        &self,
        id: &str,
        version: ObjectVersion,
        spec: &ConfigSpec,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::ConfigUpdate {
            id: id.to_string(),
            version: version.index,
        });
        let config = state
            .configs
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("config", id))?;
        config.spec = spec.clone();
        config.version.index += 1;
        Ok(())
    }

    async fn config_remove(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::ConfigRemove(id.to_string()));
        if state.failing_removals.contains(id) {
            return Err(StackError::Remote {
                status: 500,
                message: format!("config {} is in use", id),
            });
        }
        state.configs.retain(|c| c.id != id);
        Ok(())
    }

    async fn task_list(&self, filters: &Filters) -> Result<Vec<Task>> {
        let services = filters.get("service");
        Ok(self
            .state()
            .tasks
            .iter()
            .filter(|t| services.is_empty() || services.contains(&t.service_id.as_str()))
            .filter(|t| {
                let mut rest = filters.clone();
                rest.set("service", Vec::new());
                matches(&rest, &t.id, t.name.as_deref().unwrap_or(""), &task_labels(t))
            })
            .cloned()
            .collect())
    }

    async fn node_list(&self, filters: &Filters) -> Result<Vec<Node>> {
        Ok(self
            .state()
            .nodes
            .iter()
            .filter(|n| matches(filters, &n.id, &n.description.hostname, &BTreeMap::new()))
            .cloned()
            .collect())
    }

    async fn node_inspect(&self, id: &str) -> Result<Node> {
        self.state()
            .nodes
            .iter()
            .find(|n| n.id == id || n.description.hostname == id)
            .cloned()
            .ok_or_else(|| not_found("node", id))
    }
}
