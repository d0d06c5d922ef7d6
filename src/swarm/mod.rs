//! Docker Swarm API objects
//!
//! Typed mirrors of the engine's JSON for services, tasks, networks, secrets,
//! configs and nodes.

pub mod config;
pub mod network;
pub mod node;
pub mod service;
pub mod task;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub use config::{Config, ConfigSpec, Secret, SecretSpec};
pub use network::{NetworkCreate, NetworkResource};
pub use node::{Node, ServerVersion, SystemInfo};
pub use service::{Service, ServiceSpec};
pub use task::{Task, TaskState};

/// Object version used for optimistic concurrency on updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectVersion {
    #[serde(default)]
    pub index: u64,
}

fn nullable_vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
}

fn nullable_map<'de, D, T>(d: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<BTreeMap<String, T>>::deserialize(d)?.unwrap_or_default())
}
