//! Docker Compose configuration types
//!
//! Short and long syntaxes are accepted on input and collapsed into one
//! normalized shape, so merging and conversion only ever see long forms.

use super::syntax;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Docker Compose file configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Services
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(
        default,
        deserialize_with = "nullable_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Volumes
    #[serde(
        default,
        deserialize_with = "nullable_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub volumes: BTreeMap<String, VolumeConfig>,
    /// Secrets
    #[serde(
        default,
        deserialize_with = "nullable_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub secrets: BTreeMap<String, SecretConfig>,
    /// Configs
    #[serde(
        default,
        deserialize_with = "nullable_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub configs: BTreeMap<String, ConfigObjConfig>,
    /// Included documents, resolved by the loader
    #[serde(default, skip_serializing)]
    pub include: Vec<IncludeConfig>,
    /// Extension fields (`x-*`)
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

/// Service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Explicit server-side name, bypassing the stack prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Command (`Args` on the task)
    #[serde(
        default,
        deserialize_with = "command",
        skip_serializing_if = "Option::is_none"
    )]
    pub command: Option<Vec<String>>,
    /// Entrypoint (`Command` on the task)
    #[serde(
        default,
        deserialize_with = "command",
        skip_serializing_if = "Option::is_none"
    )]
    pub entrypoint: Option<Vec<String>>,
    /// Environment variables; `None` values are taken from the environment
    #[serde(
        default,
        deserialize_with = "mapping_with_equals",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub environment: BTreeMap<String, Option<String>>,
    /// Environment files
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub env_file: Vec<String>,
    /// Labels
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    /// Published ports
    #[serde(
        default,
        deserialize_with = "ports",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ports: Vec<ServicePortConfig>,
    /// Volume mounts
    #[serde(
        default,
        deserialize_with = "volumes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volumes: Vec<ServiceVolumeConfig>,
    /// Networks to attach to
    #[serde(
        default,
        deserialize_with = "service_networks",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub networks: BTreeMap<String, Option<ServiceNetworkConfig>>,
    /// Secret references
    #[serde(
        default,
        deserialize_with = "file_refs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub secrets: Vec<ServiceFileRef>,
    /// Config references
    #[serde(
        default,
        deserialize_with = "file_refs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub configs: Vec<ServiceFileRef>,
    /// Healthcheck configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Deploy configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,
    /// Restart policy (`no`, `always`, `unless-stopped`, `on-failure[:N]`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Stop grace period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,
    /// Stop signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    /// User
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Read only root filesystem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// TTY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
    /// Stdin open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_open: Option<bool>,
    /// Init process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,
    /// Isolation technology (Windows)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<String>,
    /// Credential spec (Windows)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_spec: Option<CredentialSpecConfig>,
    /// Logging configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    /// DNS servers
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub dns: Vec<String>,
    /// DNS search domains
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub dns_search: Vec<String>,
    /// Extra hosts (`host:ip`)
    #[serde(
        default,
        deserialize_with = "extra_hosts",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub extra_hosts: Vec<String>,
    /// Sysctls
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub sysctls: BTreeMap<String, String>,
    /// Ulimits
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ulimits: BTreeMap<String, UlimitConfig>,
    /// Mounted tmpfs paths
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tmpfs: Vec<String>,
    /// Base service this one extends, resolved by the loader
    #[serde(default, skip_serializing)]
    pub extends: Option<ExtendsConfig>,
    /// Keys accepted but not converted (unsupported, deprecated and `x-*`)
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

/// Long port syntax
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePortConfig {
    /// Mode (`ingress`, `host`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Host IP to bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Target port in the container
    pub target: u32,
    /// Published port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<u32>,
    /// Protocol (`tcp`, `udp`, `sctp`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Long volume mount syntax
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceVolumeConfig {
    /// Mount type (`volume`, `bind`, `tmpfs`, `npipe`, `cluster`)
    #[serde(rename = "type")]
    pub volume_type: String,
    /// Source path or volume name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Target path in the container
    pub target: String,
    /// Read only
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    /// Consistency (macOS)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<String>,
    /// Bind options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<ServiceBindOptions>,
    /// Volume options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<ServiceVolumeOptions>,
    /// Tmpfs options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<ServiceTmpfsOptions>,
    /// Cluster volume options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ServiceClusterOptions>,
}

/// Bind mount options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBindOptions {
    /// Propagation mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<String>,
    /// Create the host path if missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_host_path: Option<bool>,
    /// SELinux relabeling (`z`, `Z`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux: Option<String>,
}

/// Volume options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVolumeOptions {
    /// Do not copy data from the container
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub nocopy: bool,
    /// Mount a path inside the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<String>,
}

/// Tmpfs options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTmpfsOptions {
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<ByteSize>,
    /// File mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Cluster volume mount options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClusterOptions {}

/// Service network attachment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    /// Aliases
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// IPv4 address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    /// IPv6 address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
}

/// Secret or config reference in a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFileRef {
    /// Source secret or config key
    pub source: String,
    /// Target file name in the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// GID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    /// Mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Deploy configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Deployment mode (replicated, global)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Number of replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u64>,
    /// Service labels (not container labels)
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    /// Update configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_config: Option<UpdateConfig>,
    /// Rollback configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_config: Option<UpdateConfig>,
    /// Resource limits and reservations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesConfig>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicyConfig>,
    /// Placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementConfig>,
    /// Endpoint mode (vip, dnsrr)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_mode: Option<String>,
}

/// Update/rollback configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failure_ratio: Option<f32>,
    /// Order (start-first, stop-first)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

/// Resources configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservations: Option<ResourceReservation>,
}

/// Resource limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// Decimal CPU count
    #[serde(
        default,
        deserialize_with = "optional_scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub cpus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<i64>,
}

/// Resource reservations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceReservation {
    /// Decimal CPU count
    #[serde(
        default,
        deserialize_with = "optional_scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub cpus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_resources: Vec<GenericResource>,
}

/// Generic resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discrete_resource_spec: Option<DiscreteGenericResource>,
}

/// Discrete generic resource (`kind` + count)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscreteGenericResource {
    pub kind: String,
    pub value: i64,
}

/// Restart policy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    /// Condition (none, on-failure, any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
}

/// Placement configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferences: Vec<PlacementPreference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas_per_node: Option<u64>,
}

/// Placement preference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPreference {
    /// Spread descriptor (`node.labels.zone`)
    pub spread: String,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command, `CMD-SHELL` form for plain strings
    #[serde(
        default,
        deserialize_with = "healthcheck_test",
        skip_serializing_if = "Option::is_none"
    )]
    pub test: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u64>,
    /// Disable the image healthcheck
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
}

/// Healthcheck test
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Credential spec (Windows)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSpecConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub options: BTreeMap<String, String>,
}

/// Ulimit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UlimitConfig {
    /// Single value (same for soft and hard)
    Single(i64),
    /// Separate soft and hard limits
    SoftHard { soft: i64, hard: i64 },
}

impl UlimitConfig {
    /// (soft, hard)
    pub fn limits(&self) -> (i64, i64) {
        match self {
            UlimitConfig::Single(v) => (*v, *v),
            UlimitConfig::SoftHard { soft, hard } => (*soft, *hard),
        }
    }
}

/// `extends` reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtendsConfig {
    /// Service in the same file
    Service(String),
    /// Service, optionally in another file
    Full {
        service: String,
        #[serde(default)]
        file: Option<String>,
    },
}

impl ExtendsConfig {
    pub fn service(&self) -> &str {
        match self {
            ExtendsConfig::Service(s) => s,
            ExtendsConfig::Full { service, .. } => service,
        }
    }

    pub fn file(&self) -> Option<&str> {
        match self {
            ExtendsConfig::Service(_) => None,
            ExtendsConfig::Full { file, .. } => file.as_deref(),
        }
    }
}

/// `include` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncludeConfig {
    /// Single path
    Path(String),
    /// Long syntax
    Full {
        #[serde(deserialize_with = "string_or_list")]
        path: Vec<String>,
        #[serde(default)]
        project_directory: Option<String>,
        #[serde(default, deserialize_with = "string_or_list")]
        env_file: Vec<String>,
    },
}

impl IncludeConfig {
    pub fn paths(&self) -> Vec<String> {
        match self {
            IncludeConfig::Path(p) => vec![p.clone()],
            IncludeConfig::Full { path, .. } => path.clone(),
        }
    }

    pub fn project_directory(&self) -> Option<&str> {
        match self {
            IncludeConfig::Path(_) => None,
            IncludeConfig::Full {
                project_directory, ..
            } => project_directory.as_deref(),
        }
    }

    pub fn env_files(&self) -> &[String] {
        match self {
            IncludeConfig::Path(_) => &[],
            IncludeConfig::Full { env_file, .. } => env_file,
        }
    }
}

/// External resource configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name (pre-3.4 syntax)
    Named { name: String },
}

impl ExternalConfig {
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }
}

/// Whether an optional `external` field marks the resource external
pub fn is_external(external: &Option<ExternalConfig>) -> bool {
    external.as_ref().map(ExternalConfig::is_external).unwrap_or(false)
}

/// Network configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Explicit name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub driver_opts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub attachable: bool,
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

/// IPAM configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<IpamPool>,
}

/// IPAM pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPool {
    pub subnet: String,
}

/// Volume configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Explicit name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub driver_opts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    /// Cluster volume specification
    #[serde(
        default,
        rename = "x-cluster-spec",
        skip_serializing_if = "Option::is_none"
    )]
    pub cluster_spec: Option<ClusterVolumeSpec>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

/// Cluster (CSI) volume specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterVolumeSpec {
    /// Volume group; services reference it as `group:NAME`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility_requirements: Option<TopologyRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<ClusterVolumeSecret>,
    /// active, pause, drain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessMode {
    /// single, multi
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// none, readonly, onewriter, all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_volume: Option<serde_yaml::Mapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_volume: Option<MountVolume>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_flags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRequirement {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requisite: Vec<Topology>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred: Vec<Topology>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub segments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_bytes: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<ByteSize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterVolumeSecret {
    pub key: String,
    pub secret: String,
}

/// Secret configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretConfig {
    /// Explicit name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// File path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    /// Secret store driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub driver_opts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_driver: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

/// Config object configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigObjConfig {
    /// Explicit name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// File path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,
    #[serde(
        default,
        deserialize_with = "labels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_driver: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

/// Byte quantity accepting plain numbers or unit strings (`512m`, `1.5GB`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub i64);

impl ByteSize {
    /// Parse `[0-9.]+` with an optional `b`, `k`, `m`, `g`, `t`, `p` suffix (binary units)
    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        let lower = trimmed.to_ascii_lowercase();
        let split = lower
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(lower.len());
        let (number, unit) = lower.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid size: {:?}", text))?;
        let multiplier: f64 = match unit.trim().trim_end_matches("ib").trim_end_matches('b') {
            "" => 1.0,
            "k" => 1024.0,
            "m" => 1024.0 * 1024.0,
            "g" => 1024.0 * 1024.0 * 1024.0,
            "t" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            "p" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
            _ => return Err(format!("invalid size: {:?}", text)),
        };
        Ok(ByteSize((value * multiplier) as i64))
    }
}

impl Serialize for ByteSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match scalar_to_string(serde_yaml::Value::deserialize(deserializer)?) {
            Some(text) => ByteSize::parse(&text).map_err(de::Error::custom),
            None => Err(de::Error::custom("invalid size: expected a number or string")),
        }
    }
}

/// Render a YAML scalar as a string; `None` for null and collections
pub fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

fn string_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<StringOrList>::deserialize(d)? {
        None => Vec::new(),
        Some(StringOrList::One(s)) => vec![s],
        Some(StringOrList::Many(v)) => v,
    })
}

fn command<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<String>>, D::Error> {
    match Option::<StringOrList>::deserialize(d)? {
        None => Ok(None),
        Some(StringOrList::One(s)) => shell_words::split(&s)
            .map(Some)
            .map_err(|e| de::Error::custom(format!("invalid command {:?}: {}", s, e))),
        Some(StringOrList::Many(v)) => Ok(Some(v)),
    }
}

fn healthcheck_test<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<String>>, D::Error> {
    Ok(match Option::<HealthcheckTest>::deserialize(d)? {
        None => None,
        Some(HealthcheckTest::Command(s)) => Some(vec!["CMD-SHELL".to_string(), s]),
        Some(HealthcheckTest::Array(v)) => Some(v),
    })
}

fn optional_scalar_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(scalar_to_string(serde_yaml::Value::deserialize(d)?))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrMapping {
    List(Vec<String>),
    Mapping(BTreeMap<String, serde_yaml::Value>),
}

/// `["A=1", "B"]` or `{A: 1, B: null}`; bare keys map to `None`
fn mapping_with_equals<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<BTreeMap<String, Option<String>>, D::Error> {
    Ok(match Option::<ListOrMapping>::deserialize(d)? {
        None => BTreeMap::new(),
        Some(ListOrMapping::List(items)) => items
            .into_iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (item, None),
            })
            .collect(),
        Some(ListOrMapping::Mapping(map)) => map
            .into_iter()
            .map(|(k, v)| (k, scalar_to_string(v)))
            .collect(),
    })
}

/// Like `mapping_with_equals` but bare keys map to an empty string
fn labels<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, String>, D::Error> {
    Ok(mapping_with_equals(d)?
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or_default()))
        .collect())
}

fn extra_hosts<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<ListOrMapping>::deserialize(d)? {
        None => Vec::new(),
        Some(ListOrMapping::List(items)) => items,
        Some(ListOrMapping::Mapping(map)) => map
            .into_iter()
            .map(|(host, ip)| format!("{}:{}", host, scalar_to_string(ip).unwrap_or_default()))
            .collect(),
    })
}

/// Port configuration
#[derive(Deserialize)]
#[serde(untagged)]
enum PortConfig {
    /// Bare container port
    Number(u32),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(LongPortConfig),
}

/// Long port syntax as written, before the published port is resolved
#[derive(Deserialize)]
struct LongPortConfig {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    host_ip: Option<String>,
    target: u32,
    #[serde(default)]
    published: Option<PublishedPort>,
    #[serde(default)]
    protocol: Option<String>,
}

/// Published port given as a number or as text (`"8080"`, `"8000-8010"`)
#[derive(Deserialize)]
#[serde(untagged)]
enum PublishedPort {
    Number(u32),
    Text(String),
}

impl LongPortConfig {
    fn resolve(self) -> Result<ServicePortConfig, String> {
        let published = match self.published {
            None => None,
            Some(PublishedPort::Number(n)) => Some(n),
            Some(PublishedPort::Text(text)) if text.trim().is_empty() => None,
            Some(PublishedPort::Text(text)) => {
                match syntax::parse_port_range(text.trim()) {
                    Some((start, end)) if start == end => Some(start),
                    // Swarm publishes exactly one port per target
                    Some(_) => {
                        return Err(format!(
                            "published port range {} for target {} is not supported; \
                             publish a single port or use the short syntax with matching ranges",
                            text, self.target
                        ))
                    }
                    None => return Err(format!("invalid published port: {}", text)),
                }
            }
        };
        Ok(ServicePortConfig {
            mode: self.mode,
            host_ip: self.host_ip,
            target: self.target,
            published,
            protocol: self.protocol,
        })
    }
}

fn ports<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ServicePortConfig>, D::Error> {
    let mut out = Vec::new();
    for entry in Option::<Vec<PortConfig>>::deserialize(d)?.unwrap_or_default() {
        match entry {
            PortConfig::Number(n) => {
                out.extend(syntax::parse_port_spec(&n.to_string()).map_err(de::Error::custom)?)
            }
            PortConfig::Short(s) => {
                out.extend(syntax::parse_port_spec(&s).map_err(de::Error::custom)?)
            }
            PortConfig::Long(p) => out.push(p.resolve().map_err(de::Error::custom)?),
        }
    }
    Ok(out)
}

/// Volume mount configuration
#[derive(Deserialize)]
#[serde(untagged)]
enum VolumeMount {
    /// Short syntax: "host:container:mode"
    Short(String),
    /// Long syntax
    Long(ServiceVolumeConfig),
}

fn volumes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ServiceVolumeConfig>, D::Error> {
    Option::<Vec<VolumeMount>>::deserialize(d)?
        .unwrap_or_default()
        .into_iter()
        .map(|entry| match entry {
            VolumeMount::Short(s) => syntax::parse_volume_spec(&s).map_err(de::Error::custom),
            VolumeMount::Long(v) => Ok(v),
        })
        .collect()
}

/// Networks configuration
#[derive(Deserialize)]
#[serde(untagged)]
enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to config
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

fn service_networks<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<BTreeMap<String, Option<ServiceNetworkConfig>>, D::Error> {
    Ok(match Option::<NetworksConfig>::deserialize(d)? {
        None => BTreeMap::new(),
        Some(NetworksConfig::Array(names)) => names.into_iter().map(|n| (n, None)).collect(),
        Some(NetworksConfig::Map(map)) => map,
    })
}

/// Secret or config reference in a service
#[derive(Deserialize)]
#[serde(untagged)]
enum FileRef {
    /// Short syntax
    Short(String),
    /// Long syntax
    Long(ServiceFileRef),
}

fn file_refs<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ServiceFileRef>, D::Error> {
    Ok(Option::<Vec<FileRef>>::deserialize(d)?
        .unwrap_or_default()
        .into_iter()
        .map(|entry| match entry {
            FileRef::Short(source) => ServiceFileRef {
                source,
                ..Default::default()
            },
            FileRef::Long(r) => r,
        })
        .collect())
}

/// Top-level resource maps allow `name:` with an empty body
fn nullable_map<'de, D, T>(d: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<BTreeMap<String, Option<T>>>::deserialize(d)?
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or_default()))
        .collect())
}
