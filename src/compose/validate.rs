//! Compose schema checks
//!
//! Runs on the raw YAML tree before typing (versions, unknown keys and
//! forbidden/unsupported/deprecated properties) and on the normalized model
//! afterwards (references and name collisions).

use super::config::{is_external, ComposeConfig};
use super::syntax::mount_types;
use crate::error::{ForbiddenProperty, Result, StackError};
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Version assumed when a document does not declare one
pub const LATEST_VERSION: &str = "3.12";

const TOP_LEVEL_KEYS: &[&str] = &[
    "version", "name", "services", "networks", "volumes", "secrets", "configs", "include",
];

const SERVICE_KEYS: &[&str] = &[
    "build", "cap_add", "cap_drop", "cgroup_parent", "command", "configs", "container_name",
    "credential_spec", "depends_on", "deploy", "devices", "dns", "dns_search", "domainname",
    "entrypoint", "env_file", "environment", "expose", "extends", "external_links",
    "extra_hosts", "healthcheck", "hostname", "image", "init", "ipc", "isolation", "labels",
    "links", "logging", "mac_address", "name", "network_mode", "networks", "pid", "ports",
    "privileged", "read_only", "restart", "secrets", "security_opt", "shm_size", "stdin_open",
    "stop_grace_period", "stop_signal", "sysctls", "tmpfs", "tty", "ulimits", "user",
    "userns_mode", "volumes", "working_dir",
];

const NETWORK_KEYS: &[&str] = &[
    "name", "driver", "driver_opts", "ipam", "external", "internal", "attachable", "labels",
];

const VOLUME_KEYS: &[&str] = &[
    "name", "driver", "driver_opts", "external", "labels", "x-cluster-spec",
];

const SECRET_KEYS: &[&str] = &[
    "name", "file", "external", "labels", "driver", "driver_opts", "template_driver",
];

const CONFIG_KEYS: &[&str] = &["name", "file", "external", "labels", "template_driver"];

const FORBIDDEN: &[(&str, &str)] = &[
    (
        "volume_driver",
        "Instead of setting the volume driver on the service, define a volume using the top-level `volumes` option and specify the driver there.",
    ),
    (
        "volumes_from",
        "To share a volume between services, define it using the top-level `volumes` option and reference it from each service that shares it using the service-level `volumes` option.",
    ),
    ("cpu_quota", "Set resource limits using deploy.resources"),
    ("cpu_shares", "Set resource limits using deploy.resources"),
    ("cpuset", "Set resource limits using deploy.resources"),
    ("mem_limit", "Set resource limits using deploy.resources"),
    ("memswap_limit", "Set resource limits using deploy.resources"),
];

const UNSUPPORTED: &[&str] = &[
    "build", "cap_add", "cap_drop", "cgroup_parent", "devices", "domainname", "external_links",
    "ipc", "links", "mac_address", "network_mode", "pid", "privileged", "security_opt",
    "shm_size", "userns_mode",
];

const DEPRECATED: &[(&str, &str)] = &[
    ("container_name", "Setting the container name is not supported."),
    ("expose", "Exposing ports is unnecessary - services on the same network can access each other's containers on any port."),
];

/// Schema family of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaVersion {
    /// Version 1: services at the top level
    Legacy,
    /// `2.x` or `3.x`
    Versioned(String),
}

/// Non-fatal findings collected while validating
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyReport {
    /// Unsupported keys, by service
    pub unsupported: BTreeMap<String, Vec<String>>,
    /// Deprecated keys with their notice, by service
    pub deprecated: BTreeMap<String, Vec<(String, String)>>,
}

impl PropertyReport {
    pub fn is_empty(&self) -> bool {
        self.unsupported.is_empty() && self.deprecated.is_empty()
    }

    pub fn extend(&mut self, other: PropertyReport) {
        for (service, keys) in other.unsupported {
            let entry = self.unsupported.entry(service).or_default();
            for key in keys {
                if !entry.contains(&key) {
                    entry.push(key);
                }
            }
        }
        for (service, keys) in other.deprecated {
            let entry = self.deprecated.entry(service).or_default();
            for key in keys {
                if !entry.contains(&key) {
                    entry.push(key);
                }
            }
        }
    }

    /// Lines shown to the user on stderr
    pub fn messages(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut keys: Vec<&String> = self.unsupported.values().flatten().collect();
        keys.sort();
        keys.dedup();
        if !keys.is_empty() {
            out.push(format!(
                "Ignoring unsupported options: {}",
                keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
        let mut notices: Vec<&(String, String)> = self.deprecated.values().flatten().collect();
        notices.sort();
        notices.dedup();
        for (key, notice) in notices {
            out.push(format!("Ignoring deprecated option \"{}\": {}", key, notice));
        }
        out
    }
}

fn version_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(1|2(\.\d+)?|3(\.\d+)?)$").expect("valid regex"))
}

/// Determine the schema version of a raw document
pub fn schema_version(document: &Mapping) -> Result<SchemaVersion> {
    let Some(version) = document.get("version") else {
        let legacy = !document.is_empty()
            && !document.contains_key("services")
            && document.keys().all(|k| {
                k.as_str()
                    .map(|k| !TOP_LEVEL_KEYS.contains(&k) && !k.starts_with("x-"))
                    .unwrap_or(false)
            });
        return Ok(if legacy {
            SchemaVersion::Legacy
        } else {
            SchemaVersion::Versioned(LATEST_VERSION.to_string())
        });
    };

    let text = match version {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => {
            return Err(StackError::Validation(
                "version must be a string".to_string(),
            ))
        }
    };
    if !version_pattern().is_match(&text) {
        return Err(StackError::Validation(format!(
            "unsupported Compose file version: {}",
            text
        )));
    }
    if text == "1" {
        return Ok(SchemaVersion::Legacy);
    }
    Ok(SchemaVersion::Versioned(text))
}

/// Rewrite a version 1 document into the `services:` layout
pub fn upgrade_legacy(document: Mapping) -> Mapping {
    let mut services = Mapping::new();
    for (k, v) in document {
        if k.as_str() == Some("version") {
            continue;
        }
        services.insert(k, v);
    }
    let mut out = Mapping::new();
    out.insert(Value::from("services"), Value::Mapping(services));
    out
}

/// Check the structure of a raw document and collect property findings
pub fn validate_document(document: &Mapping, filename: &str) -> Result<PropertyReport> {
    for key in document.keys() {
        let key = key_text(key)?;
        if !TOP_LEVEL_KEYS.contains(&key) && !key.starts_with("x-") {
            return Err(StackError::Validation(format!(
                "{}: Additional property {} is not allowed",
                filename, key
            )));
        }
    }

    for (section, allowed) in [
        ("networks", NETWORK_KEYS),
        ("volumes", VOLUME_KEYS),
        ("secrets", SECRET_KEYS),
        ("configs", CONFIG_KEYS),
    ] {
        check_resource_section(document, section, allowed, filename)?;
    }

    let mut report = PropertyReport::default();
    let mut forbidden = Vec::new();

    let services = match document.get("services") {
        None | Some(Value::Null) => return Ok(report),
        Some(Value::Mapping(m)) => m,
        Some(_) => {
            return Err(StackError::Validation(format!(
                "{}: services must be a mapping",
                filename
            )))
        }
    };

    for (name, service) in services {
        let name = key_text(name)?;
        let service = match service {
            Value::Mapping(m) => m,
            _ => {
                return Err(StackError::Validation(format!(
                    "{}: services.{} must be a mapping",
                    filename, name
                )))
            }
        };

        for key in service.keys() {
            let key = key_text(key)?;
            if let Some((_, hint)) = FORBIDDEN.iter().find(|(k, _)| *k == key) {
                forbidden.push(ForbiddenProperty {
                    path: format!("services.{}.{}", name, key),
                    hint: hint.to_string(),
                });
                continue;
            }
            if UNSUPPORTED.contains(&key) {
                report
                    .unsupported
                    .entry(name.to_string())
                    .or_default()
                    .push(key.to_string());
                continue;
            }
            if let Some((_, notice)) = DEPRECATED.iter().find(|(k, _)| *k == key) {
                report
                    .deprecated
                    .entry(name.to_string())
                    .or_default()
                    .push((key.to_string(), notice.to_string()));
                continue;
            }
            if !SERVICE_KEYS.contains(&key) && !key.starts_with("x-") {
                return Err(StackError::Validation(format!(
                    "{}: services.{} Additional property {} is not allowed",
                    filename, name, key
                )));
            }
        }
    }

    if !forbidden.is_empty() {
        return Err(StackError::ForbiddenProperties(forbidden));
    }
    Ok(report)
}

fn check_resource_section(
    document: &Mapping,
    section: &str,
    allowed: &[&str],
    filename: &str,
) -> Result<()> {
    let entries = match document.get(section) {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Mapping(m)) => m,
        Some(_) => {
            return Err(StackError::Validation(format!(
                "{}: {} must be a mapping",
                filename, section
            )))
        }
    };
    for (name, body) in entries {
        let name = key_text(name)?;
        let body = match body {
            Value::Null => continue,
            Value::Mapping(m) => m,
            _ => {
                return Err(StackError::Validation(format!(
                    "{}: {}.{} must be a mapping",
                    filename, section, name
                )))
            }
        };
        for key in body.keys() {
            let key = key_text(key)?;
            if !allowed.contains(&key) && !key.starts_with("x-") {
                return Err(StackError::Validation(format!(
                    "{}: {}.{} Additional property {} is not allowed",
                    filename, section, name, key
                )));
            }
        }
    }
    Ok(())
}

fn key_text(key: &Value) -> Result<&str> {
    key.as_str().ok_or_else(|| {
        StackError::Validation(format!("non-string key in Compose file: {:?}", key))
    })
}

/// Every service reference must resolve to a declared resource
pub fn validate_references(config: &ComposeConfig) -> Result<()> {
    for (name, service) in &config.services {
        for network in service.networks.keys() {
            if network != "default" && !config.networks.contains_key(network) {
                return Err(StackError::Validation(format!(
                    "service {} refers to undefined network {}: invalid compose project",
                    name, network
                )));
            }
        }
        for secret in &service.secrets {
            if !config.secrets.contains_key(&secret.source) {
                return Err(StackError::Validation(format!(
                    "service {} refers to undefined secret {}: invalid compose project",
                    name, secret.source
                )));
            }
        }
        for cfg in &service.configs {
            if !config.configs.contains_key(&cfg.source) {
                return Err(StackError::Validation(format!(
                    "service {} refers to undefined config {}: invalid compose project",
                    name, cfg.source
                )));
            }
        }
        for volume in &service.volumes {
            let Some(source) = volume.source.as_deref().filter(|s| !s.is_empty()) else {
                continue;
            };
            let named = volume.volume_type == mount_types::VOLUME
                || (volume.volume_type == mount_types::CLUSTER && !source.starts_with("group:"));
            if named && !config.volumes.contains_key(source) {
                return Err(StackError::Validation(format!(
                    "service {} refers to undefined volume {}: invalid compose project",
                    name, source
                )));
            }
        }
        if let Some(deploy) = &service.deploy {
            if deploy.mode.as_deref() == Some("global") && deploy.replicas.is_some() {
                return Err(StackError::Validation(format!(
                    "service {}: replicas can only be used with replicated mode",
                    name
                )));
            }
        }
    }

    for (kind, externals) in [
        (
            "network",
            config
                .networks
                .iter()
                .map(|(k, v)| (k, is_external(&v.external), v.driver.is_some() || v.ipam.is_some()))
                .collect::<Vec<_>>(),
        ),
        (
            "volume",
            config
                .volumes
                .iter()
                .map(|(k, v)| (k, is_external(&v.external), v.driver.is_some()))
                .collect::<Vec<_>>(),
        ),
    ] {
        for (name, external, configured) in externals {
            if external && configured {
                return Err(StackError::Validation(format!(
                    "{} {} declared as external, but has driver or ipam configuration",
                    kind, name
                )));
            }
        }
    }

    Ok(())
}

/// Server-side service names must be unique once the stack prefix is applied
pub fn check_service_names(config: &ComposeConfig, namespace: &str) -> Result<()> {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for (local, service) in &config.services {
        let server = match service.name.as_deref().filter(|n| !n.is_empty()) {
            Some(explicit) => explicit.to_string(),
            None => format!("{}_{}", namespace, local),
        };
        if let Some(other) = seen.insert(server.clone(), local) {
            return Err(StackError::Validation(format!(
                "services {} and {} both resolve to the name {}",
                other, local, server
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_versions() {
        assert_eq!(
            schema_version(&mapping("version: '3.8'\nservices: {}")).unwrap(),
            SchemaVersion::Versioned("3.8".to_string())
        );
        assert_eq!(
            schema_version(&mapping("version: 2\nservices: {}")).unwrap(),
            SchemaVersion::Versioned("2".to_string())
        );
        assert_eq!(
            schema_version(&mapping("services: {}")).unwrap(),
            SchemaVersion::Versioned(LATEST_VERSION.to_string())
        );
        assert!(schema_version(&mapping("version: '4.0'\nservices: {}")).is_err());
    }

    #[test]
    fn test_legacy_detection_and_upgrade() {
        let doc = mapping("web:\n  image: nginx\n");
        assert_eq!(schema_version(&doc).unwrap(), SchemaVersion::Legacy);
        let upgraded = upgrade_legacy(doc);
        assert!(upgraded.get("services").unwrap().get("web").is_some());
    }

    #[test]
    fn test_unknown_top_level_key() {
        let err = validate_document(&mapping("services: {}\nbogus: 1\n"), "a.yml").unwrap_err();
        assert!(err.to_string().contains("bogus"));
        assert!(validate_document(&mapping("services: {}\nx-meta: 1\n"), "a.yml").is_ok());
    }

    #[test]
    fn test_forbidden_properties_are_listed() {
        let err = validate_document(
            &mapping("services:\n  web:\n    image: x\n    cpu_shares: 2\n    volumes_from: [db]\n"),
            "a.yml",
        )
        .unwrap_err();
        match err {
            StackError::ForbiddenProperties(props) => {
                let paths: Vec<&str> = props.iter().map(|p| p.path.as_str()).collect();
                assert_eq!(paths, vec!["services.web.cpu_shares", "services.web.volumes_from"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_and_deprecated_are_reported() {
        let report = validate_document(
            &mapping(
                "services:\n  web:\n    image: x\n    build: .\n    links: [db]\n    container_name: w\n",
            ),
            "a.yml",
        )
        .unwrap();
        assert_eq!(report.unsupported["web"], vec!["build", "links"]);
        assert_eq!(report.deprecated["web"][0].0, "container_name");
        let messages = report.messages();
        assert_eq!(messages[0], "Ignoring unsupported options: build, links");
        assert!(messages[1].contains("container_name"));
    }

    #[test]
    fn test_unknown_service_key() {
        let err = validate_document(&mapping("services:\n  web:\n    imagee: x\n"), "a.yml")
            .unwrap_err();
        assert!(err.to_string().contains("imagee"));
    }

    #[test]
    fn test_undefined_references() {
        let config: ComposeConfig =
            serde_yaml::from_str("services:\n  web:\n    image: x\n    networks: [back]\n")
                .unwrap();
        assert!(validate_references(&config).is_err());

        let config: ComposeConfig =
            serde_yaml::from_str("services:\n  web:\n    image: x\n    volumes: ['data:/d']\n")
                .unwrap();
        assert!(validate_references(&config).is_err());

        let config: ComposeConfig = serde_yaml::from_str(
            "services:\n  web:\n    image: x\n    volumes: ['data:/d']\nvolumes:\n  data:\n",
        )
        .unwrap();
        assert!(validate_references(&config).is_ok());
    }

    #[test]
    fn test_global_with_replicas_rejected() {
        let config: ComposeConfig = serde_yaml::from_str(
            "services:\n  web:\n    image: x\n    deploy:\n      mode: global\n      replicas: 2\n",
        )
        .unwrap();
        assert!(validate_references(&config).is_err());
    }

    #[test]
    fn test_explicit_name_collision() {
        let config: ComposeConfig = serde_yaml::from_str(
            "services:\n  web:\n    image: x\n  api:\n    image: y\n    name: stack_web\n",
        )
        .unwrap();
        assert!(check_service_names(&config, "stack").is_err());
        assert!(check_service_names(&config, "other").is_ok());
    }
}
