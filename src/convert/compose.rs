//! Stack-level resources: networks, secrets and configs

use super::{add_stack_label, Namespace, DEFAULT_NETWORK};
use crate::compose::config::{is_external, ConfigObjConfig, NetworkConfig, SecretConfig};
use crate::compose::ComposeConfig;
use crate::error::{Result, StackError};
use crate::swarm::network::{Ipam, IpamPool, NetworkCreate};
use crate::swarm::service::Driver;
use crate::swarm::{ConfigSpec, SecretSpec};
use std::collections::{BTreeMap, BTreeSet};

/// Local names of every network a service attaches to
pub fn services_networks(config: &ComposeConfig) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for service in config.services.values() {
        if service.networks.is_empty() {
            out.insert(DEFAULT_NETWORK.to_string());
        }
        out.extend(service.networks.keys().cloned());
    }
    out
}

/// Create requests for the networks services use, keyed by server name,
/// plus the names of external networks that must already exist
pub fn networks(
    namespace: &Namespace,
    declared: &BTreeMap<String, NetworkConfig>,
    used: &BTreeSet<String>,
) -> (BTreeMap<String, NetworkCreate>, Vec<String>) {
    let mut result = BTreeMap::new();
    let mut externals = Vec::new();

    for local in used {
        let network = declared.get(local).cloned().unwrap_or_default();
        let name = namespace.resolve(local, network.name.as_deref());
        if is_external(&network.external) {
            externals.push(name);
            continue;
        }

        let ipam = network.ipam.as_ref().and_then(|ipam| {
            if ipam.driver.is_none() && ipam.config.is_empty() {
                return None;
            }
            Some(Ipam {
                driver: ipam.driver.clone(),
                config: ipam
                    .config
                    .iter()
                    .map(|pool| IpamPool {
                        subnet: pool.subnet.clone(),
                    })
                    .collect(),
            })
        });

        result.insert(
            name.clone(),
            NetworkCreate {
                name,
                driver: network.driver.clone(),
                scope: None,
                internal: network.internal,
                attachable: network.attachable,
                options: network.driver_opts.clone(),
                ipam,
                labels: add_stack_label(namespace, &network.labels),
            },
        );
    }

    (result, externals)
}

fn read_object_file(kind: &str, local: &str, file: Option<&str>) -> Result<Vec<u8>> {
    let path = file.ok_or_else(|| {
        StackError::Validation(format!("{} {}: file or external must be set", kind, local))
    })?;
    std::fs::read(path).map_err(|e| {
        StackError::Validation(format!("{} {}: failed to read {}: {}", kind, local, path, e))
    })
}

/// Specs for the secrets the stack creates; external secrets are skipped
pub fn secrets(
    namespace: &Namespace,
    declared: &BTreeMap<String, SecretConfig>,
) -> Result<Vec<SecretSpec>> {
    let mut result = Vec::new();
    for (local, secret) in declared {
        if is_external(&secret.external) {
            continue;
        }

        let driver = secret.driver.as_ref().map(|name| Driver {
            name: name.clone(),
            options: secret.driver_opts.clone(),
        });
        let data = match driver {
            Some(_) => Vec::new(),
            None => read_object_file("secret", local, secret.file.as_deref())?,
        };

        result.push(SecretSpec {
            name: namespace.resolve(local, secret.name.as_deref()),
            labels: add_stack_label(namespace, &secret.labels),
            data,
            driver,
            templating: secret.template_driver.as_ref().map(|name| Driver {
                name: name.clone(),
                options: BTreeMap::new(),
            }),
        });
    }
    Ok(result)
}

/// Specs for the configs the stack creates; external configs are skipped
pub fn configs(
    namespace: &Namespace,
    declared: &BTreeMap<String, ConfigObjConfig>,
) -> Result<Vec<ConfigSpec>> {
    let mut result = Vec::new();
    for (local, cfg) in declared {
        if is_external(&cfg.external) {
            continue;
        }
        result.push(ConfigSpec {
            name: namespace.resolve(local, cfg.name.as_deref()),
            labels: add_stack_label(namespace, &cfg.labels),
            data: read_object_file("config", local, cfg.file.as_deref())?,
            templating: cfg.template_driver.as_ref().map(|name| Driver {
                name: name.clone(),
                options: BTreeMap::new(),
            }),
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::LABEL_NAMESPACE;
    use tempfile::TempDir;

    fn compose(yaml: &str) -> ComposeConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_networks_conversion() {
        let config = compose(
            r#"
services:
  web: {image: nginx, networks: [front, outside]}
  db: {image: postgres}
networks:
  front:
    driver: overlay
    driver_opts: {encrypted: 'true'}
    attachable: true
    labels: {team: a}
    ipam:
      driver: default
      config: [{subnet: 10.0.0.0/24}]
  outside:
    external: true
    name: shared
"#,
        );
        let ns = Namespace::new("s");
        let used = services_networks(&config);
        assert!(used.contains("default"));

        let (created, externals) = networks(&ns, &config.networks, &used);
        assert_eq!(externals, vec!["shared".to_string()]);
        let front = &created["s_front"];
        assert_eq!(front.driver.as_deref(), Some("overlay"));
        assert!(front.attachable);
        assert_eq!(front.options["encrypted"], "true");
        assert_eq!(front.labels[LABEL_NAMESPACE], "s");
        assert_eq!(front.labels["team"], "a");
        assert_eq!(front.ipam.as_ref().unwrap().config[0].subnet, "10.0.0.0/24");

        let default = &created["s_default"];
        assert_eq!(default.driver, None);
        assert!(default.ipam.is_none());
    }

    #[test]
    fn test_secrets_and_configs_read_files() {
        let dir = TempDir::new().unwrap();
        let secret_file = dir.path().join("pw.txt");
        std::fs::write(&secret_file, "hunter2").unwrap();
        let config = compose(&format!(
            r#"
secrets:
  pw: {{file: {f}, labels: {{k: v}}}}
  ext: {{external: true}}
  named: {{file: {f}, name: global_pw, template_driver: golang}}
configs:
  app: {{file: {f}}}
"#,
            f = secret_file.display()
        ));
        let ns = Namespace::new("s");

        let secrets = secrets(&ns, &config.secrets).unwrap();
        assert_eq!(secrets.len(), 2);
        let named = secrets.iter().find(|s| s.name == "global_pw").unwrap();
        assert_eq!(named.templating.as_ref().unwrap().name, "golang");
        let pw = secrets.iter().find(|s| s.name == "s_pw").unwrap();
        assert_eq!(pw.data, b"hunter2");
        assert_eq!(pw.labels[LABEL_NAMESPACE], "s");

        let configs = configs(&ns, &config.configs).unwrap();
        assert_eq!(configs[0].name, "s_app");
    }

    #[test]
    fn test_secret_driver_skips_file() {
        let config = compose("secrets:\n  vault: {driver: vault, driver_opts: {path: x}}\n");
        let specs = secrets(&Namespace::new("s"), &config.secrets).unwrap();
        assert!(specs[0].data.is_empty());
        assert_eq!(specs[0].driver.as_ref().unwrap().options["path"], "x");
    }

    #[test]
    fn test_missing_secret_file() {
        let config = compose("secrets:\n  pw: {file: /nonexistent/pw}\n");
        assert!(secrets(&Namespace::new("s"), &config.secrets).is_err());
    }
}
