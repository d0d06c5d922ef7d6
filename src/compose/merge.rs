//! Semantic merging of Compose documents
//!
//! Scalars from the overlay win, keyed maps merge by key and lists merge by
//! the identity of their entries. List outputs are sorted by identity so
//! repeated merges are idempotent.

use super::config::{
    ComposeConfig, ConfigObjConfig, DeployConfig, HealthcheckConfig, LoggingConfig,
    NetworkConfig, PlacementConfig, ResourceLimit, ResourceReservation, ResourcesConfig,
    RestartPolicyConfig, SecretConfig, ServiceConfig, ServiceFileRef, ServicePortConfig,
    ServiceVolumeConfig, UpdateConfig, VolumeConfig,
};
use std::collections::BTreeMap;

/// Merge an overlay into `self`
pub trait Merge {
    fn merge(&mut self, overlay: Self);
}

fn merge_option<T>(base: &mut Option<T>, overlay: Option<T>) {
    if overlay.is_some() {
        *base = overlay;
    }
}

fn merge_nested<T: Merge>(base: &mut Option<T>, overlay: Option<T>) {
    match (base.as_mut(), overlay) {
        (Some(b), Some(o)) => b.merge(o),
        (None, Some(o)) => *base = Some(o),
        (_, None) => {}
    }
}

fn replace_if_set<T>(base: &mut Vec<T>, overlay: Vec<T>) {
    if !overlay.is_empty() {
        *base = overlay;
    }
}

/// Identity of a port entry: the published port and protocol. Unpublished
/// entries are keyed by target and sort after published ones on the same number.
pub fn port_identity(port: &ServicePortConfig) -> (u32, bool, String) {
    (
        port.published.unwrap_or(port.target),
        port.published.is_none(),
        port.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
    )
}

fn merge_by_identity<T, K, F>(base: &mut Vec<T>, overlay: Vec<T>, key: F)
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut entries: BTreeMap<K, T> = BTreeMap::new();
    for item in std::mem::take(base).into_iter().chain(overlay) {
        entries.insert(key(&item), item);
    }
    *base = entries.into_values().collect();
}

/// Sort and deduplicate identity-keyed lists
pub fn canonicalize_service(service: &mut ServiceConfig) {
    merge_by_identity(&mut service.ports, Vec::new(), port_identity);
    merge_by_identity(&mut service.secrets, Vec::new(), |s: &ServiceFileRef| {
        s.source.clone()
    });
    merge_by_identity(&mut service.configs, Vec::new(), |s: &ServiceFileRef| {
        s.source.clone()
    });
    merge_by_identity(&mut service.volumes, Vec::new(), |v: &ServiceVolumeConfig| {
        v.target.clone()
    });
}

impl Merge for ServiceConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.name, o.name);
        merge_option(&mut self.image, o.image);
        merge_option(&mut self.command, o.command);
        merge_option(&mut self.entrypoint, o.entrypoint);
        self.environment.extend(o.environment);
        replace_if_set(&mut self.env_file, o.env_file);
        self.labels.extend(o.labels);
        merge_by_identity(&mut self.ports, o.ports, port_identity);
        merge_by_identity(&mut self.volumes, o.volumes, |v: &ServiceVolumeConfig| {
            v.target.clone()
        });
        for (name, attachment) in o.networks {
            match attachment {
                Some(a) => {
                    self.networks.insert(name, Some(a));
                }
                None => {
                    self.networks.entry(name).or_insert(None);
                }
            }
        }
        merge_by_identity(&mut self.secrets, o.secrets, |s: &ServiceFileRef| {
            s.source.clone()
        });
        merge_by_identity(&mut self.configs, o.configs, |s: &ServiceFileRef| {
            s.source.clone()
        });
        merge_nested(&mut self.healthcheck, o.healthcheck);
        merge_nested(&mut self.deploy, o.deploy);
        merge_option(&mut self.restart, o.restart);
        merge_option(&mut self.stop_grace_period, o.stop_grace_period);
        merge_option(&mut self.stop_signal, o.stop_signal);
        merge_option(&mut self.user, o.user);
        merge_option(&mut self.working_dir, o.working_dir);
        merge_option(&mut self.hostname, o.hostname);
        merge_option(&mut self.read_only, o.read_only);
        merge_option(&mut self.tty, o.tty);
        merge_option(&mut self.stdin_open, o.stdin_open);
        merge_option(&mut self.init, o.init);
        merge_option(&mut self.isolation, o.isolation);
        merge_option(&mut self.credential_spec, o.credential_spec);
        merge_nested(&mut self.logging, o.logging);
        replace_if_set(&mut self.dns, o.dns);
        replace_if_set(&mut self.dns_search, o.dns_search);
        replace_if_set(&mut self.extra_hosts, o.extra_hosts);
        self.sysctls.extend(o.sysctls);
        self.ulimits.extend(o.ulimits);
        replace_if_set(&mut self.tmpfs, o.tmpfs);
        merge_option(&mut self.extends, o.extends);
        self.extras.extend(o.extras);
    }
}

impl Merge for LoggingConfig {
    fn merge(&mut self, o: Self) {
        let same_driver = o.driver.is_none() || o.driver == self.driver;
        if same_driver {
            self.options.extend(o.options);
        } else {
            *self = o;
        }
    }
}

impl Merge for HealthcheckConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.test, o.test);
        merge_option(&mut self.interval, o.interval);
        merge_option(&mut self.timeout, o.timeout);
        merge_option(&mut self.start_period, o.start_period);
        merge_option(&mut self.retries, o.retries);
        self.disable = self.disable || o.disable;
    }
}

impl Merge for DeployConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.mode, o.mode);
        merge_option(&mut self.replicas, o.replicas);
        self.labels.extend(o.labels);
        merge_nested(&mut self.update_config, o.update_config);
        merge_nested(&mut self.rollback_config, o.rollback_config);
        merge_nested(&mut self.resources, o.resources);
        merge_nested(&mut self.restart_policy, o.restart_policy);
        merge_nested(&mut self.placement, o.placement);
        merge_option(&mut self.endpoint_mode, o.endpoint_mode);
    }
}

impl Merge for UpdateConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.parallelism, o.parallelism);
        merge_option(&mut self.delay, o.delay);
        merge_option(&mut self.failure_action, o.failure_action);
        merge_option(&mut self.monitor, o.monitor);
        merge_option(&mut self.max_failure_ratio, o.max_failure_ratio);
        merge_option(&mut self.order, o.order);
    }
}

impl Merge for RestartPolicyConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.condition, o.condition);
        merge_option(&mut self.delay, o.delay);
        merge_option(&mut self.max_attempts, o.max_attempts);
        merge_option(&mut self.window, o.window);
    }
}

impl Merge for PlacementConfig {
    fn merge(&mut self, o: Self) {
        replace_if_set(&mut self.constraints, o.constraints);
        replace_if_set(&mut self.preferences, o.preferences);
        merge_option(&mut self.max_replicas_per_node, o.max_replicas_per_node);
    }
}

impl Merge for ResourcesConfig {
    fn merge(&mut self, o: Self) {
        merge_nested(&mut self.limits, o.limits);
        merge_nested(&mut self.reservations, o.reservations);
    }
}

impl Merge for ResourceLimit {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.cpus, o.cpus);
        merge_option(&mut self.memory, o.memory);
        merge_option(&mut self.pids, o.pids);
    }
}

impl Merge for ResourceReservation {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.cpus, o.cpus);
        merge_option(&mut self.memory, o.memory);
        replace_if_set(&mut self.generic_resources, o.generic_resources);
    }
}

fn merge_entries<T: Merge>(base: &mut BTreeMap<String, T>, overlay: BTreeMap<String, T>) {
    for (name, entry) in overlay {
        match base.get_mut(&name) {
            Some(existing) => existing.merge(entry),
            None => {
                base.insert(name, entry);
            }
        }
    }
}

impl Merge for NetworkConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.name, o.name);
        merge_option(&mut self.driver, o.driver);
        self.driver_opts.extend(o.driver_opts);
        merge_option(&mut self.ipam, o.ipam);
        merge_option(&mut self.external, o.external);
        self.internal = self.internal || o.internal;
        self.attachable = self.attachable || o.attachable;
        self.labels.extend(o.labels);
        self.extras.extend(o.extras);
    }
}

impl Merge for VolumeConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.name, o.name);
        merge_option(&mut self.driver, o.driver);
        self.driver_opts.extend(o.driver_opts);
        merge_option(&mut self.external, o.external);
        self.labels.extend(o.labels);
        merge_option(&mut self.cluster_spec, o.cluster_spec);
        self.extras.extend(o.extras);
    }
}

impl Merge for SecretConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.name, o.name);
        merge_option(&mut self.file, o.file);
        merge_option(&mut self.external, o.external);
        self.labels.extend(o.labels);
        merge_option(&mut self.driver, o.driver);
        self.driver_opts.extend(o.driver_opts);
        merge_option(&mut self.template_driver, o.template_driver);
        self.extras.extend(o.extras);
    }
}

impl Merge for ConfigObjConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.name, o.name);
        merge_option(&mut self.file, o.file);
        merge_option(&mut self.external, o.external);
        self.labels.extend(o.labels);
        merge_option(&mut self.template_driver, o.template_driver);
        self.extras.extend(o.extras);
    }
}

impl Merge for ComposeConfig {
    fn merge(&mut self, o: Self) {
        merge_option(&mut self.version, o.version);
        for (name, service) in o.services {
            match self.services.get_mut(&name) {
                Some(existing) => existing.merge(service),
                None => {
                    self.services.insert(name, service);
                }
            }
        }
        for service in self.services.values_mut() {
            canonicalize_service(service);
        }
        merge_entries(&mut self.networks, o.networks);
        merge_entries(&mut self.volumes, o.volumes);
        merge_entries(&mut self.secrets, o.secrets);
        merge_entries(&mut self.configs, o.configs);
        self.include.extend(o.include);
        self.extras.extend(o.extras);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(yaml: &str) -> ServiceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_scalars_override_and_maps_merge() {
        let mut base = service(
            "image: busybox:latest\ncommand: cat file1.txt\nenvironment: {A: '1', B: '2'}\nlabels: {x: a}\n",
        );
        base.merge(service(
            "image: busybox:1.0\ncommand: cat file2.txt\nenvironment: {B: '3'}\nlabels: {y: b}\n",
        ));
        assert_eq!(base.image.as_deref(), Some("busybox:1.0"));
        assert_eq!(base.command.as_deref().unwrap(), &["cat", "file2.txt"]);
        assert_eq!(base.environment["A"].as_deref(), Some("1"));
        assert_eq!(base.environment["B"].as_deref(), Some("3"));
        assert_eq!(base.labels.len(), 2);
    }

    #[test]
    fn test_ports_merge_by_published_port() {
        let mut base = service("ports: ['8080:80', '9090:90']\n");
        base.merge(service("ports: ['8080:8000', '7070:70']\n"));
        let published: Vec<(Option<u32>, u32)> =
            base.ports.iter().map(|p| (p.published, p.target)).collect();
        assert_eq!(
            published,
            vec![(Some(7070), 70), (Some(8080), 8000), (Some(9090), 90)]
        );
    }

    #[test]
    fn test_ports_keep_protocols_and_unpublished_apart() {
        let mut base = service("ports: ['53:53/tcp', '80']\n");
        base.merge(service("ports: ['53:53/udp', '80:8080']\n"));
        let ports: Vec<(Option<u32>, u32, &str)> = base
            .ports
            .iter()
            .map(|p| (p.published, p.target, p.protocol.as_deref().unwrap()))
            .collect();
        assert_eq!(
            ports,
            vec![
                (Some(53), 53, "tcp"),
                (Some(53), 53, "udp"),
                (Some(80), 8080, "tcp"),
                (None, 80, "tcp"),
            ]
        );
    }

    #[test]
    fn test_top_level_resources_merge_per_field() {
        let mut base: ComposeConfig = serde_yaml::from_str(
            "networks:\n  front: {driver: overlay, driver_opts: {encrypted: 'true'}}\nsecrets:\n  token: {file: ./token}\n",
        )
        .unwrap();
        let overlay: ComposeConfig = serde_yaml::from_str(
            "networks:\n  front: {labels: {tier: web}}\n  back: {}\nsecrets:\n  token: {labels: {rotated: 'yes'}}\n",
        )
        .unwrap();
        base.merge(overlay);

        let front = &base.networks["front"];
        assert_eq!(front.driver.as_deref(), Some("overlay"));
        assert_eq!(front.driver_opts["encrypted"], "true");
        assert_eq!(front.labels["tier"], "web");
        assert!(base.networks.contains_key("back"));
        assert_eq!(base.secrets["token"].file.as_deref(), Some("./token"));
        assert_eq!(base.secrets["token"].labels["rotated"], "yes");
    }

    #[test]
    fn test_ports_same_identity_replaced() {
        let mut base = service("ports: [{target: 80, published: 8080, mode: ingress}]\n");
        base.merge(service("ports: [{target: 80, published: 8080, mode: host}]\n"));
        assert_eq!(base.ports.len(), 1);
        assert_eq!(base.ports[0].mode.as_deref(), Some("host"));
    }

    #[test]
    fn test_volumes_merge_by_target_and_secrets_by_source() {
        let mut base = service(
            "volumes: ['a:/data', 'b:/logs']\nsecrets: [{source: s1, target: one}]\n",
        );
        base.merge(service(
            "volumes: ['c:/data']\nsecrets: [{source: s1, target: uno}, s0]\n",
        ));
        let volumes: Vec<(&str, &str)> = base
            .volumes
            .iter()
            .map(|v| (v.source.as_deref().unwrap(), v.target.as_str()))
            .collect();
        assert_eq!(volumes, vec![("c", "/data"), ("b", "/logs")]);
        assert_eq!(base.secrets[0].source, "s0");
        assert_eq!(base.secrets[1].target.as_deref(), Some("uno"));
    }

    #[test]
    fn test_logging_merge() {
        let mut same = service("logging: {driver: json-file, options: {max-size: 10m}}\n");
        same.merge(service("logging: {options: {max-file: '3'}}\n"));
        let logging = same.logging.unwrap();
        assert_eq!(logging.driver.as_deref(), Some("json-file"));
        assert_eq!(logging.options.len(), 2);

        let mut different = service("logging: {driver: json-file, options: {max-size: 10m}}\n");
        different.merge(service("logging: {driver: syslog, options: {tag: x}}\n"));
        let logging = different.logging.unwrap();
        assert_eq!(logging.driver.as_deref(), Some("syslog"));
        assert_eq!(logging.options.len(), 1);
    }

    #[test]
    fn test_deploy_merges_deeply() {
        let mut base = service(
            "deploy: {replicas: 2, update_config: {parallelism: 2, delay: 10s}, labels: {a: '1'}}\n",
        );
        base.merge(service("deploy: {update_config: {delay: 5s}, labels: {b: '2'}}\n"));
        let deploy = base.deploy.unwrap();
        assert_eq!(deploy.replicas, Some(2));
        let update = deploy.update_config.unwrap();
        assert_eq!(update.parallelism, Some(2));
        assert_eq!(update.delay.as_deref(), Some("5s"));
        assert_eq!(deploy.labels.len(), 2);
    }

    #[test]
    fn test_merge_with_itself_is_idempotent() {
        let yaml = r#"
services:
  web:
    image: nginx
    ports: ['9000:90', '8000:80']
    volumes: ['b:/b', 'a:/a']
    environment: {A: '1'}
    networks: [front]
networks:
  front: {}
"#;
        let doc: ComposeConfig = serde_yaml::from_str(yaml).unwrap();
        let mut once = doc.clone();
        once.merge(doc.clone());
        let mut twice = once.clone();
        twice.merge(doc.clone());
        assert_eq!(once, twice);

        let mut canonical = doc;
        for service in canonical.services.values_mut() {
            canonicalize_service(service);
        }
        assert_eq!(once, canonical);
    }
}
