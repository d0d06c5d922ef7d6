//! Compose services to Swarm service specs

use super::volume::volumes;
use super::{add_stack_label, parse_duration_opt, Namespace, DEFAULT_NETWORK, LABEL_IMAGE};
use crate::compose::config::{
    CredentialSpecConfig, DeployConfig, HealthcheckConfig, NetworkConfig, ResourcesConfig,
    RestartPolicyConfig, ServiceConfig, ServiceFileRef, ServicePortConfig, UpdateConfig,
};
use crate::compose::ComposeConfig;
use crate::error::{Result, StackError};
use crate::swarm::network::is_predefined;
use crate::swarm::service::{
    restart_conditions, ConfigReference, ContainerSpec, CredentialSpec, DiscreteGenericResource,
    DnsConfig, Driver, EndpointSpec, FileTarget, GenericResource, HealthConfig, Limit, Mount,
    NetworkAttachmentConfig, Placement, PlacementPreference, PortConfig, Privileges,
    ResourceRequirements, Resources, RestartPolicy, SecretReference, ServiceMode, ServiceSpec,
    SpreadOver, TaskSpec, Ulimit, UpdateConfig as SwarmUpdateConfig,
};
use std::collections::BTreeMap;

/// Default file mode of mounted secrets and configs
const DEFAULT_FILE_MODE: u32 = 0o444;

/// Engine IDs of secrets and configs, keyed by server name
#[derive(Debug, Clone, Default)]
pub struct ObjectIds {
    pub secrets: BTreeMap<String, String>,
    pub configs: BTreeMap<String, String>,
}

/// Convert every service, keyed by local service name
pub fn services(
    namespace: &Namespace,
    config: &ComposeConfig,
    ids: &ObjectIds,
) -> Result<BTreeMap<String, ServiceSpec>> {
    let mut result = BTreeMap::new();
    for (local, service) in &config.services {
        let spec = convert_service(namespace, local, service, config, ids)
            .map_err(|e| match e {
                StackError::Validation(msg) => {
                    StackError::Validation(format!("service {}: {}", local, msg))
                }
                other => other,
            })?;
        result.insert(local.clone(), spec);
    }
    Ok(result)
}

fn convert_service(
    namespace: &Namespace,
    local: &str,
    service: &ServiceConfig,
    config: &ComposeConfig,
    ids: &ObjectIds,
) -> Result<ServiceSpec> {
    let name = namespace.resolve(local, service.name.as_deref());
    let deploy = service.deploy.clone().unwrap_or_default();
    let image = service.image.clone().unwrap_or_default();

    let secrets = convert_secret_refs(namespace, &service.secrets, config, ids)?;
    let configs = convert_config_refs(namespace, &service.configs, config, ids)?;
    let credential_spec = service
        .credential_spec
        .as_ref()
        .map(|spec| convert_credential_spec(namespace, spec, &configs))
        .transpose()?
        .flatten();

    let mut mounts = volumes(&service.volumes, &config.volumes, namespace)?;
    mounts.extend(service.tmpfs.iter().map(|target| Mount {
        mount_type: "tmpfs".to_string(),
        target: target.clone(),
        ..Default::default()
    }));

    let mut labels = add_stack_label(namespace, &deploy.labels);
    labels.insert(LABEL_IMAGE.to_string(), image.clone());

    let container = ContainerSpec {
        image,
        labels: add_stack_label(namespace, &service.labels),
        command: service.entrypoint.clone().unwrap_or_default(),
        args: service.command.clone().unwrap_or_default(),
        hostname: service.hostname.clone(),
        env: convert_environment(&service.environment),
        dir: service.working_dir.clone(),
        user: service.user.clone(),
        mounts,
        stop_grace_period: parse_duration_opt(service.stop_grace_period.as_deref())?,
        stop_signal: service.stop_signal.clone(),
        healthcheck: service
            .healthcheck
            .as_ref()
            .map(convert_healthcheck)
            .transpose()?,
        hosts: convert_extra_hosts(&service.extra_hosts),
        dns_config: convert_dns(&service.dns, &service.dns_search),
        secrets,
        configs,
        read_only: service.read_only.unwrap_or(false),
        tty: service.tty.unwrap_or(false),
        open_stdin: service.stdin_open.unwrap_or(false),
        init: service.init,
        isolation: service.isolation.clone(),
        sysctls: service.sysctls.clone(),
        ulimits: service
            .ulimits
            .iter()
            .map(|(name, limit)| {
                let (soft, hard) = limit.limits();
                Ulimit {
                    name: name.clone(),
                    soft,
                    hard,
                }
            })
            .collect(),
        privileges: credential_spec.map(|spec| Privileges {
            credential_spec: Some(spec),
        }),
    };

    Ok(ServiceSpec {
        name,
        labels,
        task_template: TaskSpec {
            container_spec: Some(container),
            resources: deploy.resources.as_ref().map(convert_resources).transpose()?,
            restart_policy: convert_restart_policy(
                service.restart.as_deref(),
                deploy.restart_policy.as_ref(),
            )?,
            placement: convert_placement(&deploy),
            networks: convert_service_networks(namespace, local, service, &config.networks)?,
            log_driver: service.logging.as_ref().map(|logging| Driver {
                name: logging.driver.clone().unwrap_or_default(),
                options: logging.options.clone(),
            }),
            force_update: 0,
        },
        mode: Some(convert_deploy_mode(deploy.mode.as_deref(), deploy.replicas)?),
        update_config: deploy
            .update_config
            .as_ref()
            .map(convert_update_config)
            .transpose()?,
        rollback_config: deploy
            .rollback_config
            .as_ref()
            .map(convert_update_config)
            .transpose()?,
        endpoint_spec: Some(convert_endpoint_spec(
            deploy.endpoint_mode.as_deref(),
            &service.ports,
        )),
    })
}

/// `KEY=value` entries, or bare `KEY` for unset values, sorted
fn convert_environment(environment: &BTreeMap<String, Option<String>>) -> Vec<String> {
    let mut env: Vec<String> = environment
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{}={}", key, value),
            None => key.clone(),
        })
        .collect();
    env.sort();
    env
}

/// `host:ip` to the `ip host` form of /etc/hosts
fn convert_extra_hosts(extra_hosts: &[String]) -> Vec<String> {
    extra_hosts
        .iter()
        .map(|entry| match entry.split_once(':') {
            Some((host, ip)) => format!("{} {}", ip, host),
            None => entry.clone(),
        })
        .collect()
}

fn convert_dns(dns: &[String], search: &[String]) -> Option<DnsConfig> {
    if dns.is_empty() && search.is_empty() {
        return None;
    }
    Some(DnsConfig {
        nameservers: dns.to_vec(),
        search: search.to_vec(),
        options: Vec::new(),
    })
}

fn convert_healthcheck(healthcheck: &HealthcheckConfig) -> Result<HealthConfig> {
    if healthcheck.disable {
        if healthcheck.test.as_ref().is_some_and(|t| !t.is_empty()) {
            return Err(StackError::Validation(
                "test and disable can't be set at the same time".to_string(),
            ));
        }
        return Ok(HealthConfig {
            test: vec!["NONE".to_string()],
            ..Default::default()
        });
    }
    Ok(HealthConfig {
        test: healthcheck.test.clone().unwrap_or_default(),
        interval: parse_duration_opt(healthcheck.interval.as_deref())?,
        timeout: parse_duration_opt(healthcheck.timeout.as_deref())?,
        start_period: parse_duration_opt(healthcheck.start_period.as_deref())?,
        retries: healthcheck.retries,
    })
}

fn convert_restart_policy(
    restart: Option<&str>,
    source: Option<&RestartPolicyConfig>,
) -> Result<Option<RestartPolicy>> {
    if let Some(source) = source {
        return Ok(Some(RestartPolicy {
            condition: source.condition.clone().unwrap_or_default(),
            delay: parse_duration_opt(source.delay.as_deref())?,
            max_attempts: source.max_attempts,
            window: parse_duration_opt(source.window.as_deref())?,
        }));
    }

    let restart = restart.unwrap_or("");
    let (policy, count) = match restart.split_once(':') {
        Some((policy, count)) => (policy, Some(count)),
        None => (restart, None),
    };
    let unknown = || StackError::Validation(format!("unknown restart policy: {}", restart));

    match policy {
        "" | "no" if count.is_none() => Ok(None),
        "always" | "unless-stopped" if count.is_none() => Ok(Some(RestartPolicy {
            condition: restart_conditions::ANY.to_string(),
            ..Default::default()
        })),
        "on-failure" => {
            let attempts = match count {
                Some(count) => count.parse::<u64>().map_err(|_| {
                    StackError::Validation(format!(
                        "maximum retry count must be an integer: {}",
                        count
                    ))
                })?,
                None => 0,
            };
            Ok(Some(RestartPolicy {
                condition: restart_conditions::ON_FAILURE.to_string(),
                max_attempts: Some(attempts),
                ..Default::default()
            }))
        }
        _ => Err(unknown()),
    }
}

fn convert_update_config(source: &UpdateConfig) -> Result<SwarmUpdateConfig> {
    Ok(SwarmUpdateConfig {
        parallelism: source.parallelism.unwrap_or(1),
        delay: parse_duration_opt(source.delay.as_deref())?,
        failure_action: source.failure_action.clone(),
        monitor: parse_duration_opt(source.monitor.as_deref())?,
        max_failure_ratio: source.max_failure_ratio,
        order: source.order.clone(),
    })
}

fn parse_cpus(text: &str) -> Result<i64> {
    let cpus: f64 = text
        .trim()
        .parse()
        .map_err(|_| StackError::Validation(format!("invalid cpus value: {:?}", text)))?;
    Ok((cpus * 1e9) as i64)
}

fn convert_resources(source: &ResourcesConfig) -> Result<ResourceRequirements> {
    let limits = match &source.limits {
        Some(limits) => Some(Limit {
            nano_cpus: limits.cpus.as_deref().map(parse_cpus).transpose()?.unwrap_or(0),
            memory_bytes: limits.memory.map(|m| m.0).unwrap_or(0),
            pids: limits.pids.unwrap_or(0),
        }),
        None => None,
    };
    let reservations = match &source.reservations {
        Some(reservations) => Some(Resources {
            nano_cpus: reservations
                .cpus
                .as_deref()
                .map(parse_cpus)
                .transpose()?
                .unwrap_or(0),
            memory_bytes: reservations.memory.map(|m| m.0).unwrap_or(0),
            generic_resources: reservations
                .generic_resources
                .iter()
                .map(|resource| GenericResource {
                    discrete_resource_spec: resource.discrete_resource_spec.as_ref().map(|d| {
                        DiscreteGenericResource {
                            kind: d.kind.clone(),
                            value: d.value,
                        }
                    }),
                })
                .collect(),
        }),
        None => None,
    };
    Ok(ResourceRequirements {
        limits,
        reservations,
    })
}

fn convert_placement(deploy: &DeployConfig) -> Option<Placement> {
    let placement = deploy.placement.as_ref()?;
    Some(Placement {
        constraints: placement.constraints.clone(),
        preferences: placement
            .preferences
            .iter()
            .map(|pref| PlacementPreference {
                spread: SpreadOver {
                    spread_descriptor: pref.spread.clone(),
                },
            })
            .collect(),
        max_replicas: placement.max_replicas_per_node,
    })
}

fn convert_deploy_mode(mode: Option<&str>, replicas: Option<u64>) -> Result<ServiceMode> {
    match mode.unwrap_or("") {
        "global" => {
            if replicas.is_some() {
                return Err(StackError::Validation(
                    "replicas can only be used with replicated mode".to_string(),
                ));
            }
            Ok(ServiceMode::global())
        }
        "replicated" | "" => Ok(ServiceMode::replicated(replicas)),
        other => Err(StackError::Validation(format!("Unknown mode: {}", other))),
    }
}

/// Port configs sorted by published port
fn convert_endpoint_spec(mode: Option<&str>, ports: &[ServicePortConfig]) -> EndpointSpec {
    let mut configs: Vec<PortConfig> = ports
        .iter()
        .map(|port| PortConfig {
            name: None,
            protocol: port.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
            target_port: port.target,
            published_port: port.published.unwrap_or(0),
            publish_mode: port.mode.clone().unwrap_or_else(|| "ingress".to_string()),
        })
        .collect();
    configs.sort_by_key(|p| p.published_port);
    EndpointSpec {
        mode: mode.map(str::to_lowercase),
        ports: configs,
    }
}

fn convert_service_networks(
    namespace: &Namespace,
    local: &str,
    service: &ServiceConfig,
    declared: &BTreeMap<String, NetworkConfig>,
) -> Result<Vec<NetworkAttachmentConfig>> {
    let default_attachment = BTreeMap::from([(DEFAULT_NETWORK.to_string(), None)]);
    let attachments = if service.networks.is_empty() {
        &default_attachment
    } else {
        &service.networks
    };

    let mut nets = Vec::with_capacity(attachments.len());
    for (network_name, attachment) in attachments {
        let network = declared.get(network_name);
        if network.is_none() && network_name != DEFAULT_NETWORK {
            return Err(StackError::Validation(format!(
                "undefined network {:?}",
                network_name
            )));
        }
        let target =
            namespace.resolve(network_name, network.and_then(|n| n.name.as_deref()));
        let mut aliases = attachment
            .as_ref()
            .map(|a| a.aliases.clone())
            .unwrap_or_default();
        if !is_predefined(&target) {
            aliases.push(local.to_string());
        }
        nets.push(NetworkAttachmentConfig {
            target,
            aliases,
            driver_opts: BTreeMap::new(),
        });
    }
    nets.sort_by(|a, b| a.target.cmp(&b.target));
    Ok(nets)
}

/// Target file and server name of a secret or config reference
fn file_target(
    namespace: &Namespace,
    reference: &ServiceFileRef,
    explicit_name: Option<&str>,
) -> (FileTarget, String) {
    let target = reference
        .target
        .clone()
        .unwrap_or_else(|| reference.source.clone());
    let file = FileTarget {
        name: target,
        uid: reference.uid.clone().unwrap_or_else(|| "0".to_string()),
        gid: reference.gid.clone().unwrap_or_else(|| "0".to_string()),
        mode: reference.mode.unwrap_or(DEFAULT_FILE_MODE),
    };
    (file, namespace.resolve(&reference.source, explicit_name))
}

fn convert_secret_refs(
    namespace: &Namespace,
    refs: &[ServiceFileRef],
    config: &ComposeConfig,
    ids: &ObjectIds,
) -> Result<Vec<SecretReference>> {
    let mut out = Vec::with_capacity(refs.len());
    for reference in refs {
        let declared = config.secrets.get(&reference.source).ok_or_else(|| {
            StackError::Validation(format!("undefined secret {:?}", reference.source))
        })?;
        let (file, name) = file_target(namespace, reference, declared.name.as_deref());
        let id = ids
            .secrets
            .get(&name)
            .ok_or_else(|| StackError::NotFound(format!("secret not found: {}", name)))?;
        out.push(SecretReference {
            file: Some(file),
            secret_id: id.clone(),
            secret_name: name,
        });
    }
    out.sort_by(|a, b| a.secret_name.cmp(&b.secret_name));
    Ok(out)
}

fn convert_config_refs(
    namespace: &Namespace,
    refs: &[ServiceFileRef],
    config: &ComposeConfig,
    ids: &ObjectIds,
) -> Result<Vec<ConfigReference>> {
    let mut out = Vec::with_capacity(refs.len());
    for reference in refs {
        let declared = config.configs.get(&reference.source).ok_or_else(|| {
            StackError::Validation(format!("undefined config {:?}", reference.source))
        })?;
        let (file, name) = file_target(namespace, reference, declared.name.as_deref());
        let id = ids
            .configs
            .get(&name)
            .ok_or_else(|| StackError::NotFound(format!("config not found: {}", name)))?;
        out.push(ConfigReference {
            file: Some(file),
            config_id: id.clone(),
            config_name: name,
        });
    }
    out.sort_by(|a, b| a.config_name.cmp(&b.config_name));
    Ok(out)
}

fn convert_credential_spec(
    namespace: &Namespace,
    spec: &CredentialSpecConfig,
    refs: &[ConfigReference],
) -> Result<Option<CredentialSpec>> {
    let set: Vec<&str> = [
        ("\"Config\"", &spec.config),
        ("\"File\"", &spec.file),
        ("\"Registry\"", &spec.registry),
    ]
    .into_iter()
    .filter(|(_, value)| value.as_deref().is_some_and(|v| !v.is_empty()))
    .map(|(name, _)| name)
    .collect();

    match set.len() {
        0 => return Ok(None),
        1 => {}
        2 => {
            return Err(StackError::Validation(format!(
                "invalid credential spec: cannot specify both {} and {}",
                set[0], set[1]
            )))
        }
        _ => {
            return Err(StackError::Validation(format!(
                "invalid credential spec: cannot specify both {}, and {}",
                set[..set.len() - 1].join(", "),
                set[set.len() - 1]
            )))
        }
    }

    let mut out = CredentialSpec {
        config: spec.config.clone(),
        file: spec.file.clone(),
        registry: spec.registry.clone(),
    };
    if let Some(config) = spec.config.as_deref().filter(|c| !c.is_empty()) {
        let scoped = namespace.scope(config);
        let found = refs
            .iter()
            .find(|r| r.config_name == config)
            .or_else(|| refs.iter().find(|r| r.config_name == scoped));
        match found {
            Some(reference) => out.config = Some(reference.config_id.clone()),
            None => {
                return Err(StackError::Validation(format!(
                    "invalid credential spec: spec specifies config {}, but no such config can be found",
                    config
                )))
            }
        }
    }
    Ok(Some(out))
}
