//! Stack deploy: converge the engine towards a Compose model
//!
//! The order of operations is fixed: swarm check, prune, external networks,
//! networks, secrets, configs, services, wait.

use super::progress::{wait_on_service, ProgressOptions};
use super::{stack_networks, stack_services, validate_stack_name, Output};
use crate::compose::config::is_external;
use crate::compose::validate::check_service_names;
use crate::compose::ComposeConfig;
use crate::config::CliConfig;
use crate::convert::{self, Namespace, ObjectIds};
use crate::engine::{EngineApi, ServiceCreateOptions, ServiceUpdateOptions};
use crate::error::{Result, StackError};
use crate::swarm::network::is_predefined;
use crate::swarm::{ConfigSpec, NetworkCreate, SecretSpec, Service, ServiceSpec};
use clap::ValueEnum;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Driver used for stack networks that do not name one
pub const DEFAULT_NETWORK_DRIVER: &str = "overlay";

/// When the engine should resolve image digests against the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ResolveImage {
    /// Always query the registry
    #[default]
    Always,
    /// Query only when the image changed
    Changed,
    /// Never query the registry
    Never,
}

/// Deploy flags
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub namespace: String,
    pub prune: bool,
    pub send_registry_auth: bool,
    pub resolve_image: ResolveImage,
    pub detach: bool,
    pub quiet: bool,
    pub progress: ProgressOptions,
}

/// Deploy a loaded Compose model as a stack
pub async fn deploy<E: EngineApi + ?Sized>(
    engine: &E,
    cli_config: &CliConfig,
    config: &ComposeConfig,
    options: &DeployOptions,
    output: &Output,
) -> Result<()> {
    validate_stack_name(&options.namespace)?;
    check_swarm_manager(engine).await?;
    check_service_names(config, &options.namespace)?;

    let namespace = Namespace::new(options.namespace.as_str());
    info!(namespace = %namespace.name(), "deploying stack");

    if options.prune {
        let keep: BTreeSet<String> = config
            .services
            .iter()
            .map(|(local, service)| namespace.resolve(local, service.name.as_deref()))
            .collect();
        prune_services(engine, &namespace, &keep, output).await?;
    }

    let used = convert::services_networks(config);
    let (networks, externals) = convert::networks(&namespace, &config.networks, &used);
    validate_external_networks(engine, &externals).await?;
    create_networks(engine, &namespace, networks, output).await?;

    let mut ids = ObjectIds::default();
    let secrets = convert::secrets(&namespace, &config.secrets)?;
    create_secrets(engine, &secrets, &mut ids, output).await?;
    let configs = convert::configs(&namespace, &config.configs)?;
    create_configs(engine, &configs, &mut ids, output).await?;
    resolve_external_objects(engine, &namespace, config, &mut ids).await?;

    let services = convert::services(&namespace, config, &ids)?;
    let service_ids = deploy_services(engine, cli_config, services, &namespace, options, output).await?;

    if options.detach {
        return Ok(());
    }
    wait_on_services(engine, &service_ids, options, output).await
}

async fn check_swarm_manager<E: EngineApi + ?Sized>(engine: &E) -> Result<()> {
    let info = engine.info().await?;
    if !info.is_manager() {
        return Err(StackError::Precondition(
            "this node is not a swarm manager. Use \"docker swarm init\" or \"docker swarm join\" \
             to connect this node to swarm and try again"
                .to_string(),
        ));
    }
    Ok(())
}

async fn prune_services<E: EngineApi + ?Sized>(
    engine: &E,
    namespace: &Namespace,
    keep: &BTreeSet<String>,
    output: &Output,
) -> Result<()> {
    let mut stale: Vec<Service> = stack_services(engine, namespace.name())
        .await?
        .into_iter()
        .filter(|s| !keep.contains(&s.spec.name))
        .collect();
    stale.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
    for service in stale {
        output.err(format!("Removing service {}", service.spec.name));
        if let Err(e) = engine.service_remove(&service.id).await {
            output.err(format!("Failed to remove service {}: {}", service.id, e));
        }
    }
    Ok(())
}

async fn validate_external_networks<E: EngineApi + ?Sized>(
    engine: &E,
    externals: &[String],
) -> Result<()> {
    for name in externals {
        if is_predefined(name) {
            continue;
        }
        match engine.network_inspect(name).await {
            Ok(network) if network.scope != "swarm" => {
                return Err(StackError::Precondition(format!(
                    "network {:?} is declared as external, but it is not in the right scope: {:?} instead of \"swarm\"",
                    name, network.scope
                )));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(StackError::Precondition(format!(
                    "network {:?} is declared as external, but could not be found. You need to \
                     create a swarm-scoped network before the stack is deployed",
                    name
                )));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn create_networks<E: EngineApi + ?Sized>(
    engine: &E,
    namespace: &Namespace,
    networks: BTreeMap<String, NetworkCreate>,
    output: &Output,
) -> Result<()> {
    let existing: BTreeSet<String> = stack_networks(engine, namespace.name())
        .await?
        .into_iter()
        .map(|n| n.name)
        .collect();

    for (name, mut request) in networks {
        if existing.contains(&name) {
            debug!(network = %name, "network exists");
            continue;
        }
        if request.driver.as_deref().unwrap_or("").is_empty() {
            request.driver = Some(DEFAULT_NETWORK_DRIVER.to_string());
        }
        output.out(format!("Creating network {}", name));
        engine
            .network_create(&request)
            .await
            .map_err(|e| wrap("failed to create network", &name, e))?;
    }
    Ok(())
}

async fn create_secrets<E: EngineApi + ?Sized>(
    engine: &E,
    secrets: &[SecretSpec],
    ids: &mut ObjectIds,
    output: &Output,
) -> Result<()> {
    for spec in secrets {
        match engine.secret_inspect(&spec.name).await {
            Ok(existing) => {
                output.out(format!("Updating secret {}", spec.name));
                engine
                    .secret_update(&existing.id, existing.version, spec)
                    .await
                    .map_err(|e| wrap("failed to update secret", &spec.name, e))?;
                ids.secrets.insert(spec.name.clone(), existing.id);
            }
            Err(e) if e.is_not_found() => {
                output.out(format!("Creating secret {}", spec.name));
                let created = engine
                    .secret_create(spec)
                    .await
                    .map_err(|e| wrap("failed to create secret", &spec.name, e))?;
                ids.secrets.insert(spec.name.clone(), created.id);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn create_configs<E: EngineApi + ?Sized>(
    engine: &E,
    configs: &[ConfigSpec],
    ids: &mut ObjectIds,
    output: &Output,
) -> Result<()> {
    for spec in configs {
        match engine.config_inspect(&spec.name).await {
            Ok(existing) => {
                output.out(format!("Updating config {}", spec.name));
                engine
                    .config_update(&existing.id, existing.version, spec)
                    .await
                    .map_err(|e| wrap("failed to update config", &spec.name, e))?;
                ids.configs.insert(spec.name.clone(), existing.id);
            }
            Err(e) if e.is_not_found() => {
                output.out(format!("Creating config {}", spec.name));
                let created = engine
                    .config_create(spec)
                    .await
                    .map_err(|e| wrap("failed to create config", &spec.name, e))?;
                ids.configs.insert(spec.name.clone(), created.id);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn wrap(action: &str, name: &str, e: StackError) -> StackError {
    StackError::Precondition(format!("{} {}: {}", action, name, e))
}

/// IDs of external secrets and configs; missing ones are reported by the converter
async fn resolve_external_objects<E: EngineApi + ?Sized>(
    engine: &E,
    namespace: &Namespace,
    config: &ComposeConfig,
    ids: &mut ObjectIds,
) -> Result<()> {
    for (local, secret) in &config.secrets {
        if !is_external(&secret.external) {
            continue;
        }
        let name = namespace.resolve(local, secret.name.as_deref());
        match engine.secret_inspect(&name).await {
            Ok(found) => {
                ids.secrets.insert(name, found.id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    for (local, cfg) in &config.configs {
        if !is_external(&cfg.external) {
            continue;
        }
        let name = namespace.resolve(local, cfg.name.as_deref());
        match engine.config_inspect(&name).await {
            Ok(found) => {
                ids.configs.insert(name, found.id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn spec_image(spec: &ServiceSpec) -> String {
    spec.task_template
        .container_spec
        .as_ref()
        .map(|c| c.image.clone())
        .unwrap_or_default()
}

fn set_spec_image(spec: &mut ServiceSpec, image: &str) {
    if let Some(container) = spec.task_template.container_spec.as_mut() {
        container.image = image.to_string();
    }
}

/// Create or update every service; per-service failures are collected
async fn deploy_services<E: EngineApi + ?Sized>(
    engine: &E,
    cli_config: &CliConfig,
    services: BTreeMap<String, ServiceSpec>,
    namespace: &Namespace,
    options: &DeployOptions,
    output: &Output,
) -> Result<Vec<String>> {
    let existing: BTreeMap<String, Service> = stack_services(engine, namespace.name())
        .await?
        .into_iter()
        .map(|s| (s.spec.name.clone(), s))
        .collect();

    let mut service_ids = Vec::new();
    let mut errors = Vec::new();

    for (_local, mut spec) in services {
        let name = spec.name.clone();
        let image = spec_image(&spec);

        let encoded_auth = if options.send_registry_auth {
            match cli_config.encode_auth_for_image(&image) {
                Ok(auth) => Some(auth),
                Err(e) => {
                    errors.push(format!("failed to retrieve registry auth for {}: {}", name, e));
                    continue;
                }
            }
        } else {
            None
        };

        match existing.get(&name) {
            Some(service) => {
                output.out(format!("Updating service {} (id: {})", name, service.id));
                let mut update = ServiceUpdateOptions {
                    encoded_registry_auth: encoded_auth,
                    ..Default::default()
                };
                let unchanged = service.image_label() == Some(image.as_str());
                match options.resolve_image {
                    ResolveImage::Always => update.query_registry = true,
                    ResolveImage::Changed if !unchanged => update.query_registry = true,
                    ResolveImage::Changed | ResolveImage::Never => {
                        if unchanged {
                            if let Some(stored) = service.image() {
                                set_spec_image(&mut spec, stored);
                            }
                        }
                    }
                }
                spec.task_template.force_update = service.spec.task_template.force_update;

                match engine
                    .service_update(&service.id, service.version, &spec, &update)
                    .await
                {
                    Ok(response) => {
                        for warning in response.warnings {
                            output.err(warning);
                        }
                        service_ids.push(service.id.clone());
                    }
                    Err(e) => errors.push(format!("failed to update service {}: {}", name, e)),
                }
            }
            None => {
                output.out(format!("Creating service {}", name));
                let create = ServiceCreateOptions {
                    encoded_registry_auth: encoded_auth,
                    query_registry: options.resolve_image != ResolveImage::Never,
                };
                match engine.service_create(&spec, &create).await {
                    Ok(response) => {
                        for warning in response.warnings {
                            output.err(warning);
                        }
                        service_ids.push(response.id);
                    }
                    Err(e) => errors.push(format!("failed to create service {}: {}", name, e)),
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(service_ids)
    } else {
        Err(StackError::Partial(errors))
    }
}

async fn wait_on_services<E: EngineApi + ?Sized>(
    engine: &E,
    service_ids: &[String],
    options: &DeployOptions,
    output: &Output,
) -> Result<()> {
    let mut errors = Vec::new();
    for id in service_ids {
        if let Err(e) =
            wait_on_service(engine, id, options.quiet, &options.progress, output).await
        {
            errors.push(format!("{}: {}", id, e));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StackError::Partial(errors))
    }
}
