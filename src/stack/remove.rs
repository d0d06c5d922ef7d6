//! Stack remove

use super::{
    stack_configs, stack_filter, stack_networks, stack_secrets, stack_services,
    validate_stack_name, Output,
};
use crate::engine::EngineApi;
use crate::error::{Result, StackError};
use crate::swarm::node::version_less_than;
use crate::swarm::{Config, NetworkResource, Secret, Service};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Secrets need API 1.25, configs 1.30
const SECRETS_MIN_API: &str = "1.25";
const CONFIGS_MIN_API: &str = "1.30";

/// Remove flags
#[derive(Debug, Clone)]
pub struct RemoveOptions {
    pub namespaces: Vec<String>,
    /// Return without waiting for tasks to shut down
    pub detach: bool,
    pub poll_interval: Duration,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            detach: true,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Remove every resource of each namespace
///
/// Namespaces are handled independently; their errors are joined at the end.
pub async fn remove<E: EngineApi + ?Sized>(
    engine: &E,
    options: &RemoveOptions,
    output: &Output,
) -> Result<()> {
    let api_version = engine.server_version().await?.api_version;
    let mut errors = Vec::new();

    for namespace in &options.namespaces {
        validate_stack_name(namespace)?;
        info!(namespace = %namespace, "removing stack");

        let mut services = stack_services(engine, namespace).await?;
        let networks = stack_networks(engine, namespace).await?;
        let secrets = if version_less_than(&api_version, SECRETS_MIN_API) {
            Vec::new()
        } else {
            stack_secrets(engine, namespace).await?
        };
        let configs = if version_less_than(&api_version, CONFIGS_MIN_API) {
            Vec::new()
        } else {
            stack_configs(engine, namespace).await?
        };

        if services.is_empty() && networks.is_empty() && secrets.is_empty() && configs.is_empty()
        {
            output.err(format!("Nothing found in stack: {}", namespace));
            continue;
        }

        services.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        let mut had_errors = remove_services(engine, &services, output).await;
        had_errors |= remove_secrets(engine, &secrets, output).await;
        had_errors |= remove_configs(engine, &configs, output).await;
        had_errors |= remove_networks(engine, &networks, output).await;

        if had_errors {
            errors.push(format!(
                "Failed to remove some resources from stack: {}",
                namespace
            ));
            continue;
        }

        if !options.detach {
            if let Err(e) = wait_on_tasks(engine, namespace, options.poll_interval).await {
                errors.push(format!(
                    "Failed to wait on tasks of stack: {}: {}",
                    namespace, e
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(StackError::Partial(errors))
    }
}

async fn remove_services<E: EngineApi + ?Sized>(
    engine: &E,
    services: &[Service],
    output: &Output,
) -> bool {
    let mut had_errors = false;
    for service in services {
        output.err(format!("Removing service {}", service.spec.name));
        if let Err(e) = engine.service_remove(&service.id).await {
            had_errors = true;
            output.err(format!("Failed to remove service {}: {}", service.id, e));
        }
    }
    had_errors
}

async fn remove_secrets<E: EngineApi + ?Sized>(
    engine: &E,
    secrets: &[Secret],
    output: &Output,
) -> bool {
    let mut had_errors = false;
    for secret in secrets {
        output.err(format!("Removing secret {}", secret.spec.name));
        if let Err(e) = engine.secret_remove(&secret.id).await {
            had_errors = true;
            output.err(format!("Failed to remove secret {}: {}", secret.id, e));
        }
    }
    had_errors
}

async fn remove_configs<E: EngineApi + ?Sized>(
    engine: &E,
    configs: &[Config],
    output: &Output,
) -> bool {
    let mut had_errors = false;
    for config in configs {
        output.err(format!("Removing config {}", config.spec.name));
        if let Err(e) = engine.config_remove(&config.id).await {
            had_errors = true;
            output.err(format!("Failed to remove config {}: {}", config.id, e));
        }
    }
    had_errors
}

async fn remove_networks<E: EngineApi + ?Sized>(
    engine: &E,
    networks: &[NetworkResource],
    output: &Output,
) -> bool {
    let mut had_errors = false;
    for network in networks {
        output.err(format!("Removing network {}", network.name));
        if let Err(e) = engine.network_remove(&network.id).await {
            had_errors = true;
            output.err(format!("Failed to remove network {}: {}", network.id, e));
        }
    }
    had_errors
}

/// Poll until every task of the stack reached a terminal state
async fn wait_on_tasks<E: EngineApi + ?Sized>(
    engine: &E,
    namespace: &str,
    poll_interval: Duration,
) -> Result<()> {
    let filters = stack_filter(namespace, &[])?;
    loop {
        let tasks = engine.task_list(&filters).await?;
        let pending = tasks
            .iter()
            .filter(|t| !t.status.state.is_terminal())
            .count();
        if pending == 0 {
            return Ok(());
        }
        debug!(namespace = %namespace, pending, "waiting on tasks");
        sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::LABEL_NAMESPACE;
    use crate::engine::fake::{to_map, Call, FakeEngine};
    use crate::swarm::service::ContainerSpec;
    use crate::swarm::task::TaskStatus;
    use crate::swarm::{ServiceSpec, Task, TaskState};
    use std::sync::Arc;

    fn labeled(name: &str, namespace: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            labels: to_map(&[(LABEL_NAMESPACE, namespace)]),
            ..Default::default()
        }
    }

    fn populate(engine: &FakeEngine) {
        // Inserted out of order; removal sorts services by name
        engine.add_service("id-s2", labeled("bar_s2", "bar"));
        engine.add_service("id-s1", labeled("bar_s1", "bar"));
        engine.add_network("id-n1", "bar_n1", "swarm", &[(LABEL_NAMESPACE, "bar")]);
        engine.add_secret("id-sec1", "bar_sec1", &[(LABEL_NAMESPACE, "bar")]);
        engine.add_config("id-cfg1", "bar_cfg1", &[(LABEL_NAMESPACE, "bar")]);
        engine.add_service("id-other", labeled("foo_s1", "foo"));
    }

    fn options(namespaces: &[&str]) -> RemoveOptions {
        RemoveOptions {
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            detach: true,
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_remove_order() {
        let engine = FakeEngine::new();
        populate(&engine);
        let (output, _, err) = Output::capture();
        remove(&engine, &options(&["bar"]), &output).await.unwrap();

        assert_eq!(
            err.lines(),
            vec![
                "Removing service bar_s1",
                "Removing service bar_s2",
                "Removing secret bar_sec1",
                "Removing config bar_cfg1",
                "Removing network bar_n1",
            ]
        );
        assert_eq!(
            engine.calls(),
            vec![
                Call::ServiceRemove("id-s1".to_string()),
                Call::ServiceRemove("id-s2".to_string()),
                Call::SecretRemove("id-sec1".to_string()),
                Call::ConfigRemove("id-cfg1".to_string()),
                Call::NetworkRemove("id-n1".to_string()),
            ]
        );
        assert_eq!(engine.state().services.len(), 1);
    }

    #[tokio::test]
    async fn test_old_api_skips_secrets_and_configs() {
        let engine = FakeEngine::new();
        populate(&engine);
        engine.state().version.api_version = "1.24".to_string();
        let (output, _, err) = Output::capture();
        remove(&engine, &options(&["bar"]), &output).await.unwrap();
        let lines = err.lines();
        assert!(!lines.iter().any(|l| l.contains("secret")));
        assert!(!lines.iter().any(|l| l.contains("config")));
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn test_nothing_found() {
        let engine = FakeEngine::new();
        let (output, _, err) = Output::capture();
        remove(&engine, &options(&["empty"]), &output).await.unwrap();
        assert_eq!(err.lines(), vec!["Nothing found in stack: empty"]);
    }

    #[tokio::test]
    async fn test_failures_continue_and_join() {
        let engine = FakeEngine::new();
        populate(&engine);
        engine.state().failing_removals.insert("id-s1".to_string());
        engine.state().failing_removals.insert("id-n1".to_string());
        let (output, _, err) = Output::capture();
        let result = remove(&engine, &options(&["bar", "foo"]), &output).await;

        match result {
            Err(StackError::Partial(errors)) => {
                assert_eq!(
                    errors,
                    vec!["Failed to remove some resources from stack: bar"]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        let lines = err.lines();
        assert!(lines[1].starts_with("Failed to remove service id-s1"));
        assert!(lines.contains(&"Removing service bar_s2".to_string()));
        assert!(lines.contains(&"Removing service foo_s1".to_string()));
    }

    #[tokio::test]
    async fn test_waits_for_terminal_tasks() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_service("id-s1", labeled("bar_s1", "bar"));
        engine.state().tasks.push(Task {
            id: "t1".to_string(),
            service_id: "id-s1".to_string(),
            spec: crate::swarm::service::TaskSpec {
                container_spec: Some(ContainerSpec {
                    labels: to_map(&[(LABEL_NAMESPACE, "bar")]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: TaskStatus {
                state: TaskState::Running,
                ..Default::default()
            },
            ..Default::default()
        });

        let background = engine.clone();
        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            background.state().tasks[0].status.state = TaskState::Shutdown;
        });

        let mut opts = options(&["bar"]);
        opts.detach = false;
        let (output, _, _) = Output::capture();
        remove(engine.as_ref(), &opts, &output).await.unwrap();
        stopper.await.unwrap();
        assert!(engine.state().tasks[0].status.state.is_terminal());
    }

    #[tokio::test]
    async fn test_invalid_name() {
        let engine = FakeEngine::new();
        let (output, _, _) = Output::capture();
        let err = remove(&engine, &options(&["  "]), &output).await.unwrap_err();
        assert_eq!(err.exit_code(), 125);
    }
}
