//! `stack ls`, `stack services` and `stack ps`

use super::{stack_filter, validate_stack_name, Output};
use crate::convert::LABEL_NAMESPACE;
use crate::engine::{EngineApi, Filters, ServiceListOptions};
use crate::error::{Result, StackError};
use crate::format::{Formatter, SERVICE_TABLE, STACK_TABLE, TASK_TABLE};
use crate::swarm::service::PortConfig;
use crate::swarm::{Service, Task};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

const TRUNCATED_ID_LEN: usize = 12;
const MAX_ERROR_LEN: usize = 30;
const HISTORY_INDENT: &str = " \\_ ";

/// Row of `stack ls`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackRow {
    pub name: String,
    pub services: usize,
}

/// Row of `stack services`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mode")]
    pub mode: String,
    #[serde(rename = "Replicas")]
    pub replicas: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Ports")]
    pub ports: String,
}

/// Row of `stack ps`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "DesiredState")]
    pub desired_state: String,
    #[serde(rename = "CurrentState")]
    pub current_state: String,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Ports")]
    pub ports: String,
}

/// `stack services` flags
#[derive(Debug, Clone, Default)]
pub struct ServicesOptions {
    pub namespace: String,
    pub quiet: bool,
    pub format: Option<String>,
    pub filters: Vec<String>,
}

/// `stack ps` flags
#[derive(Debug, Clone, Default)]
pub struct PsOptions {
    pub namespace: String,
    pub quiet: bool,
    pub format: Option<String>,
    pub filters: Vec<String>,
    pub no_resolve: bool,
    pub no_trunc: bool,
}

/// Compare strings so embedded numbers sort by value (`stack-2` < `stack-10`)
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let n = take_number(&mut left);
                let m = take_number(&mut right);
                let by_value = n
                    .trim_start_matches('0')
                    .len()
                    .cmp(&m.trim_start_matches('0').len())
                    .then_with(|| n.trim_start_matches('0').cmp(m.trim_start_matches('0')));
                match by_value {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            (Some(x), Some(y)) => {
                left.next();
                right.next();
                match x.cmp(&y) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits
}

/// List every stack with its service count
pub async fn list_stacks<E: EngineApi + ?Sized>(
    engine: &E,
    format: Option<&str>,
    output: &Output,
) -> Result<()> {
    let services = engine
        .service_list(&ServiceListOptions {
            filters: Filters::new().with("label", LABEL_NAMESPACE.to_string()),
            status: false,
        })
        .await?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for service in &services {
        let name = service.spec.labels.get(LABEL_NAMESPACE).ok_or_else(|| {
            StackError::Precondition(format!(
                "cannot get label {} for service {}",
                LABEL_NAMESPACE, service.id
            ))
        })?;
        *counts.entry(name.clone()).or_default() += 1;
    }

    let mut rows: Vec<StackRow> = counts
        .into_iter()
        .map(|(name, services)| StackRow { name, services })
        .collect();
    rows.sort_by(|a, b| natural_cmp(&a.name, &b.name));

    output.out_raw(&Formatter::new(format, STACK_TABLE).render(&rows)?);
    Ok(())
}

/// `8080->80/tcp` style summary of ingress-published ports
fn service_ports(service: &Service) -> String {
    let Some(endpoint) = &service.endpoint else {
        return String::new();
    };
    endpoint
        .ports
        .iter()
        .filter(|p| p.publish_mode.is_empty() || p.publish_mode == "ingress")
        .map(|p| format_port(p, "*"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_port(port: &PortConfig, host: &str) -> String {
    let protocol = if port.protocol.is_empty() {
        "tcp"
    } else {
        port.protocol.as_str()
    };
    format!(
        "{}:{}->{}/{}",
        host, port.published_port, port.target_port, protocol
    )
}

/// Image reference without its resolved digest
fn strip_digest(image: &str) -> &str {
    image.split('@').next().unwrap_or(image)
}

fn service_row(service: &Service) -> ServiceRow {
    let replicas = service
        .service_status
        .as_ref()
        .map(|s| format!("{}/{}", s.running_tasks, s.desired_tasks))
        .unwrap_or_default();
    ServiceRow {
        id: service.id.clone(),
        name: service.spec.name.clone(),
        mode: service
            .spec
            .mode
            .as_ref()
            .map(|m| m.name())
            .unwrap_or("replicated")
            .to_string(),
        replicas,
        image: strip_digest(service.image().unwrap_or_default()).to_string(),
        ports: service_ports(service),
    }
}

/// List the services of one stack
pub async fn services<E: EngineApi + ?Sized>(
    engine: &E,
    options: &ServicesOptions,
    output: &Output,
) -> Result<()> {
    validate_stack_name(&options.namespace)?;
    let filters = stack_filter(&options.namespace, &options.filters)?;
    let mut services = engine
        .service_list(&ServiceListOptions {
            filters,
            status: !options.quiet,
        })
        .await?;

    if services.is_empty() {
        output.err(format!("Nothing found in stack: {}", options.namespace));
        return Ok(());
    }
    services.sort_by(|a, b| natural_cmp(&a.spec.name, &b.spec.name));

    if options.quiet {
        for service in &services {
            output.out(&service.id);
        }
        return Ok(());
    }

    let rows: Vec<ServiceRow> = services.iter().map(service_row).collect();
    output.out_raw(&Formatter::new(options.format.as_deref(), SERVICE_TABLE).render(&rows)?);
    Ok(())
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Rough age of a timestamp, in the same words `docker ps` uses
pub fn human_duration(seconds: i64) -> String {
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    match seconds {
        s if s < 1 => "Less than a second".to_string(),
        1 => "1 second".to_string(),
        s if s < 60 => format!("{} seconds", s),
        _ if minutes == 1 => "About a minute".to_string(),
        _ if minutes < 60 => format!("{} minutes", minutes),
        _ if hours == 1 => "About an hour".to_string(),
        _ if hours < 48 => format!("{} hours", hours),
        _ if hours < 24 * 7 * 2 => format!("{} days", days),
        _ if hours < 24 * 30 * 2 => format!("{} weeks", days / 7),
        _ if hours < 24 * 365 * 2 => format!("{} months", days / 30),
        _ => format!("{} years", days / 365),
    }
}

fn current_state(task: &Task, now: DateTime<Utc>) -> String {
    let state = capitalize(task.status.state.as_str());
    match task.status.timestamp {
        Some(at) => format!(
            "{} {} ago",
            state,
            human_duration((now - at).num_seconds())
        ),
        None => state,
    }
}

fn truncate_id(id: &str, no_trunc: bool) -> String {
    if no_trunc {
        id.to_string()
    } else {
        id.chars().take(TRUNCATED_ID_LEN).collect()
    }
}

fn task_error(task: &Task, no_trunc: bool) -> String {
    let mut err = task.status.err.clone().unwrap_or_default();
    if !no_trunc && err.chars().count() > MAX_ERROR_LEN {
        err = err.chars().take(MAX_ERROR_LEN - 1).collect();
        err.push('…');
    }
    if err.is_empty() {
        err
    } else {
        format!("\"{}\"", err)
    }
}

fn task_ports(task: &Task) -> String {
    task.status
        .port_status
        .as_ref()
        .map(|status| {
            status
                .ports
                .iter()
                .map(|p| format_port(p, "*"))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Lookup of service and node names for task rows
struct Names {
    services: BTreeMap<String, String>,
    nodes: BTreeMap<String, String>,
}

impl Names {
    async fn resolve<E: EngineApi + ?Sized>(
        engine: &E,
        tasks: &[Task],
        no_resolve: bool,
    ) -> Result<Self> {
        let mut names = Names {
            services: BTreeMap::new(),
            nodes: BTreeMap::new(),
        };
        for task in tasks {
            if !names.services.contains_key(&task.service_id) {
                let name = if no_resolve {
                    task.service_id.clone()
                } else {
                    engine.service_inspect(&task.service_id).await?.spec.name
                };
                names.services.insert(task.service_id.clone(), name);
            }
            if let Some(node_id) = task.node_id.as_deref().filter(|n| !n.is_empty()) {
                if !names.nodes.contains_key(node_id) {
                    let name = if no_resolve {
                        node_id.to_string()
                    } else {
                        match engine.node_inspect(node_id).await {
                            Ok(node) => node.description.hostname,
                            Err(e) if e.is_not_found() => node_id.to_string(),
                            Err(e) => return Err(e),
                        }
                    };
                    names.nodes.insert(node_id.to_string(), name);
                }
            }
        }
        Ok(names)
    }
}

fn task_name(task: &Task, names: &Names) -> String {
    let service = names
        .services
        .get(&task.service_id)
        .cloned()
        .unwrap_or_else(|| task.service_id.clone());
    match task.slot.filter(|s| *s != 0) {
        Some(slot) => format!("{}.{}", service, slot),
        None => format!("{}.{}", service, task.node_id.as_deref().unwrap_or("")),
    }
}

fn task_rows(tasks: &[Task], names: &Names, no_trunc: bool, now: DateTime<Utc>) -> Vec<TaskRow> {
    let mut named: Vec<(String, &Task)> = tasks.iter().map(|t| (task_name(t, names), t)).collect();
    // Group by name, newest task first within a name
    named.sort_by(|(a, x), (b, y)| {
        natural_cmp(a, b).then_with(|| y.version.index.cmp(&x.version.index))
    });

    let mut rows = Vec::new();
    let mut previous: Option<String> = None;
    for (name, task) in named {
        let shown = if previous.as_deref() == Some(name.as_str()) {
            format!("{}{}", HISTORY_INDENT, name)
        } else {
            name.clone()
        };
        previous = Some(name);

        let image = task
            .spec
            .container_spec
            .as_ref()
            .map(|c| c.image.as_str())
            .unwrap_or_default();
        rows.push(TaskRow {
            id: truncate_id(&task.id, no_trunc),
            name: shown,
            image: if no_trunc {
                image.to_string()
            } else {
                strip_digest(image).to_string()
            },
            node: task
                .node_id
                .as_ref()
                .and_then(|id| names.nodes.get(id))
                .cloned()
                .unwrap_or_default(),
            desired_state: capitalize(task.desired_state.as_str()),
            current_state: current_state(task, now),
            error: task_error(task, no_trunc),
            ports: task_ports(task),
        });
    }
    rows
}

/// List the tasks of one stack
pub async fn ps<E: EngineApi + ?Sized>(
    engine: &E,
    options: &PsOptions,
    output: &Output,
) -> Result<()> {
    validate_stack_name(&options.namespace)?;
    let filters = stack_filter(&options.namespace, &options.filters)?;
    let tasks = engine.task_list(&filters).await?;
    if tasks.is_empty() {
        return Err(StackError::NotFound(format!(
            "nothing found in stack: {}",
            options.namespace
        )));
    }

    let names = Names::resolve(engine, &tasks, options.no_resolve).await?;
    let rows = task_rows(&tasks, &names, options.no_trunc, Utc::now());
    if options.quiet {
        for row in &rows {
            output.out(&row.id);
        }
        return Ok(());
    }
    output.out_raw(&Formatter::new(options.format.as_deref(), TASK_TABLE).render(&rows)?);
    Ok(())
}
