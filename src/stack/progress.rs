//! Waiting for services to converge

use super::Output;
use crate::engine::{EngineApi, Filters};
use crate::error::{Result, StackError};
use crate::swarm::service::update_states;
use crate::swarm::{Service, Task, TaskState};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Polling behaviour while waiting on a service
#[derive(Debug, Clone)]
pub struct ProgressOptions {
    pub poll_interval: Duration,
    /// How long a converged service must stay converged
    pub stability: Duration,
    /// Give up after this long
    pub timeout: Option<Duration>,
}

impl Default for ProgressOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            stability: Duration::from_secs(5),
            timeout: None,
        }
    }
}

/// Snapshot of a service rollout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convergence {
    pub running: u64,
    pub desired: u64,
    pub update_done: bool,
}

impl Convergence {
    pub fn converged(&self) -> bool {
        self.update_done && self.running == self.desired
    }
}

/// Fail when the update paused or rolled back
fn check_update_state(service: &Service) -> Result<bool> {
    let Some(status) = &service.update_status else {
        return Ok(true);
    };
    match status.state.as_str() {
        update_states::PAUSED => Err(StackError::Precondition(format!(
            "service update paused: {}",
            status.message
        ))),
        update_states::ROLLBACK_PAUSED => Err(StackError::Precondition(format!(
            "service rollback paused: {}",
            status.message
        ))),
        update_states::ROLLBACK_COMPLETED => Err(StackError::Precondition(format!(
            "service rolled back: {}",
            status.message
        ))),
        update_states::UPDATING | update_states::ROLLBACK_STARTED => Ok(false),
        _ => Ok(true),
    }
}

/// Count running tasks against the desired count for the service mode
pub fn convergence(service: &Service, tasks: &[Task], update_done: bool) -> Convergence {
    let active: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.desired_state == TaskState::Running)
        .collect();

    let desired = match service
        .spec
        .mode
        .as_ref()
        .and_then(|m| m.replicated.as_ref())
    {
        Some(replicated) => replicated.replicas.unwrap_or(1),
        None if service.spec.mode.as_ref().is_some_and(|m| m.global.is_some()) => {
            active.len() as u64
        }
        None => 1,
    };

    // One task per slot; the newest task in a slot wins
    let mut slots: BTreeMap<String, &Task> = BTreeMap::new();
    for task in active {
        let key = match task.slot {
            Some(slot) => slot.to_string(),
            None => task.node_id.clone().unwrap_or_else(|| task.id.clone()),
        };
        let newer = slots
            .get(&key)
            .map(|other| task.version.index > other.version.index)
            .unwrap_or(true);
        if newer {
            slots.insert(key, task);
        }
    }
    let running = slots
        .values()
        .filter(|t| t.status.state == TaskState::Running)
        .count() as u64;

    Convergence {
        running,
        desired,
        update_done,
    }
}

/// Poll a service until its tasks converge
///
/// Unless `quiet`, progress lines go to standard output.
pub async fn wait_on_service<E: EngineApi + ?Sized>(
    engine: &E,
    service_id: &str,
    quiet: bool,
    options: &ProgressOptions,
    output: &Output,
) -> Result<()> {
    let started = Instant::now();
    let mut converged_since: Option<Instant> = None;
    let mut last: Option<Convergence> = None;
    let mut errors_seen: BTreeMap<String, String> = BTreeMap::new();

    loop {
        let service = engine.service_inspect(service_id).await?;
        let update_done = check_update_state(&service)?;
        let tasks = engine
            .task_list(&Filters::new().with("service", service.id.clone()))
            .await?;
        let progress = convergence(&service, &tasks, update_done);

        if !quiet {
            if last.as_ref() != Some(&progress) {
                output.out(format!(
                    "{}: overall progress: {} out of {} tasks",
                    service.spec.name, progress.running, progress.desired
                ));
            }
            for task in &tasks {
                if let Some(err) = task.status.err.as_deref().filter(|e| !e.is_empty()) {
                    if errors_seen.insert(task.id.clone(), err.to_string()).is_none() {
                        output.out(format!("{}: task {}: {}", service.spec.name, task.id, err));
                    }
                }
            }
        }
        debug!(
            service = %service.spec.name,
            running = progress.running,
            desired = progress.desired,
            "service progress"
        );

        if progress.converged() {
            let since = *converged_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= options.stability {
                if !quiet {
                    output.out(format!("{}: verify: Service converged", service.spec.name));
                }
                return Ok(());
            }
        } else {
            converged_since = None;
        }
        last = Some(progress);

        if let Some(timeout) = options.timeout {
            if started.elapsed() >= timeout {
                return Err(StackError::Precondition(format!(
                    "timed out waiting for service {} to converge",
                    service.spec.name
                )));
            }
        }
        sleep(options.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::swarm::service::{ServiceMode, UpdateStatus};
    use crate::swarm::task::TaskStatus;
    use crate::swarm::{ObjectVersion, ServiceSpec};

    fn task(id: &str, slot: u64, state: TaskState, version: u64) -> Task {
        Task {
            id: id.to_string(),
            version: ObjectVersion { index: version },
            service_id: "svc".to_string(),
            slot: Some(slot),
            desired_state: TaskState::Running,
            status: TaskStatus {
                state,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn service(replicas: u64) -> Service {
        Service {
            id: "svc".to_string(),
            spec: ServiceSpec {
                name: "s_web".to_string(),
                mode: Some(ServiceMode::replicated(Some(replicas))),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fast() -> ProgressOptions {
        ProgressOptions {
            poll_interval: Duration::from_millis(5),
            stability: Duration::ZERO,
            timeout: Some(Duration::from_millis(200)),
        }
    }

    #[test]
    fn test_convergence_counts_newest_task_per_slot() {
        let tasks = vec![
            task("old", 1, TaskState::Running, 1),
            task("new", 1, TaskState::Starting, 2),
            task("b", 2, TaskState::Running, 1),
        ];
        let progress = convergence(&service(2), &tasks, true);
        assert_eq!(progress.running, 1);
        assert_eq!(progress.desired, 2);
        assert!(!progress.converged());
    }

    #[test]
    fn test_update_states() {
        let mut svc = service(1);
        assert!(check_update_state(&svc).unwrap());
        svc.update_status = Some(UpdateStatus {
            state: "updating".to_string(),
            message: String::new(),
        });
        assert!(!check_update_state(&svc).unwrap());
        svc.update_status = Some(UpdateStatus {
            state: "rollback_completed".to_string(),
            message: "task failed".to_string(),
        });
        let err = check_update_state(&svc).unwrap_err();
        assert_eq!(err.to_string(), "service rolled back: task failed");
        svc.update_status = Some(UpdateStatus {
            state: "paused".to_string(),
            message: "x".to_string(),
        });
        assert!(check_update_state(&svc).is_err());
    }

    #[tokio::test]
    async fn test_wait_reports_convergence() {
        let engine = FakeEngine::new();
        engine.state().services.push(service(1));
        engine.state().tasks.push(task("t1", 1, TaskState::Running, 1));
        let (output, out, _) = Output::capture();
        wait_on_service(&engine, "svc", false, &fast(), &output)
            .await
            .unwrap();
        let lines = out.lines();
        assert_eq!(lines[0], "s_web: overall progress: 1 out of 1 tasks");
        assert_eq!(lines.last().unwrap(), "s_web: verify: Service converged");
    }

    #[tokio::test]
    async fn test_wait_quiet_times_out() {
        let engine = FakeEngine::new();
        engine.state().services.push(service(2));
        engine.state().tasks.push(task("t1", 1, TaskState::Running, 1));
        let (output, out, _) = Output::capture();
        let err = wait_on_service(&engine, "svc", true, &fast(), &output)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(out.contents().is_empty());
    }
}
