// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Task scheduler
//!
//! Named tasks are queued on a bounded channel and served by a fixed pool of
//! workers. Each job runs under its own deadline; the registry records the
//! `Queued -> Running -> Done` progression of every task and holds at most
//! one entry per name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kubernetes::ClusterApi;
use crate::pipeline::{Selection, SelectionError, SelectionPipeline};
use crate::policy::{MatchResult, Policy};

/// Default per-job wall time
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default job queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 2000;

/// Default worker pool size
pub const DEFAULT_WORKERS: usize = 4;

/// Extra time given to a job past its deadline to hand back partial results
const DEADLINE_GRACE: Duration = Duration::from_millis(500);

/// Executes the policy of one task until completion or `deadline`
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: &str, policy: &Policy, deadline: Instant) -> Result<Selection>;
}

#[async_trait]
impl<C: ClusterApi + ?Sized + 'static> TaskRunner for SelectionPipeline<C> {
    async fn run(&self, task: &str, policy: &Policy, deadline: Instant) -> Result<Selection> {
        SelectionPipeline::run(self, task, policy, deadline).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Done => write!(f, "done"),
        }
    }
}

/// How a finished task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every selector branch finished (individual branches may have failed)
    Completed,
    /// The run could not start selecting, e.g. discovery failed
    Failed,
    /// The deadline passed before the run finished
    TimedOut,
}

/// Terminal state of a task
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    pub matches: Vec<MatchResult>,
    pub errors: Vec<SelectionError>,
    pub elapsed: Duration,
}

/// A registry entry
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub status: TaskStatus,
    pub policy: Arc<Policy>,
    /// Set once the task is `Done`
    pub report: Option<TaskReport>,
}

/// Number of registry entries per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub task_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

struct Inner<R> {
    runner: Arc<R>,
    config: SchedulerConfig,
    registry: Mutex<HashMap<String, Task>>,
    sender: mpsc::Sender<String>,
    receiver: Arc<Mutex<mpsc::Receiver<String>>>,
}

/// Cheaply cloneable handle to the scheduler
pub struct Scheduler<R: TaskRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: TaskRunner> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: TaskRunner> Scheduler<R> {
    pub fn new(runner: Arc<R>, config: SchedulerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                runner,
                config,
                registry: Mutex::new(HashMap::new()),
                sender,
                receiver: Arc::new(Mutex::new(receiver)),
            }),
        }
    }

    /// Queue a task under `name`
    ///
    /// Returns false without doing anything when an entry with that name
    /// already exists, whatever its status. Waits for queue space when the
    /// queue is full.
    pub async fn submit(&self, name: &str, policy: Policy) -> bool {
        {
            let mut registry = self.inner.registry.lock().await;
            if registry.contains_key(name) {
                debug!(task = %name, "Task already registered, ignoring submit");
                return false;
            }
            registry.insert(
                name.to_string(),
                Task {
                    name: name.to_string(),
                    status: TaskStatus::Queued,
                    policy: Arc::new(policy),
                    report: None,
                },
            );
        }

        if self.inner.sender.send(name.to_string()).await.is_err() {
            self.inner.registry.lock().await.remove(name);
            warn!(task = %name, "Job queue closed, task dropped");
            return false;
        }

        debug!(task = %name, "Task queued");
        true
    }

    /// Snapshot of the registry entry for `name`
    pub async fn status_of(&self, name: &str) -> Option<Task> {
        self.inner.registry.lock().await.get(name).cloned()
    }

    /// Remove a finished task so its name can be submitted again
    ///
    /// Returns false when the task is unknown or not `Done` yet.
    pub async fn forget(&self, name: &str) -> bool {
        let mut registry = self.inner.registry.lock().await;
        match registry.get(name) {
            Some(task) if task.status == TaskStatus::Done => {
                registry.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Remove every finished task, returning how many were removed
    pub async fn prune_finished(&self) -> usize {
        let mut registry = self.inner.registry.lock().await;
        let before = registry.len();
        registry.retain(|_, task| task.status != TaskStatus::Done);
        before - registry.len()
    }

    pub async fn counts(&self) -> TaskCounts {
        let registry = self.inner.registry.lock().await;
        registry
            .values()
            .fold(TaskCounts::default(), |mut counts, task| {
                match task.status {
                    TaskStatus::Queued => counts.queued += 1,
                    TaskStatus::Running => counts.running += 1,
                    TaskStatus::Done => counts.done += 1,
                }
                counts
            })
    }

    /// Serve the queue with the configured number of workers until `shutdown`
    ///
    /// After cancellation workers stop dequeuing but finish the job they are
    /// running before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let workers = self.inner.config.workers.max(1);
        info!(
            workers,
            timeout_secs = self.inner.config.task_timeout.as_secs(),
            "Scheduler started"
        );

        let mut pool = JoinSet::new();
        for id in 0..workers {
            let scheduler = self.clone();
            let shutdown = shutdown.clone();
            pool.spawn(async move { scheduler.worker(id, shutdown).await });
        }

        while let Some(joined) = pool.join_next().await {
            joined.context("Scheduler worker panicked")?;
        }

        info!("Scheduler stopped");
        Ok(())
    }

    async fn worker(&self, id: usize, shutdown: CancellationToken) {
        debug!(worker = id, "Worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                name = async { self.inner.receiver.lock().await.recv().await } => name,
            };
            let Some(name) = next else {
                break;
            };

            self.execute(id, &name).await;

            if shutdown.is_cancelled() {
                break;
            }
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn execute(&self, worker: usize, name: &str) {
        let policy = {
            let mut registry = self.inner.registry.lock().await;
            let Some(task) = registry.get_mut(name) else {
                warn!(task = %name, "Dequeued task is not registered, skipping");
                return;
            };
            task.status = TaskStatus::Running;
            Arc::clone(&task.policy)
        };

        info!(task = %name, worker, action = ?policy.action(), "Task running");
        let start = Instant::now();
        let deadline = start + self.inner.config.task_timeout;

        let result = tokio::time::timeout_at(
            deadline + DEADLINE_GRACE,
            self.inner.runner.run(name, &policy, deadline),
        )
        .await;

        let report = match result {
            Ok(Ok(selection)) => TaskReport {
                outcome: if selection.timed_out {
                    TaskOutcome::TimedOut
                } else {
                    TaskOutcome::Completed
                },
                matches: selection.matches,
                errors: selection.errors,
                elapsed: start.elapsed(),
            },
            Ok(Err(e)) => TaskReport {
                outcome: TaskOutcome::Failed,
                matches: Vec::new(),
                errors: vec![SelectionError {
                    selector: None,
                    candidate: None,
                    message: format!("{:#}", e),
                }],
                elapsed: start.elapsed(),
            },
            Err(_) => TaskReport {
                outcome: TaskOutcome::TimedOut,
                matches: Vec::new(),
                errors: Vec::new(),
                elapsed: start.elapsed(),
            },
        };

        log_report(name, &report);

        let mut registry = self.inner.registry.lock().await;
        if let Some(task) = registry.get_mut(name) {
            task.status = TaskStatus::Done;
            task.report = Some(report);
        }
    }
}

fn log_report(name: &str, report: &TaskReport) {
    let elapsed_ms = report.elapsed.as_millis() as u64;
    match report.outcome {
        TaskOutcome::Completed => info!(
            task = %name,
            matches = report.matches.len(),
            errors = report.errors.len(),
            elapsed_ms,
            "Task done"
        ),
        TaskOutcome::Failed => warn!(task = %name, elapsed_ms, "Task failed"),
        TaskOutcome::TimedOut => warn!(
            task = %name,
            matches = report.matches.len(),
            elapsed_ms,
            "Task timed out"
        ),
    }

    for error in &report.errors {
        warn!(task = %name, error = %error, "Selection error");
    }
    for m in &report.matches {
        info!(task = %name, resource = %m.candidate, message = %m.message, "Resource matched");
    }
}
