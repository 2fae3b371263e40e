// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Cleaner reconciliation loop
//!
//! Periodically reads every Cleaner object, drops finished tasks from the
//! scheduler registry and submits one task per Cleaner. A Cleaner whose
//! previous run is still queued or running is skipped until the next resync.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kubernetes::KubeCluster;
use crate::policy::{Cleaner, Policy};
use crate::scheduler::{Scheduler, TaskRunner};

/// Source of Cleaner objects
#[async_trait]
pub trait CleanerSource: Send + Sync {
    async fn list_cleaners(&self) -> Result<Vec<Cleaner>>;
}

#[async_trait]
impl CleanerSource for KubeCluster {
    async fn list_cleaners(&self) -> Result<Vec<Cleaner>> {
        KubeCluster::list_cleaners(self).await
    }
}

#[async_trait]
impl<T: CleanerSource + ?Sized> CleanerSource for std::sync::Arc<T> {
    async fn list_cleaners(&self) -> Result<Vec<Cleaner>> {
        T::list_cleaners(self).await
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub submitted: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub pruned: usize,
}

pub struct Controller<S, R: TaskRunner> {
    source: S,
    scheduler: Scheduler<R>,
    interval: Duration,
}

impl<S: CleanerSource, R: TaskRunner> Controller<S, R> {
    pub fn new(source: S, scheduler: Scheduler<R>, interval: Duration) -> Self {
        Self {
            source,
            scheduler,
            interval,
        }
    }

    /// Run one reconciliation pass
    pub async fn resync(&self) -> Result<ResyncSummary> {
        let mut summary = ResyncSummary {
            pruned: self.scheduler.prune_finished().await,
            ..Default::default()
        };

        for cleaner in self.source.list_cleaners().await? {
            let name = cleaner.name();
            let policy = match Policy::from_spec(&cleaner.spec) {
                Ok(policy) => policy,
                Err(e) => {
                    warn!(cleaner = %name, error = %e, "Invalid cleaner, skipping");
                    summary.invalid += 1;
                    continue;
                }
            };

            if self.scheduler.submit(name, policy).await {
                summary.submitted += 1;
            } else {
                debug!(cleaner = %name, "Previous run still pending");
                summary.skipped += 1;
            }
        }

        Ok(summary)
    }

    /// Reconcile every interval until `shutdown` fires
    ///
    /// A resync in progress is abandoned on shutdown, including one waiting
    /// for queue space.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let resync = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            debug!("Resync interrupted by shutdown");
                            break;
                        }
                        resync = self.resync() => resync,
                    };
                    match resync {
                        Ok(summary) => {
                            let counts = self.scheduler.counts().await;
                            info!(
                                submitted = summary.submitted,
                                skipped = summary.skipped,
                                invalid = summary.invalid,
                                pruned = summary.pruned,
                                queued = counts.queued,
                                running = counts.running,
                                "Resync complete"
                            );
                        }
                        Err(e) => warn!(error = %e, "Resync failed"),
                    }
                }
            }
        }

        debug!("Controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Selection;
    use crate::policy::{CleanerMetadata, CleanerSpec, ResourcePolicySet, ResourceSelector};
    use crate::scheduler::{SchedulerConfig, TaskStatus};
    use std::sync::Arc;
    use tokio::time::Instant;

    struct StaticSource(Vec<Cleaner>);

    #[async_trait]
    impl CleanerSource for StaticSource {
        async fn list_cleaners(&self) -> Result<Vec<Cleaner>> {
            Ok(self.0.clone())
        }
    }

    struct NoopRunner;

    #[async_trait]
    impl TaskRunner for NoopRunner {
        async fn run(&self, _task: &str, _policy: &Policy, _deadline: Instant) -> Result<Selection> {
            Ok(Selection::default())
        }
    }

    fn cleaner(name: &str, selectors: Vec<ResourceSelector>) -> Cleaner {
        Cleaner {
            api_version: "cleany.wys1203.com/v1alpha1".to_string(),
            kind: "Cleaner".to_string(),
            metadata: CleanerMetadata {
                name: name.to_string(),
            },
            spec: CleanerSpec {
                resource_policy_set: ResourcePolicySet {
                    resource_selectors: selectors,
                    aggregated_selection: None,
                },
                ..Default::default()
            },
        }
    }

    fn configmaps() -> ResourceSelector {
        ResourceSelector {
            namespace: Some("ns-a".to_string()),
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resync_submits_valid_cleaners() {
        let scheduler = Scheduler::new(Arc::new(NoopRunner), SchedulerConfig::default());
        let source = StaticSource(vec![
            cleaner("valid", vec![configmaps()]),
            cleaner("empty", vec![]),
        ]);
        let controller = Controller::new(source, scheduler.clone(), Duration::from_secs(60));

        let summary = controller.resync().await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.invalid, 1);
        assert_eq!(
            scheduler.status_of("valid").await.unwrap().status,
            TaskStatus::Queued
        );
        assert!(scheduler.status_of("empty").await.is_none());

        // Still queued, so the second pass skips it
        let summary = controller.resync().await.unwrap();
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resync_resubmits_finished_cleaners() {
        let scheduler = Scheduler::new(Arc::new(NoopRunner), SchedulerConfig::default());
        let source = StaticSource(vec![cleaner("valid", vec![configmaps()])]);
        let controller = Controller::new(source, scheduler.clone(), Duration::from_secs(60));
        assert_eq!(controller.resync().await.unwrap().submitted, 1);

        let shutdown = CancellationToken::new();
        let serving = tokio::spawn({
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.counts().await.done != 1 {
            assert!(Instant::now() < deadline, "task never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let summary = controller.resync().await.unwrap();
        assert_eq!(summary.pruned, 1);
        assert_eq!(summary.submitted, 1);

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let scheduler = Scheduler::new(Arc::new(NoopRunner), SchedulerConfig::default());
        let source = StaticSource(vec![cleaner("valid", vec![configmaps()])]);
        let controller = Controller::new(source, scheduler.clone(), Duration::from_secs(3600));

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        controller.run(shutdown).await.unwrap();
        // First tick fires immediately
        assert!(scheduler.status_of("valid").await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_resync_on_full_queue() {
        let config = SchedulerConfig {
            queue_capacity: 1,
            ..Default::default()
        };
        // No workers are serving, so the second submit waits for queue space
        let scheduler = Scheduler::new(Arc::new(NoopRunner), config);
        let source = StaticSource(vec![
            cleaner("first", vec![configmaps()]),
            cleaner("second", vec![configmaps()]),
            cleaner("third", vec![configmaps()]),
        ]);
        let controller = Controller::new(source, scheduler.clone(), Duration::from_secs(3600));

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), controller.run(shutdown))
            .await
            .expect("controller did not stop")
            .unwrap();
        assert!(scheduler.status_of("first").await.is_some());
        assert!(scheduler.status_of("third").await.is_none());
    }

    #[tokio::test]
    async fn test_resync_skips_undecodable_cleaners() {
        let scheduler = Scheduler::new(Arc::new(NoopRunner), SchedulerConfig::default());
        let source = StaticSource(Cleaner::decode_all(vec![
            serde_json::json!({
                "metadata": {"name": "valid"},
                "spec": {"resourcePolicySet": {"resourceSelectors": [
                    {"namespace": "ns-a", "version": "v1", "kind": "ConfigMap"}
                ]}}
            }),
            serde_json::json!({"metadata": {"name": "broken"}, "spec": 42}),
        ]));
        let controller = Controller::new(source, scheduler.clone(), Duration::from_secs(60));

        let summary = controller.resync().await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert!(scheduler.status_of("valid").await.is_some());
        assert!(scheduler.status_of("broken").await.is_none());
    }
}
