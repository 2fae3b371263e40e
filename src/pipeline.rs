// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Selection pipeline
//!
//! For every selector of a policy: resolve the resource type, compile the
//! label and namespace filters, list candidates and evaluate the selector
//! script on each of them. Selectors run as concurrent branches whose
//! outcomes are merged by a single collector, so a failing branch only loses
//! its own results. Script evaluation runs on the blocking pool, one fresh
//! interpreter per candidate.

use anyhow::{Result, anyhow};
use futures::stream::{self, FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::evaluator::Evaluator;
use crate::kubernetes::label_selectors::{label_filter, namespace_filter};
use crate::kubernetes::{ApiFilters, ClusterApi, NamespaceInfo, ResourceRegistry};
use crate::policy::{Candidate, MatchResult, Policy, ResourceSelector};
use crate::progress::ProgressHandle;

/// Default number of candidates evaluated in parallel per selector
pub const DEFAULT_EVALUATION_CONCURRENCY: usize = 8;

/// A failure that cost part of a selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionError {
    /// Index of the selector in the policy, `None` for policy-level failures
    pub selector: Option<usize>,
    /// Candidate the failure is about, `None` when a whole branch was aborted
    pub candidate: Option<String>,
    pub message: String,
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.selector, &self.candidate) {
            (Some(idx), Some(candidate)) => {
                write!(f, "selector #{} ({}): {}", idx, candidate, self.message)
            }
            (Some(idx), None) => write!(f, "selector #{}: {}", idx, self.message),
            (None, _) => write!(f, "{}", self.message),
        }
    }
}

/// Aggregated outcome of one selection run
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Matched resources, in no particular order
    pub matches: Vec<MatchResult>,
    pub errors: Vec<SelectionError>,
    /// True when the deadline passed before every branch finished
    pub timed_out: bool,
}

/// Namespaces of the cluster, or why they could not be listed
type NamespaceListing = std::result::Result<Vec<NamespaceInfo>, String>;

/// Outcome of one selector branch
struct BranchOutcome {
    matches: Vec<MatchResult>,
    errors: Vec<SelectionError>,
}

pub struct SelectionPipeline<C: ClusterApi + ?Sized> {
    cluster: Arc<C>,
    evaluator: Evaluator,
    evaluation_concurrency: usize,
    progress: Option<ProgressHandle>,
}

impl<C: ClusterApi + ?Sized> SelectionPipeline<C> {
    pub fn new(cluster: Arc<C>, evaluator: Evaluator) -> Self {
        Self {
            cluster,
            evaluator,
            evaluation_concurrency: DEFAULT_EVALUATION_CONCURRENCY,
            progress: None,
        }
    }

    pub fn with_evaluation_concurrency(mut self, concurrency: usize) -> Self {
        self.evaluation_concurrency = concurrency.max(1);
        self
    }

    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run every selector of `policy` until completion or `deadline`
    ///
    /// Only a discovery failure aborts the run. A namespace listing failure
    /// aborts the selectors that need namespace labels; branch and candidate
    /// failures are collected in [`Selection::errors`]. A resource matched by
    /// several selectors is reported once. When the deadline passes, results
    /// of the branches that already finished are returned with `timed_out` set.
    pub async fn run(&self, task: &str, policy: &Policy, deadline: Instant) -> Result<Selection> {
        let start = Instant::now();
        let selectors = policy.selectors();
        if let Some(progress) = &self.progress {
            progress.selection_started(task, selectors.len());
        }

        let registry = self.cluster.discover().await?;
        let needs_namespaces = selectors
            .iter()
            .any(|s| s.namespace_expression().is_some());
        let namespaces: NamespaceListing = if needs_namespaces {
            self.cluster.list_namespaces().await.map_err(|e| {
                warn!(task = %task, error = %e, "Namespace listing failed");
                format!("{:#}", e)
            })
        } else {
            Ok(Vec::new())
        };

        let mut branches: FuturesUnordered<_> = selectors
            .iter()
            .enumerate()
            .map(|(index, selector)| {
                self.run_selector(task, index, selector, &registry, &namespaces)
            })
            .collect();

        let mut selection = Selection::default();
        let mut seen = HashSet::new();
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                biased;
                outcome = branches.next() => match outcome {
                    Some(outcome) => {
                        selection.matches.extend(
                            outcome
                                .matches
                                .into_iter()
                                .filter(|m| seen.insert(m.candidate.key())),
                        );
                        selection.errors.extend(outcome.errors);
                    }
                    None => break,
                },
                _ = &mut expired => {
                    warn!(
                        task = %task,
                        pending = branches.len(),
                        "Deadline exceeded, abandoning unfinished selectors"
                    );
                    selection.timed_out = true;
                    break;
                }
            }
        }
        drop(branches);

        if let Some(script) = policy.aggregated_selection() {
            self.apply_aggregated_selection(task, script, &mut selection)
                .await;
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if let Some(progress) = &self.progress {
            progress.selection_complete(task, selection.matches.len(), elapsed_ms);
        }
        debug!(
            task = %task,
            matches = selection.matches.len(),
            errors = selection.errors.len(),
            elapsed_ms,
            "Selection complete"
        );

        Ok(selection)
    }

    async fn run_selector(
        &self,
        task: &str,
        index: usize,
        selector: &ResourceSelector,
        registry: &ResourceRegistry,
        namespaces: &NamespaceListing,
    ) -> BranchOutcome {
        let start = Instant::now();

        let candidates = match self.fetch(selector, registry, namespaces).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(
                    task = %task,
                    selector = index,
                    kind = %selector.kind,
                    error = %e,
                    "Selector aborted"
                );
                if let Some(progress) = &self.progress {
                    progress.selector_failed(task, &selector.kind, &e.to_string());
                }
                return BranchOutcome {
                    matches: Vec::new(),
                    errors: vec![SelectionError {
                        selector: Some(index),
                        candidate: None,
                        message: format!("{:#}", e),
                    }],
                };
            }
        };

        let candidate_count = candidates.len();
        let outcome = self.evaluate_all(task, index, selector, candidates).await;

        if let Some(progress) = &self.progress {
            progress.selector_complete(
                task,
                &selector.kind,
                candidate_count,
                outcome.matches.len(),
                start.elapsed().as_millis() as u64,
            );
        }
        debug!(
            task = %task,
            selector = index,
            kind = %selector.kind,
            candidates = candidate_count,
            matches = outcome.matches.len(),
            "Selector complete"
        );

        outcome
    }

    /// Resolve, compile and list the candidates of one selector
    async fn fetch(
        &self,
        selector: &ResourceSelector,
        registry: &ResourceRegistry,
        namespaces: &NamespaceListing,
    ) -> Result<Vec<Candidate>> {
        let Some(resource) = registry.resolve(&selector.group, &selector.version, &selector.kind)
        else {
            info!(
                group = %selector.group,
                version = %selector.version,
                kind = %selector.kind,
                "No resource mapping, selector yields no candidates"
            );
            return Ok(Vec::new());
        };

        let filters = ApiFilters {
            label_selector: label_filter(&selector.label_filters),
        };

        if !resource.is_namespaced() {
            return self.cluster.list(resource, None, &filters).await;
        }

        // One namespaced list call per target namespace
        let known: &[NamespaceInfo] = match namespaces {
            Ok(namespaces) => namespaces,
            Err(e) if selector.namespace_expression().is_some() => {
                return Err(anyhow!("Failed to list namespaces: {}", e));
            }
            Err(_) => &[],
        };
        let targets: BTreeSet<String> = namespace_filter(selector, known)?;
        if targets.is_empty() {
            debug!(kind = %selector.kind, "Selector targets no namespace");
            return Ok(Vec::new());
        }

        let lists = futures::future::try_join_all(
            targets
                .iter()
                .map(|ns| self.cluster.list(resource, Some(ns), &filters)),
        )
        .await?;

        Ok(lists.into_iter().flatten().collect())
    }

    async fn evaluate_all(
        &self,
        task: &str,
        index: usize,
        selector: &ResourceSelector,
        candidates: Vec<Candidate>,
    ) -> BranchOutcome {
        let Some(script) = selector.script() else {
            return BranchOutcome {
                matches: candidates
                    .into_iter()
                    .map(|candidate| MatchResult {
                        candidate,
                        matched: true,
                        message: String::new(),
                    })
                    .collect(),
                errors: Vec::new(),
            };
        };

        let script: Arc<str> = Arc::from(script);
        let evaluator = self.evaluator;

        let verdicts: Vec<(String, Result<MatchResult, String>)> = stream::iter(candidates)
            .map(|candidate| {
                let script = Arc::clone(&script);
                async move {
                    let identity = candidate.identity();
                    let verdict = tokio::task::spawn_blocking(move || {
                        evaluator
                            .evaluate(&candidate, Some(&*script))
                            .map_err(|e| e.to_string())
                    })
                    .await
                    .unwrap_or_else(|e| Err(format!("evaluation task failed: {}", e)));
                    (identity, verdict)
                }
            })
            .buffer_unordered(self.evaluation_concurrency)
            .collect()
            .await;

        let mut outcome = BranchOutcome {
            matches: Vec::new(),
            errors: Vec::new(),
        };
        for (identity, verdict) in verdicts {
            match verdict {
                Ok(result) if result.matched => outcome.matches.push(result),
                Ok(_) => {}
                Err(message) => {
                    warn!(
                        task = %task,
                        selector = index,
                        candidate = %identity,
                        error = %message,
                        "Evaluation failed, skipping candidate"
                    );
                    outcome.errors.push(SelectionError {
                        selector: Some(index),
                        candidate: Some(identity),
                        message,
                    });
                }
            }
        }
        outcome
    }

    /// Filter the merged matches through the policy-level script
    ///
    /// On failure, or when the deadline cut the selection short, the match
    /// set is emptied: a partial or unfiltered set must not reach the action.
    async fn apply_aggregated_selection(&self, task: &str, script: &str, selection: &mut Selection) {
        if selection.timed_out {
            selection.matches.clear();
            selection.errors.push(SelectionError {
                selector: None,
                candidate: None,
                message: "aggregated selection skipped: deadline exceeded".to_string(),
            });
            return;
        }

        let evaluator = self.evaluator;
        let script = script.to_string();
        let matches = std::mem::take(&mut selection.matches);
        let result = tokio::task::spawn_blocking(move || {
            evaluator
                .aggregate(&script, matches)
                .map_err(|e| e.to_string())
        })
        .await
        .unwrap_or_else(|e| Err(format!("evaluation task failed: {}", e)));

        match result {
            Ok(kept) => selection.matches = kept,
            Err(message) => {
                warn!(task = %task, error = %message, "Aggregated selection failed");
                selection.errors.push(SelectionError {
                    selector: None,
                    candidate: None,
                    message: format!("aggregated selection failed: {}", message),
                });
            }
        }
    }
}
