// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Progress reporting for selection runs
//!
//! The selection pipeline reports per-selector progress here, which the scan
//! command displays with a spinner.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Create a spinner with consistent styling
pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg} {elapsed:.dim}")
    {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Progress update message
#[derive(Clone, Debug)]
pub enum ProgressUpdate {
    /// A task started selecting resources
    SelectionStarted { task: String, selectors: usize },
    /// One selector branch finished
    SelectorComplete {
        task: String,
        kind: String,
        candidates: usize,
        matches: usize,
        elapsed_ms: u64,
    },
    /// One selector branch was aborted
    SelectorFailed {
        task: String,
        kind: String,
        error: String,
    },
    /// All selector branches finished (or the deadline passed)
    SelectionComplete {
        task: String,
        matches: usize,
        elapsed_ms: u64,
    },
}

/// Progress reporter shared by the pipeline and its observers
pub struct ProgressReporter {
    sender: broadcast::Sender<ProgressUpdate>,
    /// Count of finished selectors for the current run
    selectors_done: AtomicUsize,
    /// Total selectors for the current run
    selectors_total: AtomicUsize,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            sender,
            selectors_done: AtomicUsize::new(0),
            selectors_total: AtomicUsize::new(0),
        }
    }

    /// Subscribe to progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    /// Report selection start
    pub fn selection_started(&self, task: &str, selectors: usize) {
        self.selectors_done.store(0, Ordering::SeqCst);
        self.selectors_total.store(selectors, Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::SelectionStarted {
            task: task.to_string(),
            selectors,
        });
    }

    pub fn selector_complete(
        &self,
        task: &str,
        kind: &str,
        candidates: usize,
        matches: usize,
        elapsed_ms: u64,
    ) {
        self.selectors_done.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::SelectorComplete {
            task: task.to_string(),
            kind: kind.to_string(),
            candidates,
            matches,
            elapsed_ms,
        });
    }

    pub fn selector_failed(&self, task: &str, kind: &str, error: &str) {
        self.selectors_done.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::SelectorFailed {
            task: task.to_string(),
            kind: kind.to_string(),
            error: error.to_string(),
        });
    }

    pub fn selection_complete(&self, task: &str, matches: usize, elapsed_ms: u64) {
        let _ = self.sender.send(ProgressUpdate::SelectionComplete {
            task: task.to_string(),
            matches,
            elapsed_ms,
        });
    }

    /// Get current progress (done/total)
    pub fn progress(&self) -> (usize, usize) {
        (
            self.selectors_done.load(Ordering::SeqCst),
            self.selectors_total.load(Ordering::SeqCst),
        )
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to progress reporter
pub type ProgressHandle = Arc<ProgressReporter>;

/// Create a new progress reporter handle
pub fn create_progress_handle() -> ProgressHandle {
    Arc::new(ProgressReporter::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_reporter_default() {
        let reporter = ProgressReporter::default();
        assert_eq!(reporter.progress(), (0, 0));
    }

    #[test]
    fn test_selector_updates_increment() {
        let reporter = ProgressReporter::new();
        reporter.selection_started("cleaner-a", 3);
        assert_eq!(reporter.progress(), (0, 3));

        reporter.selector_complete("cleaner-a", "ConfigMap", 5, 2, 10);
        reporter.selector_failed("cleaner-a", "Secret", "forbidden");
        assert_eq!(reporter.progress(), (2, 3));
    }

    #[test]
    fn test_selection_started_resets_counters() {
        let reporter = ProgressReporter::new();
        reporter.selection_started("a", 2);
        reporter.selector_complete("a", "Pod", 1, 1, 1);

        reporter.selection_started("b", 4);
        assert_eq!(reporter.progress(), (0, 4));
    }

    #[test]
    fn test_subscribe_receives_updates() {
        let reporter = create_progress_handle();
        let mut receiver = reporter.subscribe();

        reporter.selection_started("cleaner-a", 1);
        reporter.selector_complete("cleaner-a", "ConfigMap", 3, 3, 20);
        reporter.selection_complete("cleaner-a", 3, 25);

        let updates: Vec<_> = std::iter::from_fn(|| receiver.try_recv().ok()).collect();
        assert_eq!(updates.len(), 3);
        assert!(matches!(
            &updates[0],
            ProgressUpdate::SelectionStarted { task, selectors: 1 } if task == "cleaner-a"
        ));
        assert!(matches!(
            updates[1],
            ProgressUpdate::SelectorComplete {
                candidates: 3,
                matches: 3,
                ..
            }
        ));
        assert!(matches!(
            updates[2],
            ProgressUpdate::SelectionComplete { matches: 3, .. }
        ));
    }
}
