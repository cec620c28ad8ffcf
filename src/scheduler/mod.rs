//! Bounded-concurrency execution of work items.
//!
//! Every item goes through two stages, generation then review. The scheduler
//! decides how items overlap:
//!
//! - `Sequential`: one item at a time, both stages
//! - `Parallel`: up to `max_concurrency` items, each running both stages
//! - `Pipeline`: generation runs one item at a time and hands off through a
//!   bounded queue to up to `max_concurrency` concurrent reviews
//!
//! Whatever the mode, each submitted item yields exactly one terminal report
//! (unless the batch is cancelled first) and the progress callback fires once
//! per report with a monotonically increasing `current`.

mod runner;

pub use runner::Scheduler;

use crate::state::{WorkItem, WorkItemStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    Sequential,
    #[default]
    Parallel,
    Pipeline,
}

impl ScheduleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleMode::Sequential => "sequential",
            ScheduleMode::Parallel => "parallel",
            ScheduleMode::Pipeline => "pipeline",
        }
    }
}

impl std::fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(ScheduleMode::Sequential),
            "parallel" => Ok(ScheduleMode::Parallel),
            "pipeline" => Ok(ScheduleMode::Pipeline),
            other => anyhow::bail!(
                "Invalid schedule mode '{}'. Valid modes: sequential, parallel, pipeline",
                other
            ),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub mode: ScheduleMode,
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::Parallel,
            max_concurrency: 3,
        }
    }
}

/// The final state of one item after both stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub item: WorkItem,
    /// Whether the recovery path ran for this item.
    pub recovered: bool,
}

impl ItemReport {
    pub fn new(item: WorkItem) -> Self {
        Self {
            item,
            recovered: false,
        }
    }

    pub(crate) fn panicked(mut item: WorkItem) -> Self {
        item.fail("worker panicked");
        Self::new(item)
    }

    pub fn is_success(&self) -> bool {
        self.item.status == WorkItemStatus::Complete
    }
}

/// Result of the generation stage.
#[derive(Debug, Clone)]
pub enum Handoff {
    /// Generated; continue with review.
    Review(WorkItem),
    /// Finished early, e.g. the generation call failed for good.
    Done(ItemReport),
}

/// Per-item work the scheduler drives.
#[async_trait]
pub trait ItemStages: Send + Sync {
    async fn generate(&self, item: WorkItem, cancel: &CancellationToken) -> Handoff;

    /// Review and fix until the item reaches a terminal state.
    async fn review(&self, item: WorkItem, cancel: &CancellationToken) -> ItemReport;
}

/// Called once per finished item with (report, current, total).
pub type ProgressFn = Arc<dyn Fn(&ItemReport, usize, usize) + Send + Sync>;

/// Everything a batch produced.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Items that reached a terminal state, in completion order.
    pub reports: Vec<ItemReport>,
    /// Items left unfinished because the batch was cancelled.
    pub unfinished: Vec<WorkItem>,
    pub cancelled: bool,
}

impl BatchResult {
    pub fn completed(&self) -> Vec<&str> {
        self.paths_where(|r| r.item.status == WorkItemStatus::Complete)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.paths_where(|r| r.item.status == WorkItemStatus::Error)
    }

    fn paths_where(&self, pred: impl Fn(&ItemReport) -> bool) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| pred(r))
            .map(|r| r.item.path.as_str())
            .collect()
    }
}
