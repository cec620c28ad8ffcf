use super::{
    BatchResult, Handoff, ItemReport, ItemStages, ProgressFn, ScheduleMode, SchedulerConfig,
};
use crate::state::WorkItem;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs batches of work items in the configured mode.
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    progress: Option<ProgressFn>,
}

/// Counts finished items and fires progress in completion order.
struct Tally {
    total: usize,
    current: usize,
    progress: Option<ProgressFn>,
    result: BatchResult,
}

impl Tally {
    fn new(total: usize, progress: Option<ProgressFn>) -> Self {
        Self {
            total,
            current: 0,
            progress,
            result: BatchResult::default(),
        }
    }

    fn finish(&mut self, mut report: ItemReport, cancel: &CancellationToken) {
        if !report.item.status.is_terminal() {
            if cancel.is_cancelled() {
                self.result.unfinished.push(report.item);
                return;
            }
            tracing::error!(path = %report.item.path, status = %report.item.status, "Stage returned a non-terminal item");
            report.item.fail("item did not reach a terminal state");
        }
        self.current += 1;
        tracing::debug!(
            path = %report.item.path,
            status = %report.item.status,
            current = self.current,
            total = self.total,
            "Item finished"
        );
        if let Some(progress) = &self.progress {
            progress(&report, self.current, self.total);
        }
        self.result.reports.push(report);
    }

    fn skip(&mut self, item: WorkItem) {
        self.result.unfinished.push(item);
    }

    fn into_result(mut self, cancel: &CancellationToken) -> BatchResult {
        self.result.cancelled = cancel.is_cancelled();
        self.result
    }
}

async fn guarded_generate(
    stages: &dyn ItemStages,
    item: WorkItem,
    cancel: &CancellationToken,
) -> Handoff {
    let fallback = item.clone();
    match AssertUnwindSafe(stages.generate(item, cancel))
        .catch_unwind()
        .await
    {
        Ok(handoff) => handoff,
        Err(_) => {
            tracing::error!(path = %fallback.path, "Generation stage panicked");
            Handoff::Done(ItemReport::panicked(fallback))
        }
    }
}

async fn guarded_review(
    stages: &dyn ItemStages,
    item: WorkItem,
    cancel: &CancellationToken,
) -> ItemReport {
    let fallback = item.clone();
    match AssertUnwindSafe(stages.review(item, cancel))
        .catch_unwind()
        .await
    {
        Ok(report) => report,
        Err(_) => {
            tracing::error!(path = %fallback.path, "Review stage panicked");
            ItemReport::panicked(fallback)
        }
    }
}

async fn run_item(stages: &dyn ItemStages, item: WorkItem, cancel: &CancellationToken) -> ItemReport {
    match guarded_generate(stages, item, cancel).await {
        Handoff::Done(report) => report,
        Handoff::Review(item) => guarded_review(stages, item, cancel).await,
    }
}

enum Slot {
    Finished(ItemReport),
    Skipped(WorkItem),
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    /// Run every item through both stages.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        stages: Arc<dyn ItemStages>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        tracing::info!(
            mode = %self.config.mode,
            items = items.len(),
            max_concurrency = self.concurrency(),
            "Scheduling batch"
        );
        let tally = Tally::new(items.len(), self.progress.clone());
        let tally = match self.config.mode {
            ScheduleMode::Sequential => self.run_sequential(items, stages, cancel, tally).await,
            ScheduleMode::Parallel => self.run_parallel(items, stages, cancel, tally).await,
            ScheduleMode::Pipeline => self.run_pipeline(items, stages, cancel, tally).await,
        };
        tally.into_result(cancel)
    }

    async fn run_sequential(
        &self,
        items: Vec<WorkItem>,
        stages: Arc<dyn ItemStages>,
        cancel: &CancellationToken,
        mut tally: Tally,
    ) -> Tally {
        for item in items {
            if cancel.is_cancelled() {
                tally.skip(item);
                continue;
            }
            let report = run_item(stages.as_ref(), item, cancel).await;
            tally.finish(report, cancel);
        }
        tally
    }

    async fn run_parallel(
        &self,
        items: Vec<WorkItem>,
        stages: Arc<dyn ItemStages>,
        cancel: &CancellationToken,
        mut tally: Tally,
    ) -> Tally {
        let semaphore = Arc::new(Semaphore::new(self.concurrency()));
        let mut workers: JoinSet<Slot> = JoinSet::new();

        for item in items {
            let semaphore = semaphore.clone();
            let stages = stages.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Slot::Skipped(item);
                };
                if cancel.is_cancelled() {
                    return Slot::Skipped(item);
                }
                Slot::Finished(run_item(stages.as_ref(), item, &cancel).await)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Slot::Finished(report)) => tally.finish(report, cancel),
                Ok(Slot::Skipped(item)) => tally.skip(item),
                Err(e) => tracing::error!(error = %e, "Worker task failed"),
            }
        }
        tally
    }

    async fn run_pipeline(
        &self,
        items: Vec<WorkItem>,
        stages: Arc<dyn ItemStages>,
        cancel: &CancellationToken,
        mut tally: Tally,
    ) -> Tally {
        let capacity = self.concurrency();
        // One permit per item from the start of generation to the end of its
        // review, so generating, queued and reviewing items never exceed the bound.
        let semaphore = Arc::new(Semaphore::new(capacity));
        let (tx, mut rx) = mpsc::channel::<(Handoff, OwnedSemaphorePermit)>(capacity);

        let generator = {
            let stages = stages.clone();
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let mut skipped = Vec::new();
                let mut items = items.into_iter();
                while let Some(item) = items.next() {
                    if cancel.is_cancelled() {
                        skipped.push(item);
                        continue;
                    }
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        skipped.push(item);
                        skipped.extend(items.by_ref());
                        break;
                    };
                    let handoff = guarded_generate(stages.as_ref(), item, &cancel).await;
                    if let Err(mpsc::error::SendError((lost, _))) = tx.send((handoff, permit)).await {
                        tracing::error!("Review stage went away; stopping generation");
                        skipped.push(match lost {
                            Handoff::Review(item) => item,
                            Handoff::Done(report) => report.item,
                        });
                        skipped.extend(items.by_ref());
                        break;
                    }
                }
                skipped
            })
        };

        let mut reviews: JoinSet<ItemReport> = JoinSet::new();
        let mut queue_open = true;

        loop {
            tokio::select! {
                handoff = rx.recv(), if queue_open => match handoff {
                    Some((Handoff::Done(report), _permit)) => tally.finish(report, cancel),
                    Some((Handoff::Review(item), permit)) => {
                        let stages = stages.clone();
                        let cancel = cancel.clone();
                        reviews.spawn(async move {
                            let _permit = permit;
                            guarded_review(stages.as_ref(), item, &cancel).await
                        });
                    }
                    None => queue_open = false,
                },
                joined = reviews.join_next(), if !reviews.is_empty() => match joined {
                    Some(Ok(report)) => tally.finish(report, cancel),
                    Some(Err(e)) => tracing::error!(error = %e, "Review task failed"),
                    None => {}
                },
                else => break,
            }
        }

        match generator.await {
            Ok(skipped) => {
                for item in skipped {
                    tally.skip(item);
                }
            }
            Err(e) => tracing::error!(error = %e, "Generator task failed"),
        }
        tally
    }
}
