//! Per-item generate / review stages driven by the scheduler.

use super::agents::{AgentCaller, CallOutput};
use crate::errors::{ChainError, ErrorCode};
use crate::events::{Event, EventBus};
use crate::prompts::{Issue, Plan, PromptKit};
use crate::recovery::{RecoveryManager, RecoveryOutcome, RecoveryRequest, detect_incomplete};
use crate::scheduler::{Handoff, ItemReport, ItemStages};
use crate::state::{AgentRole, StoreHandle, WorkItem, WorkItemStatus};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared collaborators for one session.
#[derive(Clone)]
pub(crate) struct ItemContext {
    pub task: String,
    pub plan: Plan,
    pub caller: Arc<AgentCaller>,
    pub store: StoreHandle,
    pub workspace: Arc<dyn Workspace>,
    pub prompts: Arc<dyn PromptKit>,
    pub recovery: Arc<RecoveryManager>,
    pub events: EventBus,
    pub max_fix_attempts: u32,
}

pub(crate) enum Repair {
    Fixed,
    Failed,
    Cancelled,
}

enum Step<T> {
    Continue(T),
    /// The item is finished (terminal) or abandoned (cancelled).
    Stop,
}

pub(crate) struct ItemPipeline {
    ctx: ItemContext,
    total: usize,
    started: AtomicUsize,
    recovered: Mutex<BTreeSet<String>>,
    last_hash: Mutex<HashMap<String, String>>,
}

impl ItemPipeline {
    pub fn new(ctx: ItemContext, total: usize) -> Self {
        Self {
            ctx,
            total,
            started: AtomicUsize::new(0),
            recovered: Mutex::new(BTreeSet::new()),
            last_hash: Mutex::new(HashMap::new()),
        }
    }

    fn report(&self, item: WorkItem) -> ItemReport {
        let recovered = self
            .recovered
            .lock()
            .map(|set| set.contains(&item.path))
            .unwrap_or(false);
        ItemReport { item, recovered }
    }

    async fn sync(&self, item: &WorkItem) {
        let copy = item.clone();
        if let Err(e) = self
            .ctx
            .store
            .update_item(&item.path, move |stored| *stored = copy)
            .await
        {
            tracing::error!(path = %item.path, error = %e, "Failed to persist work item");
        }
    }

    async fn fail(&self, item: &mut WorkItem, code: ErrorCode, message: String) {
        tracing::warn!(path = %item.path, code = %code, error = %message, "Work item failed");
        self.ctx.events.emit(Event::Error {
            code,
            message: message.clone(),
            path: Some(item.path.clone()),
        });
        item.fail(message);
        self.sync(item).await;
    }

    async fn complete(&self, item: &mut WorkItem) {
        item.status = WorkItemStatus::Complete;
        item.last_error = None;
        self.sync(item).await;
    }

    /// Pre-session content recorded for `path`.
    async fn pre_session(&self, path: &str) -> Option<String> {
        match self.ctx.store.snapshot().await {
            Ok(record) => record.snapshots.get(path).cloned().flatten(),
            Err(e) => {
                tracing::error!(path, error = %e, "Failed to read session snapshot");
                None
            }
        }
    }

    async fn feedback(&self, path: &str) -> Vec<Issue> {
        match self.ctx.store.snapshot().await {
            Ok(record) => record.feedback.get(path).cloned().unwrap_or_default(),
            Err(e) => {
                tracing::error!(path, error = %e, "Failed to read audit feedback");
                Vec::new()
            }
        }
    }

    /// Returns true when this output repeats the previous one for `path`.
    fn repeats_previous(&self, path: &str, hash: &str) -> bool {
        let Ok(mut hashes) = self.last_hash.lock() else {
            return false;
        };
        let repeated = hashes.get(path).is_some_and(|h| h == hash);
        hashes.insert(path.to_string(), hash.to_string());
        repeated
    }

    async fn call(
        &self,
        item: &mut WorkItem,
        role: AgentRole,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Step<CallOutput> {
        let path = item.path.clone();
        let result = self.ctx.caller.call(role, prompt, Some(&path), cancel).await;
        match result {
            Ok(output) => Step::Continue(output),
            Err(ChainError::Cancelled { .. }) => Step::Stop,
            Err(e) => {
                self.fail(item, e.code(), e.to_string()).await;
                Step::Stop
            }
        }
    }

    /// Write generated content, check it and repair it if it is broken.
    async fn write_checked(
        &self,
        item: &mut WorkItem,
        content: &str,
        issues: &[Issue],
        cancel: &CancellationToken,
    ) -> Step<()> {
        if let Err(e) = self.ctx.workspace.write_file(&item.path, content).await {
            self.fail(item, ErrorCode::ApiError, format!("Failed to write file: {:#}", e))
                .await;
            return Step::Stop;
        }

        let check = detect_incomplete(content);
        self.ctx.events.emit(Event::SyntaxCheck {
            path: item.path.clone(),
            valid: !check.is_incomplete,
            reason: check.reason.clone(),
        });
        if !check.is_incomplete {
            return Step::Continue(());
        }

        let code = check.code().unwrap_or(ErrorCode::IncompleteCode);
        let reason = check.reason.unwrap_or_else(|| code.to_string());
        tracing::warn!(path = %item.path, code = %code, reason = %reason, "Generated file failed check");
        match self
            .repair(item, content.to_string(), reason, issues.to_vec(), cancel)
            .await
        {
            Repair::Fixed => Step::Continue(()),
            Repair::Failed | Repair::Cancelled => Step::Stop,
        }
    }

    /// Hand a broken file to the recovery manager.
    pub async fn repair(
        &self,
        item: &mut WorkItem,
        content: String,
        reason: String,
        issues: Vec<Issue>,
        cancel: &CancellationToken,
    ) -> Repair {
        if let Ok(mut set) = self.recovered.lock() {
            set.insert(item.path.clone());
        }
        let request = RecoveryRequest {
            path: item.path.clone(),
            content,
            reason,
            issues,
            snapshot: self.pre_session(&item.path).await,
        };
        match self.ctx.recovery.recover(request, cancel).await {
            RecoveryOutcome::Recovered { attempts, .. } => {
                tracing::info!(path = %item.path, attempts, "File recovered");
                Repair::Fixed
            }
            RecoveryOutcome::Exhausted {
                attempts,
                last_reason,
                ..
            } => {
                let message = format!(
                    "{} after {} attempt(s): {}",
                    ErrorCode::RecoveryExhausted,
                    attempts,
                    last_reason
                );
                self.fail(item, ErrorCode::RecoveryExhausted, message).await;
                Repair::Failed
            }
            RecoveryOutcome::Cancelled { .. } => Repair::Cancelled,
        }
    }

    async fn review_rounds(&self, item: &mut WorkItem, cancel: &CancellationToken) {
        let path = item.path.clone();
        let mut rounds = 0u32;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let content = match self.ctx.workspace.read_file(&path).await {
                Ok(content) => content,
                Err(e) => {
                    self.fail(item, ErrorCode::ApiError, format!("Failed to read file: {:#}", e))
                        .await;
                    return;
                }
            };

            let prompt = self.ctx.prompts.audit_prompt(&self.ctx.task, &path, &content);
            let Step::Continue(output) = self.call(item, AgentRole::Auditor, &prompt, cancel).await
            else {
                return;
            };
            let verdict = self.ctx.prompts.parse_verdict(&output.content);
            if verdict.is_approved() {
                if let Err(e) = self.ctx.store.set_feedback(&path, Vec::new()).await {
                    tracing::error!(path = %path, error = %e, "Failed to clear feedback");
                }
                self.complete(item).await;
                return;
            }

            let mut issues: Vec<Issue> = verdict.issues_for(&path).cloned().collect();
            if issues.is_empty() {
                issues.push(Issue {
                    file: Some(path.clone()),
                    description: "Auditor requested changes".to_string(),
                    fixable: true,
                });
            }

            if issues.iter().any(|i| !i.fixable) {
                let reason = "Auditor reported unfixable issues".to_string();
                match self.repair(item, content, reason, issues, cancel).await {
                    Repair::Fixed => self.complete(item).await,
                    Repair::Failed | Repair::Cancelled => {}
                }
                return;
            }

            if let Err(e) = self.ctx.store.set_feedback(&path, issues.clone()).await {
                tracing::error!(path = %path, error = %e, "Failed to store feedback");
            }
            if rounds >= self.ctx.max_fix_attempts {
                tracing::info!(path = %path, rounds, "Fix attempts used up; leaving feedback for the session audit");
                self.complete(item).await;
                return;
            }
            rounds += 1;
            item.attempts += 1;

            let prompt = self.ctx.prompts.execute_prompt(
                &self.ctx.task,
                &self.ctx.plan,
                &path,
                Some(&content),
                &issues,
            );
            let Step::Continue(output) = self.call(item, AgentRole::Executor, &prompt, cancel).await
            else {
                return;
            };
            if self.repeats_previous(&path, &output.output_hash) {
                tracing::info!(path = %path, "Fix reproduced the previous output; ending fix loop");
                self.complete(item).await;
                return;
            }
            let fixed = self.ctx.prompts.extract_content(&output.content);
            if let Step::Stop = self.write_checked(item, &fixed, &issues, cancel).await {
                return;
            }
        }
    }
}

#[async_trait]
impl ItemStages for ItemPipeline {
    async fn generate(&self, mut item: WorkItem, cancel: &CancellationToken) -> Handoff {
        let started = Instant::now();
        let path = item.path.clone();
        item.status = WorkItemStatus::Processing;
        item.attempts += 1;
        self.sync(&item).await;
        self.ctx.events.emit(Event::FileStart {
            path: path.clone(),
            current: self.started.fetch_add(1, Ordering::SeqCst) + 1,
            total: self.total,
        });

        let existing = match self.ctx.workspace.snapshot(&path).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Could not read existing file");
                None
            }
        };
        if let Err(e) = self.ctx.store.capture_snapshot(&path, existing.clone()).await {
            tracing::error!(path = %path, error = %e, "Failed to record pre-session snapshot");
        }

        let feedback = self.feedback(&path).await;
        let prompt = self.ctx.prompts.execute_prompt(
            &self.ctx.task,
            &self.ctx.plan,
            &path,
            existing.as_deref(),
            &feedback,
        );
        let step = self.call(&mut item, AgentRole::Executor, &prompt, cancel).await;
        let Step::Continue(output) = step else {
            item.duration_ms += started.elapsed().as_millis() as u64;
            return Handoff::Done(self.report(item));
        };
        self.repeats_previous(&path, &output.output_hash);

        let content = self.ctx.prompts.extract_content(&output.content);
        let written = self.write_checked(&mut item, &content, &feedback, cancel).await;
        item.duration_ms += started.elapsed().as_millis() as u64;
        match written {
            Step::Continue(()) => {
                self.sync(&item).await;
                Handoff::Review(item)
            }
            Step::Stop => Handoff::Done(self.report(item)),
        }
    }

    async fn review(&self, mut item: WorkItem, cancel: &CancellationToken) -> ItemReport {
        let started = Instant::now();
        self.review_rounds(&mut item, cancel).await;
        item.duration_ms += started.elapsed().as_millis() as u64;
        self.sync(&item).await;
        self.report(item)
    }
}
