//! Session driver and the public control surface.
//!
//! `start` and `resume` run a whole session on the caller's task and return a
//! [`SessionReport`]. The other controls (`approve_plan`, `cancel`, ...) are
//! called from elsewhere through a clone of the same [`Orchestrator`].

use super::agents::AgentCaller;
use super::machine::PhaseMachine;
use super::pipeline::{ItemContext, ItemPipeline, Repair};
use crate::backend::{Backend, BackendRegistry, ChainConfig, FallbackChain, Pricing};
use crate::compaction::{ErrorClassifier, PatternClassifier};
use crate::errors::{ChainError, ErrorCode, OrchestratorError};
use crate::events::{Event, EventBus, EventStream};
use crate::prompts::{Issue, Plan, PlainPrompts, PromptKit};
use crate::recovery::{Consultant, RecoveryConfig, RecoveryManager, restore_snapshot};
use crate::scheduler::{ItemReport, ProgressFn, ScheduleMode, Scheduler, SchedulerConfig};
use crate::state::{
    AgentRole, AgentSlot, GlobalMetrics, HistoryStore, Phase, ResultCache, Session,
    SessionOptions, SessionRecord, SessionStore, StoreHandle, WorkItemStatus,
};
use crate::validator::OutputValidator;
use crate::workspace::{LocalWorkspace, Workspace};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

/// Settings the orchestrator is constructed with.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub auto_approve: bool,
    pub mode: ScheduleMode,
    pub max_concurrency: usize,
    /// Executor re-runs per item inside the review stage.
    pub max_fix_attempts: u32,
    pub max_observer_iterations: u32,
    pub use_cache: bool,
    pub chain: ChainConfig,
    pub recovery: RecoveryConfig,
    /// Ordered backend names per role. Roles left out use every registered backend.
    pub agents: BTreeMap<AgentRole, Vec<String>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            auto_approve: false,
            mode: ScheduleMode::Parallel,
            max_concurrency: 3,
            max_fix_attempts: 2,
            max_observer_iterations: 2,
            use_cache: true,
            chain: ChainConfig::default(),
            recovery: RecoveryConfig::default(),
            agents: BTreeMap::new(),
        }
    }
}

/// Per-start overrides.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub auto_approve: Option<bool>,
    pub mode: Option<ScheduleMode>,
    pub max_concurrency: Option<usize>,
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

/// What a session produced.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub phase: Phase,
    pub outcome: SessionOutcome,
    pub completed_files: Vec<String>,
    pub failed_files: Vec<String>,
    pub metrics: GlobalMetrics,
    pub iterations: u32,
}

enum Decision {
    Approve,
    Reject,
    Update(Plan),
}

struct ActiveSession {
    store: StoreHandle,
    cancel: CancellationToken,
    approval: Option<oneshot::Sender<Decision>>,
    running: bool,
}

struct Shared {
    config: OrchestratorConfig,
    chains: BTreeMap<AgentRole, Arc<FallbackChain>>,
    prompts: Arc<dyn PromptKit>,
    workspace: Arc<dyn Workspace>,
    validator: Option<Arc<dyn OutputValidator>>,
    history: Option<HistoryStore>,
    cache: Arc<ResultCache>,
    events: EventBus,
    active: Mutex<Option<ActiveSession>>,
}

/// The phase state machine and its control surface. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    registry: BackendRegistry,
    classifier: Arc<dyn ErrorClassifier>,
    prompts: Arc<dyn PromptKit>,
    workspace: Option<Arc<dyn Workspace>>,
    validator: Option<Arc<dyn OutputValidator>>,
    history: Option<HistoryStore>,
    cache: Option<ResultCache>,
    pricing: Pricing,
    events: EventBus,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            registry: BackendRegistry::new(),
            classifier: Arc::new(PatternClassifier::new()),
            prompts: Arc::new(PlainPrompts),
            workspace: None,
            validator: None,
            history: None,
            cache: None,
            pricing: Pricing::default(),
            events: EventBus::new(),
        }
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.registry.register(backend);
        self
    }

    pub fn registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn prompts(mut self, prompts: Arc<dyn PromptKit>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn OutputValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Persist sessions here. Without one, sessions live in memory only.
    pub fn history(mut self, history: HistoryStore) -> Self {
        self.history = Some(history);
        self
    }

    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let pricing = Arc::new(self.pricing);
        let mut chains = BTreeMap::new();
        for role in AgentRole::ALL {
            let names = role_backends(&self.config, &self.registry, role);
            let backends = self
                .registry
                .resolve(&names)
                .map_err(|name| OrchestratorError::UnknownBackend { role, name })?;
            let chain = FallbackChain::new(
                role,
                backends,
                self.classifier.clone(),
                self.config.chain.clone(),
            )
            .with_pricing(pricing.clone())
            .with_events(self.events.clone());
            chains.insert(role, Arc::new(chain));
        }

        let workspace = self
            .workspace
            .unwrap_or_else(|| Arc::new(LocalWorkspace::new(".")));
        Ok(Orchestrator {
            shared: Arc::new(Shared {
                config: self.config,
                chains,
                prompts: self.prompts,
                workspace,
                validator: self.validator,
                history: self.history,
                cache: Arc::new(self.cache.unwrap_or_else(ResultCache::in_memory)),
                events: self.events,
                active: Mutex::new(None),
            }),
        })
    }
}

fn role_backends(
    config: &OrchestratorConfig,
    registry: &BackendRegistry,
    role: AgentRole,
) -> Vec<String> {
    match config.agents.get(&role) {
        Some(names) if !names.is_empty() => names.clone(),
        _ => registry.names(),
    }
}

/// Where the phase loop goes next.
enum Flow {
    Goto(Phase),
    Reject,
    Cancelled,
}

/// Loop state that is not worth persisting.
struct Run {
    phase: Phase,
    task: String,
    options: SessionOptions,
    plan: Option<Plan>,
    observer_rounds: u32,
    recovery_rounds: u32,
    recovery_queue: Vec<(String, Vec<Issue>)>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn subscribe(&self) -> EventStream {
        self.shared.events.subscribe()
    }

    pub fn events(&self) -> EventBus {
        self.shared.events.clone()
    }

    /// Current (or last finished) session record, until `reset`.
    pub async fn current_session(&self) -> Option<SessionRecord> {
        let store = self.shared.active.lock().await.as_ref()?.store.clone();
        store.snapshot().await.ok()
    }

    /// Run a new session for `task` to completion.
    pub async fn start(
        &self,
        task: &str,
        options: StartOptions,
    ) -> Result<SessionReport, OrchestratorError> {
        let config = &self.shared.config;
        let session_options = SessionOptions {
            auto_approve: options.auto_approve.unwrap_or(config.auto_approve),
            mode: options.mode.unwrap_or(config.mode),
            max_concurrency: options.max_concurrency.unwrap_or(config.max_concurrency).max(1),
            max_iterations: options.max_iterations.unwrap_or(config.max_iterations).max(1),
        };
        let agents = AgentRole::ALL
            .iter()
            .map(|role| {
                let names = self
                    .shared
                    .chains
                    .get(role)
                    .map(|c| c.backend_names())
                    .unwrap_or_default();
                AgentSlot::new(*role, names)
            })
            .collect();
        let mut session = Session::new(task);
        session.iteration = 1;
        let record = SessionRecord::new(session, session_options, agents);
        tracing::info!(session = %record.session.id, task, "Starting session");
        self.launch(record).await
    }

    /// Continue a persisted session from its last phase.
    pub async fn resume(&self, id: &str) -> Result<SessionReport, OrchestratorError> {
        let history = self
            .shared
            .history
            .clone()
            .ok_or_else(|| OrchestratorError::NotResumable { id: id.to_string() })?;
        let id_owned = id.to_string();
        let mut record = tokio::task::spawn_blocking(move || history.load(&id_owned))
            .await
            .map_err(|e| OrchestratorError::Other(e.into()))??;
        if !record.session.can_resume || record.session.cleared || record.session.phase.is_terminal()
        {
            return Err(OrchestratorError::NotResumable { id: id.to_string() });
        }
        for item in &mut record.work_items {
            if item.status == WorkItemStatus::Processing {
                item.status = WorkItemStatus::Pending;
            }
        }
        record.session.last_error = None;
        tracing::info!(session = %id, phase = %record.session.phase, "Resuming session");
        self.launch(record).await
    }

    async fn launch(&self, record: SessionRecord) -> Result<SessionReport, OrchestratorError> {
        let cancel = CancellationToken::new();
        let store = {
            let mut active = self.shared.active.lock().await;
            if active.is_some() {
                return Err(OrchestratorError::AlreadyStarted);
            }
            let store = SessionStore::spawn(record, self.shared.history.clone());
            *active = Some(ActiveSession {
                store: store.clone(),
                cancel: cancel.clone(),
                approval: None,
                running: true,
            });
            store
        };

        let result = async {
            // Persist the starting point before anything else happens.
            store.update(|_| ()).await?;
            self.drive(&store, &cancel).await
        }
        .await;

        if let Some(active) = self.shared.active.lock().await.as_mut() {
            active.running = false;
            active.approval = None;
        }
        if let Err(e) = &result {
            tracing::error!(session = %store.session_id(), error = %e, "Session aborted");
        }
        result
    }

    pub async fn approve_plan(&self) -> Result<(), OrchestratorError> {
        self.decide(Decision::Approve).await
    }

    pub async fn reject_plan(&self) -> Result<(), OrchestratorError> {
        self.decide(Decision::Reject).await
    }

    /// Approve with an edited plan. The text is parsed like an architect response.
    pub async fn update_plan(&self, text: &str) -> Result<(), OrchestratorError> {
        let task = match self.current_session().await {
            Some(record) => record.session.task,
            None => return Err(OrchestratorError::NoPendingApproval),
        };
        let plan = self.shared.prompts.parse_plan(&task, text);
        if plan.files.is_empty() {
            return Err(OrchestratorError::Other(anyhow::anyhow!(
                "Edited plan lists no files"
            )));
        }
        self.decide(Decision::Update(plan)).await
    }

    async fn decide(&self, decision: Decision) -> Result<(), OrchestratorError> {
        let sender = self
            .shared
            .active
            .lock()
            .await
            .as_mut()
            .and_then(|a| a.approval.take())
            .ok_or(OrchestratorError::NoPendingApproval)?;
        sender
            .send(decision)
            .map_err(|_| OrchestratorError::NoPendingApproval)
    }

    /// Ask the running session to stop. Returns false when nothing is running.
    pub async fn cancel(&self) -> bool {
        match self.shared.active.lock().await.as_ref() {
            Some(active) if active.running => {
                tracing::info!(session = %active.store.session_id(), "Cancellation requested");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Forget the current session so `start` may be called again.
    pub async fn reset(&self) {
        if let Some(active) = self.shared.active.lock().await.take() {
            active.cancel.cancel();
            tracing::debug!(session = %active.store.session_id(), "Session reset");
        }
    }

    /// Restore the pre-session content of one file and mark it reverted.
    pub async fn revert_file(&self, path: &str) -> Result<(), OrchestratorError> {
        let store = self
            .shared
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.store.clone())
            .ok_or_else(|| OrchestratorError::UnknownItem {
                path: path.to_string(),
            })?;
        let record = store.snapshot().await?;
        if record.item(path).is_none() {
            return Err(OrchestratorError::UnknownItem {
                path: path.to_string(),
            });
        }
        let snapshot = record
            .snapshots
            .get(path)
            .ok_or_else(|| OrchestratorError::UnknownItem {
                path: path.to_string(),
            })?;

        restore_snapshot(
            self.shared.workspace.as_ref(),
            &self.shared.events,
            path,
            snapshot.as_deref(),
        )
        .await
        .map_err(|e| OrchestratorError::Workspace {
            path: path.to_string(),
            message: format!("{:#}", e),
        })?;
        store
            .update_item(path, |item| item.status = WorkItemStatus::Reverted)
            .await?;
        Ok(())
    }

    async fn drive(
        &self,
        store: &StoreHandle,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, OrchestratorError> {
        let record = store.snapshot().await?;
        let mut run = Run {
            phase: record.session.phase,
            task: record.session.task.clone(),
            options: record.options.clone(),
            plan: record.plan.clone(),
            observer_rounds: 0,
            recovery_rounds: 0,
            recovery_queue: Vec::new(),
        };
        let caller = Arc::new(AgentCaller::new(self.shared.chains.clone(), store.clone()));

        if run.phase == Phase::Idle {
            self.enter(store, &mut run, Phase::Planning).await?;
        } else {
            self.shared.events.emit(Event::PhaseStart { phase: run.phase });
        }

        loop {
            let flow = match run.phase {
                Phase::Planning => self.plan_stage(store, &caller, &mut run, cancel).await?,
                Phase::AwaitingApproval => self.approval_stage(store, &mut run, cancel).await?,
                Phase::Executing => self.execute_stage(store, &caller, &mut run, cancel).await?,
                Phase::Auditing => self.audit_stage(store, &caller, &mut run, cancel).await?,
                Phase::Recovery => self.recovery_stage(store, &caller, &mut run, cancel).await?,
                Phase::Observing => self.observe_stage(store, &mut run, cancel).await?,
                Phase::Idle | Phase::Complete | Phase::Error => break,
            };
            match flow {
                Flow::Goto(next) => self.enter(store, &mut run, next).await?,
                Flow::Reject => {
                    self.enter(store, &mut run, Phase::Idle).await?;
                    store.checkpoint("plan-rejected").await?;
                    return self.report(store, SessionOutcome::Rejected).await;
                }
                Flow::Cancelled => {
                    let message = "Session cancelled".to_string();
                    tracing::info!(session = %store.session_id(), phase = %run.phase, "{}", message);
                    self.shared.events.emit(Event::Error {
                        code: ErrorCode::Cancelled,
                        message: message.clone(),
                        path: None,
                    });
                    store
                        .set_last_error(Some(format!("{}: {}", ErrorCode::Cancelled, message)))
                        .await?;
                    return self.report(store, SessionOutcome::Cancelled).await;
                }
            }
        }

        store.checkpoint("session-finished").await?;
        let outcome = if run.phase == Phase::Complete {
            SessionOutcome::Completed
        } else {
            SessionOutcome::Failed
        };
        tracing::info!(session = %store.session_id(), phase = %run.phase, "Session finished");
        self.report(store, outcome).await
    }

    async fn enter(
        &self,
        store: &StoreHandle,
        run: &mut Run,
        to: Phase,
    ) -> Result<(), OrchestratorError> {
        let from = run.phase;
        PhaseMachine::transition(from, to)?;
        tracing::info!(from = %from, to = %to, "Phase transition");
        if from != Phase::Idle {
            self.shared.events.emit(Event::PhaseComplete { phase: from });
        }
        store.set_phase(to).await?;
        run.phase = to;
        if to != Phase::Idle {
            self.shared.events.emit(Event::PhaseStart { phase: to });
        }
        Ok(())
    }

    /// Log, publish and persist an error that ends or degrades the session.
    async fn record_error(
        &self,
        store: &StoreHandle,
        code: ErrorCode,
        message: String,
    ) -> Result<(), OrchestratorError> {
        tracing::error!(session = %store.session_id(), code = %code, error = %message, "Session error");
        self.shared.events.emit(Event::Error {
            code,
            message: message.clone(),
            path: None,
        });
        store
            .set_last_error(Some(format!("{}: {}", code, message)))
            .await?;
        Ok(())
    }

    async fn report(
        &self,
        store: &StoreHandle,
        outcome: SessionOutcome,
    ) -> Result<SessionReport, OrchestratorError> {
        let record = store.snapshot().await?;
        Ok(SessionReport {
            session_id: record.session.id.clone(),
            phase: record.session.phase,
            outcome,
            completed_files: record.files_with_status(WorkItemStatus::Complete),
            failed_files: record.files_with_status(WorkItemStatus::Error),
            metrics: record.metrics.clone(),
            iterations: record.session.iteration,
        })
    }

    async fn plan_stage(
        &self,
        store: &StoreHandle,
        caller: &AgentCaller,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Flow, OrchestratorError> {
        let shared = &self.shared;
        let cached = if shared.config.use_cache {
            shared.cache.get(&run.task).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Plan cache unreadable");
                None
            })
        } else {
            None
        };

        let (response, from_cache) = match cached {
            Some(response) => {
                tracing::info!("Using cached plan");
                (response, true)
            }
            None => {
                let prompt = shared.prompts.plan_prompt(&run.task);
                match caller.call(AgentRole::Architect, &prompt, None, cancel).await {
                    Ok(output) => (output.content, false),
                    Err(ChainError::Cancelled { .. }) => return Ok(Flow::Cancelled),
                    Err(e) => {
                        self.record_error(store, e.code(), e.to_string()).await?;
                        return Ok(Flow::Goto(Phase::Error));
                    }
                }
            }
        };

        let plan = shared.prompts.parse_plan(&run.task, &response);
        if plan.files.is_empty() {
            self.record_error(store, ErrorCode::ApiError, "Plan lists no files".to_string())
                .await?;
            return Ok(Flow::Goto(Phase::Error));
        }
        if shared.config.use_cache
            && !from_cache
            && let Err(e) = shared.cache.put(&run.task, response)
        {
            tracing::warn!(error = %e, "Failed to cache plan");
        }

        tracing::info!(files = plan.files.len(), summary = %plan.summary, "Plan ready");
        self.adopt_plan(store, run, plan.clone()).await?;
        store.checkpoint("plan-ready").await?;

        if run.options.auto_approve {
            shared.events.emit(Event::PlanReady {
                summary: plan.summary,
                files: plan.files,
                requires_approval: false,
            });
            store.checkpoint("plan-approved").await?;
            Ok(Flow::Goto(Phase::Executing))
        } else {
            Ok(Flow::Goto(Phase::AwaitingApproval))
        }
    }

    async fn adopt_plan(
        &self,
        store: &StoreHandle,
        run: &mut Run,
        plan: Plan,
    ) -> Result<(), OrchestratorError> {
        let files = plan.files.clone();
        let stored = plan.clone();
        store.update(move |r| r.plan = Some(stored)).await?;
        store.set_work_items(files).await?;
        run.plan = Some(plan);
        Ok(())
    }

    async fn approval_stage(
        &self,
        store: &StoreHandle,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Flow, OrchestratorError> {
        let Some(plan) = run.plan.clone() else {
            self.record_error(store, ErrorCode::ApiError, "No plan to approve".to_string())
                .await?;
            return Ok(Flow::Goto(Phase::Error));
        };

        let (tx, rx) = oneshot::channel();
        if let Some(active) = self.shared.active.lock().await.as_mut() {
            active.approval = Some(tx);
        }
        self.shared.events.emit(Event::PlanReady {
            summary: plan.summary.clone(),
            files: plan.files.clone(),
            requires_approval: true,
        });
        tracing::info!("Waiting for plan approval");

        let decision = tokio::select! {
            decision = rx => decision,
            _ = cancel.cancelled() => return Ok(Flow::Cancelled),
        };
        match decision {
            Ok(Decision::Approve) => {
                store.checkpoint("plan-approved").await?;
                Ok(Flow::Goto(Phase::Executing))
            }
            Ok(Decision::Update(edited)) => {
                tracing::info!(files = edited.files.len(), "Plan edited before approval");
                self.adopt_plan(store, run, edited).await?;
                store.checkpoint("plan-approved").await?;
                Ok(Flow::Goto(Phase::Executing))
            }
            Ok(Decision::Reject) => Ok(Flow::Reject),
            // The session was reset while waiting.
            Err(_) => Ok(Flow::Cancelled),
        }
    }

    fn item_context(
        &self,
        store: &StoreHandle,
        caller: &Arc<AgentCaller>,
        run: &Run,
    ) -> Option<ItemContext> {
        let shared = &self.shared;
        let plan = run.plan.clone()?;
        let consultant: Arc<dyn Consultant> = caller.clone();
        let recovery = RecoveryManager::new(
            shared.config.recovery.clone(),
            consultant,
            shared.workspace.clone(),
            shared.prompts.clone(),
            shared.events.clone(),
        );
        Some(ItemContext {
            task: run.task.clone(),
            plan,
            caller: caller.clone(),
            store: store.clone(),
            workspace: shared.workspace.clone(),
            prompts: shared.prompts.clone(),
            recovery: Arc::new(recovery),
            events: shared.events.clone(),
            max_fix_attempts: shared.config.max_fix_attempts,
        })
    }

    async fn missing_plan(&self, store: &StoreHandle) -> Result<Flow, OrchestratorError> {
        self.record_error(store, ErrorCode::ApiError, "Session has no plan".to_string())
            .await?;
        Ok(Flow::Goto(Phase::Error))
    }

    async fn execute_stage(
        &self,
        store: &StoreHandle,
        caller: &Arc<AgentCaller>,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Flow, OrchestratorError> {
        let Some(ctx) = self.item_context(store, caller, run) else {
            return self.missing_plan(store).await;
        };
        let record = store.snapshot().await?;
        self.shared.events.emit(Event::Iteration {
            iteration: record.session.iteration,
            max_iterations: run.options.max_iterations,
        });

        let items: Vec<_> = record
            .work_items
            .iter()
            .filter(|i| !i.status.is_terminal())
            .cloned()
            .collect();
        let events = self.shared.events.clone();
        let progress: ProgressFn = Arc::new(move |report: &ItemReport, current, total| {
            events.emit(Event::FileComplete {
                path: report.item.path.clone(),
                status: report.item.status,
                current,
                total,
            });
        });
        let scheduler = Scheduler::new(SchedulerConfig {
            mode: run.options.mode,
            max_concurrency: run.options.max_concurrency,
        })
        .with_progress(progress);

        let pipeline = Arc::new(ItemPipeline::new(ctx, items.len()));
        let batch = scheduler.run(items, pipeline, cancel).await;
        if batch.cancelled {
            return Ok(Flow::Cancelled);
        }
        store.checkpoint("batch-complete").await?;

        let failed = batch.failed();
        if !failed.is_empty() {
            tracing::warn!(failed = ?failed, "Some files failed");
        }
        let any_recovered = batch.reports.iter().any(|r| r.recovered);
        let completed = store
            .snapshot()
            .await?
            .files_with_status(WorkItemStatus::Complete);

        if any_recovered {
            Ok(Flow::Goto(Phase::Recovery))
        } else if completed.is_empty() {
            self.record_error(
                store,
                ErrorCode::FatalChainExhausted,
                format!("No file completed; {} failed", failed.len()),
            )
            .await?;
            Ok(Flow::Goto(Phase::Error))
        } else {
            Ok(Flow::Goto(Phase::Auditing))
        }
    }

    async fn audit_stage(
        &self,
        store: &StoreHandle,
        caller: &Arc<AgentCaller>,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Flow, OrchestratorError> {
        let shared = &self.shared;
        let record = store.snapshot().await?;
        let mut files = Vec::new();
        for path in record.files_with_status(WorkItemStatus::Complete) {
            match shared.workspace.read_file(&path).await {
                Ok(content) => files.push((path, content)),
                Err(e) => tracing::warn!(path = %path, error = %e, "Skipping unreadable file in audit"),
            }
        }
        if files.is_empty() {
            return self.finish(store).await;
        }

        let prompt = shared.prompts.batch_audit_prompt(&run.task, &files);
        let verdict = match caller.call(AgentRole::Auditor, &prompt, None, cancel).await {
            Ok(output) => shared.prompts.parse_verdict(&output.content),
            Err(ChainError::Cancelled { .. }) => return Ok(Flow::Cancelled),
            Err(e) => {
                self.record_error(store, e.code(), format!("Batch audit failed: {}", e))
                    .await?;
                return Ok(Flow::Goto(Phase::Error));
            }
        };
        store.checkpoint("audit-complete").await?;

        if verdict.is_approved() {
            tracing::info!(files = files.len(), "Batch audit approved");
            return self.after_audit(store, run).await;
        }

        let mut fixable: BTreeMap<String, Vec<Issue>> = BTreeMap::new();
        let mut unfixable: BTreeMap<String, Vec<Issue>> = BTreeMap::new();
        for (path, _) in &files {
            let issues: Vec<Issue> = verdict.issues_for(path).cloned().collect();
            if issues.iter().any(|i| !i.fixable) {
                unfixable.insert(path.clone(), issues);
            } else if !issues.is_empty() {
                fixable.insert(path.clone(), issues);
            }
        }

        if !unfixable.is_empty() {
            if run.recovery_rounds < run.options.max_iterations {
                run.recovery_rounds += 1;
                run.recovery_queue = unfixable.into_iter().collect();
                return Ok(Flow::Goto(Phase::Recovery));
            }
            for (path, issues) in unfixable {
                let message = format!("Unfixable issues remain: {}", describe(&issues));
                self.fail_item(store, &path, ErrorCode::RecoveryExhausted, message)
                    .await?;
            }
        }

        if !fixable.is_empty() {
            if record.session.iteration < run.options.max_iterations {
                return self.reopen(store, fixable).await;
            }
            tracing::warn!(
                iterations = record.session.iteration,
                "Iteration limit reached with audit issues outstanding"
            );
        }
        self.after_audit(store, run).await
    }

    /// Feed issues back and send their files around the loop again.
    async fn reopen(
        &self,
        store: &StoreHandle,
        issues: BTreeMap<String, Vec<Issue>>,
    ) -> Result<Flow, OrchestratorError> {
        let paths: BTreeSet<String> = issues.keys().cloned().collect();
        tracing::info!(files = ?paths, "Reopening files with audit feedback");
        store
            .update(move |r| {
                for (path, file_issues) in issues {
                    if let Some(item) = r.item_mut(&path) {
                        item.status = WorkItemStatus::Pending;
                    }
                    r.feedback.insert(path, file_issues);
                }
                r.session.iteration += 1;
            })
            .await?;
        Ok(Flow::Goto(Phase::Executing))
    }

    async fn fail_item(
        &self,
        store: &StoreHandle,
        path: &str,
        code: ErrorCode,
        message: String,
    ) -> Result<(), OrchestratorError> {
        tracing::warn!(path, code = %code, error = %message, "Work item failed");
        self.shared.events.emit(Event::Error {
            code,
            message: message.clone(),
            path: Some(path.to_string()),
        });
        store.update_item(path, move |item| item.fail(message)).await?;
        Ok(())
    }

    async fn after_audit(&self, store: &StoreHandle, run: &mut Run) -> Result<Flow, OrchestratorError> {
        if self.shared.validator.is_some()
            && run.observer_rounds < self.shared.config.max_observer_iterations
        {
            return Ok(Flow::Goto(Phase::Observing));
        }
        self.finish(store).await
    }

    /// Terminal phase from the item states.
    async fn finish(&self, store: &StoreHandle) -> Result<Flow, OrchestratorError> {
        let record = store.snapshot().await?;
        let failed = record.files_with_status(WorkItemStatus::Error);
        let completed = record.files_with_status(WorkItemStatus::Complete);
        if failed.is_empty() && !completed.is_empty() {
            return Ok(Flow::Goto(Phase::Complete));
        }
        let message = if failed.is_empty() {
            "No file completed".to_string()
        } else {
            format!("{} file(s) failed: {}", failed.len(), failed.join(", "))
        };
        self.record_error(store, ErrorCode::FatalChainExhausted, message)
            .await?;
        Ok(Flow::Goto(Phase::Error))
    }

    async fn recovery_stage(
        &self,
        store: &StoreHandle,
        caller: &Arc<AgentCaller>,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Flow, OrchestratorError> {
        let queue = std::mem::take(&mut run.recovery_queue);
        if !queue.is_empty() {
            let Some(ctx) = self.item_context(store, caller, run) else {
                return self.missing_plan(store).await;
            };
            let pipeline = ItemPipeline::new(ctx, queue.len());
            for (path, issues) in queue {
                if cancel.is_cancelled() {
                    return Ok(Flow::Cancelled);
                }
                let record = store.snapshot().await?;
                let Some(mut item) = record.item(&path).cloned() else {
                    continue;
                };
                let content = match self.shared.workspace.read_file(&path).await {
                    Ok(content) => content,
                    Err(e) => {
                        self.fail_item(
                            store,
                            &path,
                            ErrorCode::ApiError,
                            format!("Failed to read file for recovery: {:#}", e),
                        )
                        .await?;
                        continue;
                    }
                };
                let reason = format!("Auditor reported unfixable issues: {}", describe(&issues));
                match pipeline
                    .repair(&mut item, content, reason, issues, cancel)
                    .await
                {
                    Repair::Fixed | Repair::Failed => {}
                    Repair::Cancelled => return Ok(Flow::Cancelled),
                }
            }
        }

        let completed = store
            .snapshot()
            .await?
            .files_with_status(WorkItemStatus::Complete);
        if completed.is_empty() {
            self.record_error(
                store,
                ErrorCode::RecoveryExhausted,
                "Recovery left no completed files".to_string(),
            )
            .await?;
            Ok(Flow::Goto(Phase::Error))
        } else {
            Ok(Flow::Goto(Phase::Auditing))
        }
    }

    async fn observe_stage(
        &self,
        store: &StoreHandle,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Flow, OrchestratorError> {
        let events = &self.shared.events;
        let Some(validator) = self.shared.validator.clone() else {
            return self.finish(store).await;
        };
        run.observer_rounds += 1;
        events.emit(Event::ObserverStart {
            iteration: run.observer_rounds,
        });

        let record = store.snapshot().await?;
        let files = record.files_with_status(WorkItemStatus::Complete);
        let routes = match validator.capture_routes(&files).await {
            Ok(routes) => routes,
            Err(e) => {
                tracing::warn!(error = %e, "Output validator failed to capture routes");
                events.emit(Event::ObserverError {
                    message: format!("{:#}", e),
                });
                events.emit(Event::ObserverComplete { passed: false });
                return self.finish(store).await;
            }
        };

        let mut passed = true;
        let mut issues: Vec<Issue> = Vec::new();
        for route in routes {
            if cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            events.emit(Event::ObserverRouteCapture {
                route: route.clone(),
            });
            match validator.validate_route(&route).await {
                Ok(validation) => {
                    events.emit(Event::ObserverRouteValidation {
                        route: validation.route.clone(),
                        passed: validation.passed,
                        issues: validation.issues.len(),
                    });
                    if !validation.passed {
                        passed = false;
                        issues.extend(validation.issues);
                    }
                }
                Err(e) => {
                    tracing::warn!(route = %route, error = %e, "Route validation failed");
                    events.emit(Event::ObserverError {
                        message: format!("{}: {:#}", route, e),
                    });
                    passed = false;
                }
            }
        }
        events.emit(Event::ObserverComplete { passed });
        store.checkpoint("observer-complete").await?;

        if passed {
            return self.finish(store).await;
        }

        let mut fixable: BTreeMap<String, Vec<Issue>> = BTreeMap::new();
        for issue in issues.into_iter().filter(|i| i.fixable) {
            if let Some(path) = issue.file.clone()
                && files.contains(&path)
            {
                fixable.entry(path).or_default().push(issue);
            }
        }
        if !fixable.is_empty() && run.observer_rounds < self.shared.config.max_observer_iterations {
            return self.reopen(store, fixable).await;
        }
        tracing::warn!("Output validation issues remain after observing");
        self.finish(store).await
    }
}

fn describe(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|i| i.description.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
