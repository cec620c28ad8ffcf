//! Session data model: phases, agent slots, work items, steps and metrics.

use crate::backend::FallbackEvent;
use crate::errors::ErrorCode;
use crate::prompts::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Orchestration phase. Transitions are enforced by `orchestrator::PhaseMachine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    Idle,
    Planning,
    AwaitingApproval,
    Executing,
    Auditing,
    Recovery,
    Observing,
    Complete,
    Error,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Planning => "planning",
            Phase::AwaitingApproval => "awaiting-approval",
            Phase::Executing => "executing",
            Phase::Auditing => "auditing",
            Phase::Recovery => "recovery",
            Phase::Observing => "observing",
            Phase::Complete => "complete",
            Phase::Error => "error",
        }
    }

    pub const ALL: [Phase; 9] = [
        Phase::Idle,
        Phase::Planning,
        Phase::AwaitingApproval,
        Phase::Executing,
        Phase::Auditing,
        Phase::Recovery,
        Phase::Observing,
        Phase::Complete,
        Phase::Error,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| anyhow::anyhow!("Invalid phase '{}'", s))
    }
}

/// The four logical roles in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Produces the plan
    Architect,
    /// Generates file content
    Executor,
    /// Reviews generated content
    Auditor,
    /// Helps repair broken output during recovery
    Consultant,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::Architect,
        AgentRole::Executor,
        AgentRole::Auditor,
        AgentRole::Consultant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Architect => "architect",
            AgentRole::Executor => "executor",
            AgentRole::Auditor => "auditor",
            AgentRole::Consultant => "consultant",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Complete,
    Error,
    Fallback,
}

/// One slot per role: its fallback chain and what it is doing right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSlot {
    pub role: AgentRole,
    pub backends: Vec<String>,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backend: Option<String>,
}

impl AgentSlot {
    pub fn new(role: AgentRole, backends: Vec<String>) -> Self {
        Self {
            role,
            backends,
            status: AgentStatus::Idle,
            last_backend: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemStatus {
    #[default]
    Pending,
    Processing,
    Complete,
    Error,
    Reverted,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Complete | WorkItemStatus::Error | WorkItemStatus::Reverted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Processing => "processing",
            WorkItemStatus::Complete => "complete",
            WorkItemStatus::Error => "error",
            WorkItemStatus::Reverted => "reverted",
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file produced or modified during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub path: String,
    pub status: WorkItemStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WorkItem {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: WorkItemStatus::Pending,
            attempts: 0,
            duration_ms: 0,
            last_error: None,
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = WorkItemStatus::Error;
        self.last_error = Some(message.into());
    }
}

/// Outcome of one backend attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub backend_id: String,
    pub provider: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
    pub estimated_cost: f64,
    /// Characters sent in the prompt for this attempt.
    #[serde(default)]
    pub prompt_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Complete,
    Failed,
    Cancelled,
}

/// One attempt record for (role, work item). Appended once, when finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub agent_role: AgentRole,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub usages: Vec<ModelUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    /// Why the call failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
}

/// Session-wide counters. Only ever incremented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_cost_estimate: f64,
    pub total_tokens: u64,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    pub fallback_rotations: u64,
    pub avg_latency_ms: f64,
    #[serde(default)]
    total_latency_ms: u64,
}

impl GlobalMetrics {
    pub fn record_usage(&mut self, usage: &ModelUsage) {
        self.total_attempts += 1;
        if usage.success {
            self.successful_attempts += 1;
        } else {
            self.failed_attempts += 1;
        }
        self.total_tokens += usage.tokens_used;
        self.total_cost_estimate += usage.estimated_cost.max(0.0);
        self.total_latency_ms += usage.latency_ms;
        self.avg_latency_ms = self.total_latency_ms as f64 / self.total_attempts as f64;
    }

    pub fn record_fallbacks(&mut self, count: u64) {
        self.fallback_rotations += count;
    }
}

/// One orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub task: String,
    pub phase: Phase,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub can_resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set by an explicit clear/clean; permanently disables resume.
    #[serde(default)]
    pub cleared: bool,
}

impl Session {
    pub fn new(task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            phase: Phase::Idle,
            iteration: 0,
            started_at: now,
            last_activity: now,
            can_resume: true,
            last_error: None,
            cleared: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.can_resume = !self.phase.is_terminal() && !self.cleared;
    }
}

/// Options a session was started with, persisted so a resume behaves the same.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub auto_approve: bool,
    pub mode: crate::scheduler::ScheduleMode,
    pub max_concurrency: usize,
    pub max_iterations: u32,
}

/// Full-detail record for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: Session,
    pub options: SessionOptions,
    pub agents: BTreeMap<AgentRole, AgentSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default)]
    pub fallbacks: Vec<FallbackEvent>,
    #[serde(default)]
    pub metrics: GlobalMetrics,
    /// Pre-session content per path; `None` means the file did not exist.
    #[serde(default)]
    pub snapshots: BTreeMap<String, Option<String>>,
    /// Audit feedback carried into the next execution round.
    #[serde(default)]
    pub feedback: BTreeMap<String, Vec<crate::prompts::Issue>>,
}

impl SessionRecord {
    pub fn new(session: Session, options: SessionOptions, agents: Vec<AgentSlot>) -> Self {
        Self {
            session,
            options,
            agents: agents.into_iter().map(|a| (a.role, a)).collect(),
            plan: None,
            work_items: Vec::new(),
            checkpoints: Vec::new(),
            steps: Vec::new(),
            fallbacks: Vec::new(),
            metrics: GlobalMetrics::default(),
            snapshots: BTreeMap::new(),
            feedback: BTreeMap::new(),
        }
    }

    pub fn item(&self, path: &str) -> Option<&WorkItem> {
        self.work_items.iter().find(|i| i.path == path)
    }

    pub fn item_mut(&mut self, path: &str) -> Option<&mut WorkItem> {
        self.work_items.iter_mut().find(|i| i.path == path)
    }

    /// Appends a finished step and folds its usages into the metrics.
    pub fn append_step(&mut self, step: TaskStep) {
        for usage in &step.usages {
            self.metrics.record_usage(usage);
        }
        self.steps.push(step);
    }

    pub fn files_with_status(&self, status: WorkItemStatus) -> Vec<String> {
        self.work_items
            .iter()
            .filter(|i| i.status == status)
            .map(|i| i.path.clone())
            .collect()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.session.id.clone(),
            task: self.session.task.clone(),
            phase: self.session.phase,
            started_at: self.session.started_at,
            last_activity: self.session.last_activity,
            can_resume: self.session.can_resume,
            file_count: self.work_items.len(),
            completed_files: self
                .work_items
                .iter()
                .filter(|i| i.status == WorkItemStatus::Complete)
                .count(),
            step_count: self.steps.len(),
        }
    }
}

/// Lightweight index entry for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub task: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub can_resume: bool,
    pub file_count: usize,
    pub completed_files: usize,
    pub step_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(success: bool, tokens: u64, latency: u64) -> ModelUsage {
        ModelUsage {
            backend_id: "alpha".into(),
            provider: "test".into(),
            tokens_used: tokens,
            latency_ms: latency,
            success,
            error_code: (!success).then_some(ErrorCode::ApiError),
            timestamp: Utc::now(),
            estimated_cost: tokens as f64 / 1000.0,
            prompt_chars: 0,
        }
    }

    #[test]
    fn test_phase_terminal() {
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Error.is_terminal());
        assert!(!Phase::AwaitingApproval.is_terminal());
        assert!(!Phase::Idle.is_terminal());
    }

    #[test]
    fn test_phase_parse_and_display() {
        assert_eq!(
            "awaiting-approval".parse::<Phase>().unwrap(),
            Phase::AwaitingApproval
        );
        assert_eq!("AWAITING_APPROVAL".parse::<Phase>().unwrap(), Phase::AwaitingApproval);
        assert_eq!(Phase::Observing.to_string(), "observing");
        assert!("bogus".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_serializes_kebab_case() {
        let json = serde_json::to_string(&Phase::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting-approval\"");
    }

    #[test]
    fn test_metrics_accumulate() {
        let mut m = GlobalMetrics::default();
        m.record_usage(&usage(true, 100, 10));
        m.record_usage(&usage(false, 50, 30));
        m.record_fallbacks(2);
        assert_eq!(m.total_attempts, 2);
        assert_eq!(m.successful_attempts, 1);
        assert_eq!(m.failed_attempts, 1);
        assert_eq!(m.total_tokens, 150);
        assert_eq!(m.fallback_rotations, 2);
        assert!((m.avg_latency_ms - 20.0).abs() < f64::EPSILON);
        assert!((m.total_cost_estimate - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_session_touch_tracks_resumability() {
        let mut s = Session::new("build it");
        s.phase = Phase::Executing;
        s.touch();
        assert!(s.can_resume);
        s.phase = Phase::Complete;
        s.touch();
        assert!(!s.can_resume);

        let mut cleared = Session::new("other");
        cleared.phase = Phase::Executing;
        cleared.cleared = true;
        cleared.touch();
        assert!(!cleared.can_resume);
    }

    #[test]
    fn test_record_summary_counts() {
        let mut record = SessionRecord::new(
            Session::new("task"),
            SessionOptions::default(),
            vec![AgentSlot::new(AgentRole::Executor, vec!["alpha".into()])],
        );
        record.work_items.push(WorkItem::new("a.rs"));
        let mut done = WorkItem::new("b.rs");
        done.status = WorkItemStatus::Complete;
        record.work_items.push(done);

        let summary = record.summary();
        assert_eq!(summary.file_count, 2);
        assert_eq!(summary.completed_files, 1);
        assert_eq!(record.files_with_status(WorkItemStatus::Pending), vec!["a.rs"]);
    }

    #[test]
    fn test_work_item_terminal_states() {
        assert!(WorkItemStatus::Reverted.is_terminal());
        assert!(WorkItemStatus::Error.is_terminal());
        assert!(!WorkItemStatus::Processing.is_terminal());
    }
}
