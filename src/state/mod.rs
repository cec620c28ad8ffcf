//! Session data model and its durable storage.
//!
//! - [`types`]: sessions, agent slots, work items, steps, usage and metrics
//! - [`store`]: the single-writer actor every worker funnels updates through
//! - [`history`]: the on-disk index + per-session records
//! - [`cache`]: task-keyed result cache

pub mod cache;
pub mod history;
pub mod store;
pub mod types;

pub use cache::ResultCache;
pub use history::{HistoryStore, ListFilter};
pub use store::{SessionStore, StoreHandle};
pub use types::{
    AgentRole, AgentSlot, AgentStatus, Checkpoint, GlobalMetrics, ModelUsage, Phase, Session,
    SessionOptions, SessionRecord, SessionSummary, StepStatus, TaskStep, WorkItem, WorkItemStatus,
};
