//! Weaver turns a task into files through four agent roles (architect,
//! executor, auditor, consultant), each backed by an ordered chain of AI
//! backends.
//!
//! The [`orchestrator::Orchestrator`] drives a session through its phases and
//! hands batches of work items to the [`scheduler`]. Every backend call goes
//! through a [`backend::FallbackChain`], which compacts oversized prompts via
//! [`compaction`]. Broken output is handed to [`recovery`], and all progress is
//! persisted through the single-writer store in [`state`].

pub mod backend;
pub mod compaction;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod prompts;
pub mod recovery;
pub mod scheduler;
pub mod state;
pub mod validator;
pub mod workspace;

pub use errors::{ChainError, ErrorCode, OrchestratorError, StoreError};
pub use events::{Event, EventBus, EventKind, EventStream};
pub use orchestrator::{Orchestrator, OrchestratorConfig, SessionOutcome, SessionReport, StartOptions};
