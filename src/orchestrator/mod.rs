mod agents;
mod machine;
mod pipeline;
mod runner;

pub use agents::{AgentCaller, CallOutput, output_hash};
pub use machine::PhaseMachine;
pub use runner::{
    Orchestrator, OrchestratorBuilder, OrchestratorConfig, SessionOutcome, SessionReport,
    StartOptions,
};
