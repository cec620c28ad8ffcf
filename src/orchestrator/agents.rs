//! Role calls with step bookkeeping.
//!
//! Every call through a role's fallback chain ends up as exactly one appended
//! [`TaskStep`] and an agent-slot status update. A call cancelled before any
//! backend was tried leaves no step.

use crate::backend::FallbackChain;
use crate::errors::ChainError;
use crate::recovery::Consultant;
use crate::state::{AgentRole, AgentStatus, StepStatus, StoreHandle, TaskStep};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Hex SHA-256 of a generated output, used to spot repeated answers.
pub fn output_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// A successful role call.
#[derive(Debug, Clone)]
pub struct CallOutput {
    pub content: String,
    pub backend: String,
    pub output_hash: String,
}

pub struct AgentCaller {
    chains: BTreeMap<AgentRole, Arc<FallbackChain>>,
    store: StoreHandle,
}

impl AgentCaller {
    pub fn new(chains: BTreeMap<AgentRole, Arc<FallbackChain>>, store: StoreHandle) -> Self {
        Self { chains, store }
    }

    pub async fn call(
        &self,
        role: AgentRole,
        prompt: &str,
        file_path: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CallOutput, ChainError> {
        let chain = self
            .chains
            .get(&role)
            .ok_or(ChainError::NoBackends { role })?;

        self.set_status(role, AgentStatus::Working, None).await;
        let started_at = Utc::now();
        let result = chain.execute(prompt, cancel).await;
        let ended_at = Utc::now();
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;

        let (status, report, output) = match result {
            Ok(outcome) => {
                let hash = output_hash(&outcome.response.content);
                let output = CallOutput {
                    content: outcome.response.content,
                    backend: outcome.backend,
                    output_hash: hash,
                };
                (StepStatus::Complete, outcome.report, Ok(output))
            }
            Err(e) => {
                let status = match e {
                    ChainError::Cancelled { .. } => StepStatus::Cancelled,
                    _ => StepStatus::Failed,
                };
                let report = match &e {
                    ChainError::Exhausted { report, .. } | ChainError::Cancelled { report, .. } => {
                        report.clone()
                    }
                    ChainError::NoBackends { .. } => Default::default(),
                };
                (status, report, Err(e))
            }
        };

        let agent_status = match (&output, report.fallbacks.is_empty()) {
            (Ok(_), true) => AgentStatus::Complete,
            (Ok(_), false) => AgentStatus::Fallback,
            (Err(ChainError::Cancelled { .. }), _) => AgentStatus::Idle,
            (Err(_), _) => AgentStatus::Error,
        };
        let last_backend = report.last_backend().map(str::to_string);
        self.set_status(role, agent_status, last_backend).await;

        let exhausted = matches!(output, Err(ChainError::Exhausted { .. }));
        if !report.usages.is_empty() || exhausted {
            let step = TaskStep {
                id: uuid::Uuid::new_v4().to_string(),
                agent_role: role,
                status,
                file_path: file_path.map(str::to_string),
                usages: report.usages,
                output_hash: output.as_ref().ok().map(|o| o.output_hash.clone()),
                error: output.as_ref().err().map(|e| e.to_string()),
                started_at,
                ended_at,
                duration_ms,
            };
            if let Err(e) = self.store.record_step(step, report.fallbacks).await {
                tracing::error!(role = %role, error = %e, "Failed to record task step");
            }
        }

        output
    }

    async fn set_status(&self, role: AgentRole, status: AgentStatus, backend: Option<String>) {
        if let Err(e) = self.store.set_agent_status(role, status, backend).await {
            tracing::error!(role = %role, error = %e, "Failed to update agent status");
        }
    }
}

#[async_trait]
impl Consultant for AgentCaller {
    async fn consult(
        &self,
        prompt: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ChainError> {
        self.call(AgentRole::Consultant, prompt, Some(path), cancel)
            .await
            .map(|output| output.content)
    }
}
