//! Bounded repair of structurally broken output.
//!
//! Each attempt asks the consultant for a corrected file, bounded by
//! `attempt_timeout`, and re-validates the answer with
//! [`detect_incomplete`](super::detect_incomplete). When attempts run out the
//! revert policy restores the pre-session content or deletes a file the
//! session created.

use super::detector::detect_incomplete;
use crate::errors::{ChainError, ErrorCode};
use crate::events::{Event, EventBus};
use crate::prompts::{Issue, PromptKit};
use crate::workspace::Workspace;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub auto_revert_on_failure: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(5 * 60),
            auto_revert_on_failure: true,
        }
    }
}

/// Whoever answers repair prompts. The orchestrator routes this through the
/// consultant role's fallback chain.
#[async_trait]
pub trait Consultant: Send + Sync {
    async fn consult(
        &self,
        prompt: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ChainError>;
}

/// A file that needs repair.
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub path: String,
    pub content: String,
    pub reason: String,
    pub issues: Vec<Issue>,
    /// Pre-session content; `None` when the session created the file.
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevertAction {
    Restored,
    Deleted,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// The repaired content passed validation and was written.
    Recovered { content: String, attempts: u32 },
    Exhausted {
        attempts: u32,
        revert: RevertAction,
        last_reason: String,
    },
    Cancelled { attempts: u32 },
}

impl RecoveryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RecoveryOutcome::Recovered { attempts, .. }
            | RecoveryOutcome::Exhausted { attempts, .. }
            | RecoveryOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

pub struct RecoveryManager {
    config: RecoveryConfig,
    consultant: Arc<dyn Consultant>,
    workspace: Arc<dyn Workspace>,
    prompts: Arc<dyn PromptKit>,
    events: EventBus,
}

impl RecoveryManager {
    pub fn new(
        config: RecoveryConfig,
        consultant: Arc<dyn Consultant>,
        workspace: Arc<dyn Workspace>,
        prompts: Arc<dyn PromptKit>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            consultant,
            workspace,
            prompts,
            events,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Drive up to `max_attempts` consultant calls for one file.
    pub async fn recover(
        &self,
        request: RecoveryRequest,
        cancel: &CancellationToken,
    ) -> RecoveryOutcome {
        let path = request.path.as_str();
        if !self.config.enabled {
            tracing::info!(path, reason = %request.reason, "Recovery disabled, giving up on file");
            return RecoveryOutcome::Exhausted {
                attempts: 0,
                revert: RevertAction::None,
                last_reason: request.reason,
            };
        }

        tracing::info!(path, reason = %request.reason, "Starting recovery");
        self.events.emit(Event::RecoveryStart {
            path: path.to_string(),
            reason: request.reason.clone(),
        });

        let mut content = request.content.clone();
        let mut reason = request.reason.clone();
        let mut attempts = 0u32;

        while attempts < self.config.max_attempts {
            if cancel.is_cancelled() {
                return RecoveryOutcome::Cancelled { attempts };
            }
            attempts += 1;
            self.events.emit(Event::RecoveryAttempt {
                path: path.to_string(),
                attempt: attempts,
                max_attempts: self.config.max_attempts,
            });
            self.events.emit(Event::ConsultantInvoked {
                path: path.to_string(),
                attempt: attempts,
            });

            let prompt = self
                .prompts
                .recovery_prompt(path, &content, &reason, &request.issues);
            let answer = tokio::time::timeout(
                self.config.attempt_timeout,
                self.consultant.consult(&prompt, path, cancel),
            )
            .await;

            let response = match answer {
                Ok(Ok(response)) => response,
                Ok(Err(ChainError::Cancelled { .. })) => {
                    return RecoveryOutcome::Cancelled { attempts };
                }
                Ok(Err(e)) => {
                    tracing::warn!(path, attempt = attempts, error = %e, "Consultant call failed");
                    reason = e.to_string();
                    continue;
                }
                Err(_) => {
                    tracing::warn!(
                        path,
                        attempt = attempts,
                        timeout_secs = self.config.attempt_timeout.as_secs_f64(),
                        "Recovery attempt timed out"
                    );
                    reason = format!(
                        "Recovery attempt timed out after {:.0}s",
                        self.config.attempt_timeout.as_secs_f64()
                    );
                    continue;
                }
            };

            if cancel.is_cancelled() {
                tracing::debug!(path, "Discarding consultant answer after cancellation");
                return RecoveryOutcome::Cancelled { attempts };
            }

            let candidate = self.prompts.extract_content(&response);
            let check = detect_incomplete(&candidate);
            self.events.emit(Event::SyntaxCheck {
                path: path.to_string(),
                valid: !check.is_incomplete,
                reason: check.reason.clone(),
            });

            if check.is_incomplete {
                tracing::debug!(path, attempt = attempts, reason = ?check.reason, "Repair still incomplete");
                if !candidate.trim().is_empty() {
                    content = candidate;
                }
                reason = check.reason.unwrap_or_default();
                continue;
            }

            if let Err(e) = self.workspace.write_file(path, &candidate).await {
                tracing::error!(path, error = %e, "Failed to write repaired file");
                reason = format!("Failed to write repaired file: {}", e);
                continue;
            }

            tracing::info!(path, attempts, "Recovery succeeded");
            self.events.emit(Event::RecoveryComplete {
                path: path.to_string(),
                success: true,
                attempts,
            });
            return RecoveryOutcome::Recovered {
                content: candidate,
                attempts,
            };
        }

        tracing::warn!(path, attempts, reason = %reason, "Recovery exhausted");
        self.events.emit(Event::RecoveryComplete {
            path: path.to_string(),
            success: false,
            attempts,
        });

        let revert = if self.config.auto_revert_on_failure {
            match self.revert(path, request.snapshot.as_deref()).await {
                Ok(action) => action,
                Err(e) => {
                    tracing::error!(path, error = %e, "Failed to revert file");
                    self.events.emit(Event::Error {
                        code: ErrorCode::RecoveryExhausted,
                        message: format!("Failed to revert {}: {}", path, e),
                        path: Some(path.to_string()),
                    });
                    RevertAction::None
                }
            }
        } else {
            RevertAction::None
        };

        RecoveryOutcome::Exhausted {
            attempts,
            revert,
            last_reason: reason,
        }
    }

    /// Put `path` back to its pre-session state.
    pub async fn revert(&self, path: &str, snapshot: Option<&str>) -> Result<RevertAction> {
        restore_snapshot(self.workspace.as_ref(), &self.events, path, snapshot).await
    }
}

/// Write the pre-session content back, or delete a file the session created.
pub async fn restore_snapshot(
    workspace: &dyn Workspace,
    events: &EventBus,
    path: &str,
    snapshot: Option<&str>,
) -> Result<RevertAction> {
    match snapshot {
        Some(original) => {
            workspace.write_file(path, original).await?;
            tracing::info!(path, "Restored pre-session content");
            events.emit(Event::FileReverted {
                path: path.to_string(),
            });
            Ok(RevertAction::Restored)
        }
        None => {
            if workspace.exists(path).await {
                workspace.remove_file(path).await?;
            }
            tracing::info!(path, "Deleted file created this session");
            events.emit(Event::FileDeleted {
                path: path.to_string(),
            });
            Ok(RevertAction::Deleted)
        }
    }
}
