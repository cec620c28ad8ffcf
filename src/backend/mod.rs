//! Backend contract and the per-role fallback chain.
//!
//! Concrete provider clients live outside this crate; they implement
//! [`Backend`] and are registered by name in a [`BackendRegistry`]. Each agent
//! role resolves its configured names into a [`FallbackChain`].

mod chain;
pub mod scripted;

pub use chain::{ChainConfig, ChainOutcome, FallbackChain};

use crate::errors::ErrorCode;
use crate::state::{AgentRole, ModelUsage};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One request to a backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub model: Option<String>,
    pub tokens: Option<u64>,
    pub duration_ms: u64,
}

/// What a backend returns. `success = false` carries the provider's error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub content: String,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: ResponseMetadata,
}

impl BackendResponse {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            error: None,
            metadata: ResponseMetadata::default(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            success: false,
            error: Some(error.into()),
            metadata: ResponseMetadata::default(),
        }
    }
}

/// A single AI-completion provider.
///
/// `execute` may either return `Err` or a response with `success = false`;
/// both are classified from their message text.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn provider(&self) -> &str {
        self.name()
    }

    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse>;

    async fn is_available(&self) -> bool;

    async fn list_models(&self) -> Vec<String>;

    async fn has_model(&self, model: &str) -> bool {
        self.list_models().await.iter().any(|m| m == model)
    }

    /// Advertised context window, used for proactive compaction.
    fn context_window_tokens(&self) -> Option<usize> {
        None
    }
}

/// Backends by name.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Resolve an ordered list of names. Errors with the first unknown name.
    pub fn resolve(&self, names: &[String]) -> std::result::Result<Vec<Arc<dyn Backend>>, String> {
        names
            .iter()
            .map(|n| self.get(n).ok_or_else(|| n.clone()))
            .collect()
    }
}

/// USD per 1k tokens, per backend name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(flatten)]
    pub per_1k_tokens: HashMap<String, f64>,
}

impl Pricing {
    pub fn estimate(&self, backend: &str, tokens: u64) -> f64 {
        self.per_1k_tokens
            .get(backend)
            .map(|price| tokens as f64 / 1000.0 * price)
            .unwrap_or(0.0)
    }
}

/// Why one backend in a chain was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend: String,
    pub code: ErrorCode,
    pub message: String,
}

/// The chain moved from one backend to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub role: AgentRole,
    pub from: String,
    pub to: String,
    pub reason: ErrorCode,
    pub timestamp: DateTime<Utc>,
}

/// Everything one logical call did, successful or not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainReport {
    pub usages: Vec<ModelUsage>,
    pub fallbacks: Vec<FallbackEvent>,
    pub compactions: u32,
    /// Prompt length (chars) sent on each attempt, in order.
    pub prompt_lengths: Vec<usize>,
}

impl ChainReport {
    pub fn last_backend(&self) -> Option<&str> {
        self.usages.last().map(|u| u.backend_id.as_str())
    }
}
