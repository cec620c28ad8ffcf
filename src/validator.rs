//! Optional output validator consulted in the observing phase.
//!
//! Implementations capture the generated output (screenshots, command output,
//! rendered pages) per route and report problems. The orchestrator only sees
//! the typed results.

use crate::prompts::Issue;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteValidation {
    pub route: String,
    pub passed: bool,
    pub issues: Vec<Issue>,
}

#[async_trait]
pub trait OutputValidator: Send + Sync {
    /// Routes (pages, commands, entry points) to check for these files.
    async fn capture_routes(&self, files: &[String]) -> Result<Vec<String>>;

    async fn validate_route(&self, route: &str) -> Result<RouteValidation>;
}
