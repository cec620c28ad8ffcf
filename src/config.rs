//! Configuration loaded from `.weaver/weaver.toml`.
//!
//! Layering is file → environment → per-start [`StartOptions`]. Environment
//! overrides are read once while a [`WeaverConfig`] is constructed.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! max_iterations = 3
//! auto_approve = false
//! mode = "parallel"          # sequential | parallel | pipeline
//! max_concurrency = 3
//! call_timeout_secs = 300
//! max_fix_attempts = 2
//! max_observer_iterations = 2
//! use_cache = true
//!
//! [compaction]
//! max_retries = 2
//! target_reduction = 0.5
//! context_window_tokens = 128000
//!
//! [recovery]
//! enabled = true
//! max_attempts = 2
//! timeout_minutes = 5.0
//! auto_revert_on_failure = true
//!
//! [agents]
//! architect = ["primary", "secondary"]
//! executor = ["primary", "secondary"]
//!
//! [pricing]
//! primary = 0.015
//!
//! [logging]
//! level = "info"
//! json = false
//! file = true
//! ```
//!
//! [`StartOptions`]: crate::orchestrator::StartOptions

use crate::backend::{ChainConfig, Pricing};
use crate::orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig};
use crate::recovery::RecoveryConfig;
use crate::scheduler::ScheduleMode;
use crate::state::{AgentRole, HistoryStore, ResultCache};
use crate::workspace::LocalWorkspace;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const CONFIG_FILE: &str = "weaver.toml";
pub const WEAVER_DIR: &str = ".weaver";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    #[serde(default = "default_max_observer_iterations")]
    pub max_observer_iterations: u32,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_mode() -> String {
    ScheduleMode::Parallel.to_string()
}

fn default_max_concurrency() -> usize {
    3
}

fn default_call_timeout_secs() -> u64 {
    300
}

fn default_max_fix_attempts() -> u32 {
    2
}

fn default_max_observer_iterations() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            auto_approve: false,
            mode: default_mode(),
            max_concurrency: default_max_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
            max_fix_attempts: default_max_fix_attempts(),
            max_observer_iterations: default_max_observer_iterations(),
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_target_reduction")]
    pub target_reduction: f64,
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: usize,
}

fn default_max_retries() -> u32 {
    crate::compaction::DEFAULT_MAX_COMPACTION_RETRIES
}

fn default_target_reduction() -> f64 {
    crate::compaction::DEFAULT_TARGET_REDUCTION
}

fn default_context_window_tokens() -> usize {
    128_000
}

impl Default for CompactionSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            target_reduction: default_target_reduction(),
            context_window_tokens: default_context_window_tokens(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_recovery_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: f64,
    #[serde(default = "default_true")]
    pub auto_revert_on_failure: bool,
}

fn default_recovery_attempts() -> u32 {
    2
}

fn default_timeout_minutes() -> f64 {
    5.0
}

/// Upper bound for one recovery attempt.
pub const MAX_RECOVERY_TIMEOUT_MINUTES: f64 = 24.0 * 60.0;

/// Attempt timeout from a configured minute count; out-of-range values are
/// clamped and non-finite ones fall back to the default.
fn recovery_timeout(minutes: f64) -> Duration {
    let minutes = if minutes.is_finite() {
        minutes.clamp(0.0, MAX_RECOVERY_TIMEOUT_MINUTES)
    } else {
        default_timeout_minutes()
    };
    Duration::from_secs_f64(minutes * 60.0)
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_recovery_attempts(),
            timeout_minutes: default_timeout_minutes(),
            auto_revert_on_failure: true,
        }
    }
}

/// Ordered backend names per role. A missing role uses every registered backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architect: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auditor: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultant: Option<Vec<String>>,
}

impl AgentsSection {
    pub fn get(&self, role: AgentRole) -> Option<&Vec<String>> {
        match role {
            AgentRole::Architect => self.architect.as_ref(),
            AgentRole::Executor => self.executor.as_ref(),
            AgentRole::Auditor => self.auditor.as_ref(),
            AgentRole::Consultant => self.consultant.as_ref(),
        }
    }

    pub fn to_map(&self) -> BTreeMap<AgentRole, Vec<String>> {
        AgentRole::ALL
            .iter()
            .filter_map(|role| self.get(*role).map(|names| (*role, names.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset, e.g. "info" or "weaver=debug".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rolling logs under `.weaver/logs/`.
    #[serde(default)]
    pub file: bool,
}

/// The complete weaver.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeaverToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub compaction: CompactionSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub pricing: Pricing,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl WeaverToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse weaver.toml")
    }

    /// Load `<weaver_dir>/weaver.toml`, or defaults when it does not exist.
    pub fn load_or_default(weaver_dir: &Path) -> Result<Self> {
        let config_path = weaver_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize weaver.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.mode.parse::<ScheduleMode>().is_err() {
            warnings.push(format!(
                "Unknown mode '{}': expected sequential, parallel or pipeline",
                self.orchestrator.mode
            ));
        }
        if self.orchestrator.max_concurrency == 0 {
            warnings.push("max_concurrency is 0; at least one worker is always used".to_string());
        }
        if self.orchestrator.max_iterations == 0 {
            warnings.push("max_iterations is 0; at least one iteration is always run".to_string());
        }
        if self.orchestrator.call_timeout_secs == 0 {
            warnings.push("call_timeout_secs is 0; every backend call will time out".to_string());
        }

        let reduction = self.compaction.target_reduction;
        if !(reduction > 0.0 && reduction < 1.0) {
            warnings.push(format!(
                "target_reduction {} is outside (0, 1)",
                reduction
            ));
        }

        if self.recovery.enabled && self.recovery.max_attempts == 0 {
            warnings.push("recovery is enabled but max_attempts is 0".to_string());
        }
        let minutes = self.recovery.timeout_minutes;
        if !(minutes > 0.0 && minutes <= MAX_RECOVERY_TIMEOUT_MINUTES) {
            warnings.push(format!(
                "recovery timeout_minutes {} must be positive and at most {}",
                minutes, MAX_RECOVERY_TIMEOUT_MINUTES
            ));
        }

        for role in AgentRole::ALL {
            if self.agents.get(role).is_some_and(|names| names.is_empty()) {
                warnings.push(format!(
                    "agents.{} is an empty chain; remove it to use every backend",
                    role
                ));
            }
        }

        for (backend, price) in &self.pricing.per_1k_tokens {
            if *price < 0.0 {
                warnings.push(format!("pricing for '{}' is negative", backend));
            }
        }

        warnings
    }
}

/// Environment overrides applied on top of weaver.toml.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub max_concurrency: Option<usize>,
    pub mode: Option<ScheduleMode>,
    pub auto_approve: Option<bool>,
    /// Variables that were set but could not be parsed.
    pub warnings: Vec<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut overrides = Self::default();

        if let Some(value) = lookup("WEAVER_MAX_CONCURRENCY") {
            match value.trim().parse::<usize>() {
                Ok(n) => overrides.max_concurrency = Some(n),
                Err(_) => overrides
                    .warnings
                    .push(format!("Ignoring WEAVER_MAX_CONCURRENCY='{}'", value)),
            }
        }
        if let Some(value) = lookup("WEAVER_MODE") {
            match value.parse::<ScheduleMode>() {
                Ok(mode) => overrides.mode = Some(mode),
                Err(_) => overrides
                    .warnings
                    .push(format!("Ignoring WEAVER_MODE='{}'", value)),
            }
        }
        if let Some(value) = lookup("WEAVER_AUTO_APPROVE") {
            match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => overrides.auto_approve = Some(true),
                "0" | "false" | "no" => overrides.auto_approve = Some(false),
                _ => overrides
                    .warnings
                    .push(format!("Ignoring WEAVER_AUTO_APPROVE='{}'", value)),
            }
        }

        overrides
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct WeaverConfig {
    pub project_dir: PathBuf,
    pub weaver_dir: PathBuf,
    pub toml: WeaverToml,
    pub env: EnvOverrides,
}

impl WeaverConfig {
    /// Load weaver.toml for `project_dir` and apply the process environment.
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::with_env(project_dir, EnvOverrides::from_env())
    }

    pub fn with_env(project_dir: &Path, env: EnvOverrides) -> Result<Self> {
        let weaver_dir = project_dir.join(WEAVER_DIR);
        let toml = WeaverToml::load_or_default(&weaver_dir)?;
        for warning in &env.warnings {
            tracing::warn!("{}", warning);
        }
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            weaver_dir,
            toml,
            env,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.weaver_dir.join(CONFIG_FILE)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.weaver_dir.join("cache.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.weaver_dir.join("logs")
    }

    pub fn mode(&self) -> ScheduleMode {
        self.env
            .mode
            .or_else(|| self.toml.orchestrator.mode.parse().ok())
            .unwrap_or_default()
    }

    pub fn max_concurrency(&self) -> usize {
        self.env
            .max_concurrency
            .unwrap_or(self.toml.orchestrator.max_concurrency)
            .max(1)
    }

    pub fn auto_approve(&self) -> bool {
        self.env
            .auto_approve
            .unwrap_or(self.toml.orchestrator.auto_approve)
    }

    pub fn pricing(&self) -> Pricing {
        self.toml.pricing.clone()
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let section = &self.toml.orchestrator;
        let compaction = &self.toml.compaction;
        let recovery = &self.toml.recovery;
        OrchestratorConfig {
            max_iterations: section.max_iterations.max(1),
            auto_approve: self.auto_approve(),
            mode: self.mode(),
            max_concurrency: self.max_concurrency(),
            max_fix_attempts: section.max_fix_attempts,
            max_observer_iterations: section.max_observer_iterations,
            use_cache: section.use_cache,
            chain: ChainConfig {
                max_compaction_retries: compaction.max_retries,
                call_timeout: Duration::from_secs(section.call_timeout_secs),
                target_reduction: if compaction.target_reduction.is_finite() {
                    compaction.target_reduction.clamp(0.05, 0.95)
                } else {
                    default_target_reduction()
                },
                context_window_tokens: Some(compaction.context_window_tokens),
            },
            recovery: RecoveryConfig {
                enabled: recovery.enabled,
                max_attempts: recovery.max_attempts,
                attempt_timeout: recovery_timeout(recovery.timeout_minutes),
                auto_revert_on_failure: recovery.auto_revert_on_failure,
            },
            agents: self.toml.agents.to_map(),
        }
    }

    /// Builder wired to this project: session history and plan cache under
    /// `.weaver/`, files written relative to the project directory.
    /// Callers still register their backends.
    pub fn orchestrator_builder(&self) -> OrchestratorBuilder {
        let mut builder = Orchestrator::builder(self.orchestrator_config())
            .history(HistoryStore::new(&self.weaver_dir))
            .pricing(self.pricing())
            .workspace(Arc::new(LocalWorkspace::new(&self.project_dir)));
        if self.toml.orchestrator.use_cache {
            builder = builder.cache(ResultCache::open(&self.cache_file()));
        }
        builder
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        warnings.extend(self.env.warnings.iter().cloned());
        warnings
    }
}
