//! Configuration view and validation commands: `weaver config`.

use anyhow::Result;
use weaver::config::{WeaverConfig, WeaverToml};
use weaver::state::AgentRole;

use super::super::ConfigCommands;

pub fn cmd_config(config: &WeaverConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Weaver Configuration");
            println!("====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No weaver.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let toml = &config.toml;
            println!("[orchestrator]");
            println!("  max_iterations = {}", toml.orchestrator.max_iterations);
            println!("  auto_approve = {}", toml.orchestrator.auto_approve);
            println!("  mode = \"{}\"", toml.orchestrator.mode);
            println!("  max_concurrency = {}", toml.orchestrator.max_concurrency);
            println!("  call_timeout_secs = {}", toml.orchestrator.call_timeout_secs);
            println!("  max_fix_attempts = {}", toml.orchestrator.max_fix_attempts);
            println!(
                "  max_observer_iterations = {}",
                toml.orchestrator.max_observer_iterations
            );
            println!("  use_cache = {}", toml.orchestrator.use_cache);
            println!();
            println!("[compaction]");
            println!("  max_retries = {}", toml.compaction.max_retries);
            println!("  target_reduction = {}", toml.compaction.target_reduction);
            println!(
                "  context_window_tokens = {}",
                toml.compaction.context_window_tokens
            );
            println!();
            println!("[recovery]");
            println!("  enabled = {}", toml.recovery.enabled);
            println!("  max_attempts = {}", toml.recovery.max_attempts);
            println!("  timeout_minutes = {}", toml.recovery.timeout_minutes);
            println!(
                "  auto_revert_on_failure = {}",
                toml.recovery.auto_revert_on_failure
            );
            println!();
            println!("[agents]");
            for role in AgentRole::ALL {
                match toml.agents.get(role) {
                    Some(names) => println!("  {} = {:?}", role, names),
                    None => println!("  {} = (all registered backends)", role),
                }
            }
            if !toml.pricing.per_1k_tokens.is_empty() {
                println!();
                println!("[pricing]");
                let mut prices: Vec<_> = toml.pricing.per_1k_tokens.iter().collect();
                prices.sort_by(|a, b| a.0.cmp(b.0));
                for (backend, price) in prices {
                    println!("  {} = {}", backend, price);
                }
            }
            println!();

            println!("Effective values (with env overrides):");
            println!("  mode = \"{}\"", config.mode());
            println!("  max_concurrency = {}", config.max_concurrency());
            println!("  auto_approve = {}", config.auto_approve());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                if config_path.exists() {
                    println!("Configuration is valid.");
                } else {
                    println!("No weaver.toml found. Using defaults (valid).");
                }
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("weaver.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            WeaverToml::default().save(&config_path)?;

            println!("Created weaver.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [orchestrator] mode, max_concurrency, max_iterations");
            println!("  - [agents] backend fallback order per role");
            println!("  - [recovery] attempts, timeout and auto-revert");
            println!();
        }
    }

    Ok(())
}
