//! Session inspection commands: `weaver status`, `weaver history`, `weaver clean`.

use anyhow::{Context, Result};
use weaver::config::WeaverConfig;
use weaver::state::{HistoryStore, ListFilter, Phase, SessionRecord, SessionSummary, WorkItemStatus};

use super::super::HistoryCommands;

fn history(config: &WeaverConfig) -> HistoryStore {
    HistoryStore::new(&config.weaver_dir)
}

fn phase_style(phase: Phase) -> console::StyledObject<&'static str> {
    let style = console::style(phase.as_str());
    match phase {
        Phase::Complete => style.green(),
        Phase::Error => style.red(),
        Phase::Idle => style.dim(),
        _ => style.yellow(),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn cmd_status(config: &WeaverConfig) -> Result<()> {
    let store = history(config);
    let latest = store
        .list(&ListFilter {
            limit: Some(1),
            ..Default::default()
        })
        .context("Failed to read session index")?;

    let Some(summary) = latest.into_iter().next() else {
        println!();
        println!("No sessions found in {}", store.sessions_dir().display());
        println!();
        return Ok(());
    };

    let record = store.load(&summary.id)?;
    print_record(&record);

    if let Some(resumable) = store.latest_resumable()?
        && resumable.id != summary.id
    {
        println!(
            "Latest resumable session: {} ({})",
            resumable.id,
            console::style(&resumable.task).dim()
        );
        println!();
    }
    Ok(())
}

pub fn cmd_history(config: &WeaverConfig, command: HistoryCommands) -> Result<()> {
    let store = history(config);
    match command {
        HistoryCommands::List {
            status,
            search,
            limit,
            json,
        } => {
            let phase = status.map(|s| s.parse::<Phase>()).transpose()?;
            let summaries = store.list(&ListFilter {
                phase,
                search,
                limit,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                print_summaries(&summaries);
            }
        }
        HistoryCommands::Show { id, json } => {
            let record = store.load(&id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }
        HistoryCommands::Delete { id } => {
            if store.delete(&id)? {
                println!("Deleted session {}", id);
            } else {
                anyhow::bail!("Session not found: {}", id);
            }
        }
    }
    Ok(())
}

pub fn cmd_clean(config: &WeaverConfig, id: Option<&str>) -> Result<()> {
    let store = history(config);
    match id {
        Some(id) => {
            store.clear(id)?;
            println!("Cleared session {}", id);
        }
        None => {
            let cleared = store.clear_all()?;
            println!("Cleared {} resumable session(s)", cleared);
        }
    }
    Ok(())
}

fn print_summaries(summaries: &[SessionSummary]) {
    println!();
    if summaries.is_empty() {
        println!("No sessions found.");
        println!();
        return;
    }
    println!(
        "{:<10} {:<18} {:<8} {:<17} Task",
        "Id", "Phase", "Files", "Last activity"
    );
    println!(
        "{:<10} {:<18} {:<8} {:<17} ----",
        "--------", "-----", "-----", "-------------"
    );
    for s in summaries {
        let resume = if s.can_resume { "*" } else { " " };
        println!(
            "{:<10} {:<18} {:<8} {:<17} {}",
            short_id(&s.id),
            format!("{}{}", phase_style(s.phase), resume),
            format!("{}/{}", s.completed_files, s.file_count),
            s.last_activity.format("%Y-%m-%d %H:%M"),
            s.task
        );
    }
    println!();
    println!("{}", console::style("* resumable").dim());
    println!();
}

fn print_record(record: &SessionRecord) {
    let session = &record.session;
    println!();
    println!("{}", console::style(format!("Session {}", session.id)).bold().cyan());
    println!("Task:       {}", session.task);
    println!("Phase:      {}", phase_style(session.phase));
    println!(
        "Iteration:  {}/{}",
        session.iteration, record.options.max_iterations
    );
    println!(
        "Mode:       {} (concurrency {})",
        record.options.mode, record.options.max_concurrency
    );
    println!("Started:    {}", session.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Resumable:  {}", if session.can_resume { "yes" } else { "no" });
    if let Some(error) = &session.last_error {
        println!("{} {}", console::style("Last error:").red().bold(), error);
    }

    if let Some(plan) = &record.plan {
        println!();
        println!("Plan: {}", plan.summary);
    }

    if !record.work_items.is_empty() {
        println!();
        println!("{:<40} {:<11} {:<9} Duration", "File", "Status", "Attempts");
        for item in &record.work_items {
            let status = match item.status {
                WorkItemStatus::Complete => console::style(item.status.as_str()).green(),
                WorkItemStatus::Error => console::style(item.status.as_str()).red(),
                WorkItemStatus::Reverted => console::style(item.status.as_str()).magenta(),
                _ => console::style(item.status.as_str()).yellow(),
            };
            println!(
                "{:<40} {:<11} {:<9} {}ms",
                item.path, status, item.attempts, item.duration_ms
            );
            if let Some(error) = &item.last_error {
                println!("  {}", console::style(error).dim());
            }
        }
    }

    println!();
    println!("Agents:");
    for slot in record.agents.values() {
        println!(
            "  {:<11} {:<9} [{}]{}",
            slot.role.as_str(),
            format!("{:?}", slot.status).to_lowercase(),
            slot.backends.join(" -> "),
            slot.last_backend
                .as_ref()
                .map(|b| format!(" last: {}", b))
                .unwrap_or_default()
        );
    }

    let metrics = &record.metrics;
    println!();
    println!(
        "Attempts: {} ({} ok, {} failed), fallbacks: {}, tokens: {}, est. cost: ${:.4}, avg latency: {:.0}ms",
        metrics.total_attempts,
        metrics.successful_attempts,
        metrics.failed_attempts,
        metrics.fallback_rotations,
        metrics.total_tokens,
        metrics.total_cost_estimate,
        metrics.avg_latency_ms
    );

    if let Some(last) = record.checkpoints.last() {
        println!(
            "Last checkpoint: {} ({}, {})",
            last.name,
            last.phase,
            last.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
}
