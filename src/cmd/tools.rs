//! Offline tools: `weaver compact` and `weaver check`.

use anyhow::{Context, Result};
use std::path::Path;
use weaver::compaction::{compact_prompt, estimate_tokens};
use weaver::recovery::detect_incomplete;

pub fn cmd_compact(file: &Path, target: f64, json: bool) -> Result<()> {
    if !(target > 0.0 && target < 1.0) {
        anyhow::bail!("--target must be between 0 and 1, got {}", target);
    }
    let prompt = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let result = compact_prompt(&prompt, target);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!();
    println!("{}", console::style("Prompt Compaction").bold().cyan());
    println!("File:      {}", file.display());
    println!(
        "Original:  {} chars (~{} tokens)",
        result.original_length,
        estimate_tokens(&prompt)
    );
    println!(
        "Compacted: {} chars (~{} tokens)",
        result.compacted_length,
        estimate_tokens(&result.compacted_prompt)
    );
    if result.reduced() {
        println!("Reduction: {:.1}%", result.reduction_percent);
    } else {
        println!("{}", console::style("Already minimal; nothing removed.").dim());
    }
    println!();
    Ok(())
}

pub fn cmd_check(file: &Path) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let check = detect_incomplete(&code);

    if let Some(error) = check.code() {
        anyhow::bail!(
            "{} failed check [{}]: {}",
            file.display(),
            error,
            check.reason.unwrap_or_default()
        );
    }
    println!("{} {}", console::style("ok").green(), file.display());
    Ok(())
}
