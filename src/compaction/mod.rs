//! Prompt compaction and backend error classification.
//!
//! When a backend rejects a prompt as too large, the fallback chain asks this
//! module to shrink it. [`compact_prompt`] runs a fixed sequence of increasingly
//! lossy strategies and stops as soon as the target reduction is reached:
//!
//! 1. whitespace normalization (structural newlines and code indentation survive)
//! 2. duplicate sentence / instruction removal
//! 3. summarization of fenced code blocks longer than 500 characters
//! 4. removal of verbose filler phrases
//! 5. importance-ranked sentence pruning
//!
//! No strategy result is accepted unless it is strictly shorter, so compaction
//! never grows a prompt, and text that is already minimal comes back unchanged.
//!
//! ## Configuration
//!
//! ```toml
//! [compaction]
//! max_retries = 2            # compaction retries per logical call
//! target_reduction = 0.5     # fraction of the prompt to try to remove
//! context_window_tokens = 128000
//! ```

mod classifier;
mod strategies;

pub use classifier::{ErrorClassifier, PatternClassifier};
pub use strategies::{
    dedupe_sentences, normalize_whitespace, prune_sentences, remove_filler,
    summarize_code_blocks, CODE_BLOCK_SUMMARY_THRESHOLD,
};

use serde::{Deserialize, Serialize};

/// Characters per token used for estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fraction of the context window a prompt may use before it is considered too large.
pub const CONTEXT_SAFETY_RATIO: f64 = 0.8;

/// Default fraction of the prompt `compact_prompt` tries to remove.
pub const DEFAULT_TARGET_REDUCTION: f64 = 0.5;

/// Compaction retries shared across one logical call.
pub const DEFAULT_MAX_COMPACTION_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionResult {
    pub original_length: usize,
    pub compacted_length: usize,
    pub reduction_percent: f64,
    pub compacted_prompt: String,
}

impl CompactionResult {
    pub fn reduced(&self) -> bool {
        self.compacted_length < self.original_length
    }
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// True when the estimate exceeds 80% of `max_tokens`.
pub fn would_exceed_context(text: &str, max_tokens: usize) -> bool {
    estimate_tokens(text) as f64 > CONTEXT_SAFETY_RATIO * max_tokens as f64
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Shrink `prompt` toward `target_reduction` (0.0..=1.0) of its length.
pub fn compact_prompt(prompt: &str, target_reduction: f64) -> CompactionResult {
    let target_reduction = if target_reduction.is_finite() {
        target_reduction.clamp(0.0, 1.0)
    } else {
        DEFAULT_TARGET_REDUCTION
    };
    let original_length = char_len(prompt);
    let target_length = (original_length as f64 * (1.0 - target_reduction)).floor() as usize;
    let keep_fraction = (1.0 - target_reduction).clamp(0.3, 0.9);

    let strategies: [(&str, Box<dyn Fn(&str) -> String>); 5] = [
        ("whitespace", Box::new(normalize_whitespace)),
        ("dedupe", Box::new(dedupe_sentences)),
        ("code-blocks", Box::new(summarize_code_blocks)),
        ("filler", Box::new(remove_filler)),
        ("prune", Box::new(move |t: &str| prune_sentences(t, keep_fraction))),
    ];

    let mut text = prompt.to_string();
    let mut length = original_length;
    for (name, strategy) in &strategies {
        if length <= target_length {
            break;
        }
        let next = strategy(&text);
        let next_length = char_len(&next);
        if next_length < length {
            tracing::debug!(strategy = name, before = length, after = next_length, "Compaction step applied");
            text = next;
            length = next_length;
        }
    }

    let reduction_percent = if original_length == 0 {
        0.0
    } else {
        (original_length - length) as f64 / original_length as f64 * 100.0
    };

    CompactionResult {
        original_length,
        compacted_length: length,
        reduction_percent,
        compacted_prompt: text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verbose_prompt() -> String {
        let mut prompt = String::from("# Task\n\n");
        prompt.push_str("Please note that you must implement the parser module.   \n\n\n\n");
        for _ in 0..5 {
            prompt.push_str("Make sure the output is valid JSON. ");
        }
        prompt.push('\n');
        prompt.push_str("It is important to note that the weather today is pleasant. ");
        prompt.push_str("Basically, the history of parsers is long and winding. ");
        prompt.push_str("Create a function named parse that returns a Result. ");
        prompt.push_str("Some people enjoy reading about compilers in their spare time. ");
        prompt.push_str("Add tests for every error branch.\n\n```rust\n");
        prompt.push_str("pub fn parse(input: &str) -> Result<Ast, Error> {\n");
        for i in 0..40 {
            prompt.push_str(&format!("    let step_{} = tokenize(input, {});\n", i, i));
        }
        prompt.push_str("}\n```\n");
        prompt
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_would_exceed_context_threshold() {
        // 100 tokens against a 125 token window is exactly the 80% line.
        let text = "x".repeat(400);
        assert!(!would_exceed_context(&text, 125));
        assert!(would_exceed_context(&format!("{}yyyy", text), 125));
        assert!(would_exceed_context(&text, 100));
    }

    #[test]
    fn test_would_exceed_context_is_monotonic() {
        let mut previous = false;
        for len in 0..2_000 {
            let now = would_exceed_context(&"a".repeat(len), 300);
            assert!(!previous || now, "dropped back to false at len {}", len);
            previous = now;
        }
    }

    #[test]
    fn test_compact_reduces_verbose_prompt() {
        let prompt = verbose_prompt();
        let result = compact_prompt(&prompt, DEFAULT_TARGET_REDUCTION);
        assert_eq!(result.original_length, prompt.chars().count());
        assert!(result.compacted_length < result.original_length);
        assert!(result.reduction_percent > 0.0);
        assert_eq!(result.compacted_length, result.compacted_prompt.chars().count());
        // Signatures of summarized code survive.
        assert!(result.compacted_prompt.contains("pub fn parse(input: &str)"));
    }

    #[test]
    fn test_compact_never_grows() {
        let inputs = [
            String::new(),
            "a".into(),
            "Fix the bug.".into(),
            "   lots   of    spaces   ".into(),
            verbose_prompt(),
            "```\nunterminated fence".into(),
            "重复的句子。重复的句子。".into(),
        ];
        for input in &inputs {
            let result = compact_prompt(input, 0.9);
            assert!(result.compacted_length <= input.chars().count(), "grew: {:?}", input);
        }
    }

    #[test]
    fn test_compact_idempotent_floor() {
        let minimal = "Fix the off-by-one error in src/lib.rs.";
        let first = compact_prompt(minimal, DEFAULT_TARGET_REDUCTION);
        assert_eq!(first.compacted_prompt, minimal);
        assert_eq!(first.reduction_percent, 0.0);

        let twice = compact_prompt(&first.compacted_prompt, DEFAULT_TARGET_REDUCTION);
        assert_eq!(twice.compacted_prompt, first.compacted_prompt);
    }

    #[test]
    fn test_compact_repeated_application_is_non_increasing() {
        let mut text = verbose_prompt();
        for _ in 0..5 {
            let result = compact_prompt(&text, DEFAULT_TARGET_REDUCTION);
            assert!(result.compacted_length <= text.chars().count());
            text = result.compacted_prompt;
        }
    }

    #[test]
    fn test_zero_target_is_noop() {
        let prompt = verbose_prompt();
        let result = compact_prompt(&prompt, 0.0);
        assert_eq!(result.compacted_prompt, prompt);
        assert!(!result.reduced());
    }
}
