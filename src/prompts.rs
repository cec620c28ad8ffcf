//! Prompt builders and response parsers.
//!
//! The orchestrator sends whatever [`PromptKit`] builds verbatim and consumes the
//! typed structures its parsers return. [`PlainPrompts`] is a small line-based
//! default; embedders with richer prompt content supply their own kit.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static FILE_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:FILE:|[-*]|\d+[.)])\s*`?([A-Za-z0-9_./\-]+\.[A-Za-z0-9]+)`?\s*(?:[-:].*)?$")
        .unwrap()
});

static ISSUE_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(ISSUE|UNFIXABLE)(?:\s+`?([^\s:`]+)`?)?\s*:\s*(.+?)\s*$").unwrap()
});

/// The architect's plan: which files to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    pub files: Vec<String>,
    /// Response text the plan was parsed from (or the user's edited text).
    pub raw: String,
}

/// One problem reported by an auditor or validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub description: String,
    pub fixable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Approved,
    NeedsWork,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub status: VerdictStatus,
    pub issues: Vec<Issue>,
}

impl AuditVerdict {
    pub fn approved() -> Self {
        Self {
            status: VerdictStatus::Approved,
            issues: Vec::new(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == VerdictStatus::Approved
    }

    /// Issues for `path`, plus file-less issues when only one file was audited.
    pub fn issues_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a Issue> + 'a {
        self.issues
            .iter()
            .filter(move |i| i.file.as_deref().is_none_or(|f| f == path))
    }
}

/// Builds the text sent to each role and parses what comes back.
pub trait PromptKit: Send + Sync {
    fn plan_prompt(&self, task: &str) -> String;

    fn execute_prompt(
        &self,
        task: &str,
        plan: &Plan,
        path: &str,
        existing: Option<&str>,
        feedback: &[Issue],
    ) -> String;

    fn audit_prompt(&self, task: &str, path: &str, content: &str) -> String;

    /// Whole-batch review run after every item reached a terminal state.
    fn batch_audit_prompt(&self, task: &str, files: &[(String, String)]) -> String;

    fn recovery_prompt(&self, path: &str, content: &str, reason: &str, issues: &[Issue])
    -> String;

    fn parse_plan(&self, task: &str, response: &str) -> Plan;

    fn parse_verdict(&self, response: &str) -> AuditVerdict;

    /// Pull the file body out of a generation response.
    fn extract_content(&self, response: &str) -> String;
}

/// Line-oriented default prompts.
#[derive(Debug, Clone, Default)]
pub struct PlainPrompts;

impl PlainPrompts {
    fn render_issues(issues: &[Issue]) -> String {
        issues
            .iter()
            .map(|i| match &i.file {
                Some(f) => format!("- {}: {}", f, i.description),
                None => format!("- {}", i.description),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl PromptKit for PlainPrompts {
    fn plan_prompt(&self, task: &str) -> String {
        format!(
            "Plan the following task.\n\nTask: {}\n\n\
             Reply with a one-line summary, then one line per file to create or modify \
             in the form `FILE: <path>`.",
            task
        )
    }

    fn execute_prompt(
        &self,
        task: &str,
        plan: &Plan,
        path: &str,
        existing: Option<&str>,
        feedback: &[Issue],
    ) -> String {
        let mut prompt = format!(
            "Task: {}\nPlan: {}\n\nWrite the complete contents of `{}`. \
             Return only the file inside a single fenced code block.\n",
            task, plan.summary, path
        );
        if let Some(existing) = existing {
            prompt.push_str(&format!("\nCurrent contents:\n```\n{}\n```\n", existing));
        }
        if !feedback.is_empty() {
            prompt.push_str(&format!(
                "\nFix these review findings:\n{}\n",
                Self::render_issues(feedback)
            ));
        }
        prompt
    }

    fn audit_prompt(&self, task: &str, path: &str, content: &str) -> String {
        format!(
            "Review `{}` for the task: {}\n\n```\n{}\n```\n\n\
             Reply APPROVED, or NEEDS_WORK followed by lines `ISSUE <path>: <problem>` \
             (use UNFIXABLE instead of ISSUE for problems a rewrite cannot fix).",
            path, task, content
        )
    }

    fn batch_audit_prompt(&self, task: &str, files: &[(String, String)]) -> String {
        let mut prompt = format!(
            "Review these files together for the task: {}\n\n\
             Reply APPROVED, or NEEDS_WORK followed by lines `ISSUE <path>: <problem>`.\n",
            task
        );
        for (path, content) in files {
            prompt.push_str(&format!("\n### {}\n```\n{}\n```\n", path, content));
        }
        prompt
    }

    fn recovery_prompt(
        &self,
        path: &str,
        content: &str,
        reason: &str,
        issues: &[Issue],
    ) -> String {
        let mut prompt = format!(
            "The generated file `{}` is broken: {}.\n\n```\n{}\n```\n\n\
             Return the complete, corrected file inside a single fenced code block.\n",
            path, reason, content
        );
        if !issues.is_empty() {
            prompt.push_str(&format!("\nKnown problems:\n{}\n", Self::render_issues(issues)));
        }
        prompt
    }

    fn parse_plan(&self, task: &str, response: &str) -> Plan {
        let mut files: Vec<String> = Vec::new();
        let mut summary = None;
        for line in response.lines() {
            if let Some(caps) = FILE_LINE_REGEX.captures(line) {
                let path = caps[1].trim_start_matches("./").to_string();
                if !files.contains(&path) {
                    files.push(path);
                }
            } else if summary.is_none() && !line.trim().is_empty() {
                summary = Some(line.trim().trim_start_matches('#').trim().to_string());
            }
        }
        Plan {
            summary: summary.unwrap_or_else(|| task.to_string()),
            files,
            raw: response.to_string(),
        }
    }

    fn parse_verdict(&self, response: &str) -> AuditVerdict {
        let upper = response.to_uppercase();
        let needs_work = upper.contains("NEEDS_WORK") || upper.contains("NEEDS WORK");
        let issues: Vec<Issue> = response
            .lines()
            .filter_map(|line| ISSUE_LINE_REGEX.captures(line))
            .map(|caps| Issue {
                file: caps.get(2).map(|m| m.as_str().to_string()),
                description: caps[3].to_string(),
                fixable: &caps[1] == "ISSUE",
            })
            .collect();

        if needs_work || !issues.is_empty() {
            AuditVerdict {
                status: VerdictStatus::NeedsWork,
                issues,
            }
        } else {
            AuditVerdict::approved()
        }
    }

    fn extract_content(&self, response: &str) -> String {
        let Some(open) = response.find("```") else {
            return response.trim_matches('\n').to_string();
        };
        let after_fence = &response[open + 3..];
        // Skip the info string (language tag) on the fence line.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
        let body = &after_fence[body_start..];
        let close = if body.starts_with("```") {
            Some(0)
        } else {
            body.find("\n```")
        };
        match close {
            Some(close) => body[..close].trim_end_matches('\n').to_string(),
            // Truncated response: keep what arrived so validation can flag it.
            None => body.trim_end_matches('\n').to_string(),
        }
    }
}
