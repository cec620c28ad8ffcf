//! Shared helpers for orchestrator scenario tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use weaver::backend::scripted::{Reply, ScriptedBackend};
use weaver::orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig};
use weaver::state::AgentRole;
use weaver::workspace::MemoryWorkspace;

/// Architect reply listing `files`.
pub fn plan_reply(files: &[&str]) -> String {
    let mut reply = String::from("Implement the requested change\n");
    for file in files {
        reply.push_str(&format!("FILE: {}\n", file));
    }
    reply
}

pub fn fenced(body: &str) -> String {
    format!("```rust\n{}\n```", body)
}

/// The first back-quoted path in a generated prompt.
pub fn file_in_prompt(prompt: &str) -> Option<String> {
    let start = prompt.find('`')? + 1;
    let len = prompt[start..].find('`')?;
    Some(prompt[start..start + len].to_string())
}

pub fn architect(files: &[&str]) -> Arc<ScriptedBackend> {
    let reply = plan_reply(files);
    Arc::new(ScriptedBackend::new("architect").with_responder(move |_| Reply::Ok(reply.clone())))
}

pub fn approving_auditor() -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::new("auditor").with_responder(|_| Reply::Ok("APPROVED".into())))
}

/// Executor that writes a small valid function named after each file.
pub fn valid_executor(name: &str) -> ScriptedBackend {
    ScriptedBackend::new(name).with_responder(|prompt| {
        let file = file_in_prompt(prompt).unwrap_or_default();
        let ident = file
            .rsplit('/')
            .next()
            .unwrap_or("x")
            .trim_end_matches(".rs")
            .replace(['-', '.'], "_");
        Reply::Ok(fenced(&format!("pub fn {}() -> u32 {{\n    42\n}}", ident)))
    })
}

/// Role chains: one named backend per role, the executor role gets `executors`.
pub fn agents(executors: &[&str]) -> BTreeMap<AgentRole, Vec<String>> {
    let mut agents = BTreeMap::new();
    agents.insert(AgentRole::Architect, vec!["architect".to_string()]);
    agents.insert(
        AgentRole::Executor,
        executors.iter().map(|e| e.to_string()).collect(),
    );
    agents.insert(AgentRole::Auditor, vec!["auditor".to_string()]);
    agents.insert(AgentRole::Consultant, vec!["consultant".to_string()]);
    agents
}

pub fn auto_config(executors: &[&str]) -> OrchestratorConfig {
    OrchestratorConfig {
        auto_approve: true,
        agents: agents(executors),
        ..Default::default()
    }
}

/// Builder with every backend registered and an in-memory workspace.
pub fn builder(
    config: OrchestratorConfig,
    backends: &[Arc<ScriptedBackend>],
    workspace: Arc<MemoryWorkspace>,
) -> OrchestratorBuilder {
    let mut builder = Orchestrator::builder(config).workspace(workspace);
    for backend in backends {
        builder = builder.backend(backend.clone());
    }
    builder
}
