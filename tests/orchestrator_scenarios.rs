//! End-to-end sessions over scripted backends and an in-memory workspace.

mod common;

use common::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use weaver::backend::ChainConfig;
use weaver::backend::scripted::{Reply, ScriptedBackend};
use weaver::errors::ErrorCode;
use weaver::events::{Event, EventKind};
use weaver::orchestrator::{OrchestratorConfig, SessionOutcome, StartOptions};
use weaver::recovery::{REASON_UNCLOSED_BRACKET, RecoveryConfig, detect_incomplete};
use weaver::scheduler::ScheduleMode;
use weaver::state::{AgentRole, HistoryStore, Phase, WorkItemStatus};
use weaver::workspace::{MemoryWorkspace, Workspace};

const RATE_LIMITED: &str = "429 Too Many Requests: rate limit exceeded";
const TOO_LONG: &str = "This model's maximum context length is 8192 tokens";

fn consultant() -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::new("consultant"))
}

fn phases(events: Vec<Event>) -> Vec<Phase> {
    events
        .into_iter()
        .filter_map(|e| match e {
            Event::PhaseStart { phase } => Some(phase),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn scenario_a_parallel_batch_completes_without_fallback() {
    let files = ["src/one.rs", "src/two.rs", "src/three.rs"];
    let executor = Arc::new(valid_executor("primary").with_delay(Duration::from_millis(30)));
    let workspace = Arc::new(MemoryWorkspace::new());
    let orch = builder(
        auto_config(&["primary"]),
        &[architect(&files), executor.clone(), approving_auditor(), consultant()],
        workspace.clone(),
    )
    .build()
    .unwrap();
    let mut progress = orch.subscribe().only(&[EventKind::FileComplete]);

    let report = orch
        .start(
            "add three modules",
            StartOptions {
                mode: Some(ScheduleMode::Parallel),
                max_concurrency: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.phase, Phase::Complete);
    assert_eq!(report.completed_files.len(), 3);
    assert!(report.failed_files.is_empty());
    assert_eq!(report.metrics.fallback_rotations, 0);
    assert!(executor.max_in_flight() <= 2);
    for file in files {
        assert!(workspace.exists(file).await, "{} was not written", file);
    }

    let mut counters: Vec<usize> = progress
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            Event::FileComplete { current, total, .. } => {
                assert_eq!(total, 3);
                Some(current)
            }
            _ => None,
        })
        .collect();
    counters.sort();
    assert_eq!(counters, vec![1, 2, 3]);
}

#[tokio::test]
async fn scenario_b_context_exceeded_twice_then_compacted_success() {
    let task: String = (0..40)
        .map(|i| {
            format!(
                "Requirement {} asks the module to handle input variant number {} gracefully.",
                i,
                i * 7
            )
        })
        .collect::<Vec<_>>()
        .join(" ");
    let executor = Arc::new(
        ScriptedBackend::new("primary")
            .with_script([Reply::Fail(TOO_LONG.into()), Reply::Fail(TOO_LONG.into())])
            .with_responder(|_| Reply::Ok(fenced("pub fn handle() {}"))),
    );
    let orch = builder(
        auto_config(&["primary"]),
        &[
            architect(&["src/handle.rs"]),
            executor.clone(),
            approving_auditor(),
            consultant(),
        ],
        Arc::new(MemoryWorkspace::new()),
    )
    .build()
    .unwrap();

    let report = orch.start(&task, StartOptions::default()).await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Completed);

    let record = orch.current_session().await.unwrap();
    let step = record
        .steps
        .iter()
        .find(|s| s.agent_role == AgentRole::Executor)
        .unwrap();
    assert_eq!(step.usages.len(), 3);
    assert!(step.usages[..2].iter().all(|u| !u.success));
    assert_eq!(step.usages[0].error_code, Some(ErrorCode::ContextExceeded));
    assert!(step.usages[2].success);
    let lengths: Vec<usize> = step.usages.iter().map(|u| u.prompt_chars).collect();
    assert!(
        lengths.windows(2).all(|w| w[1] <= w[0]),
        "prompt grew: {:?}",
        lengths
    );
    assert!(lengths[2] < lengths[0]);
    assert_eq!(record.metrics.fallback_rotations, 0);
}

#[tokio::test]
async fn scenario_c_rate_limited_chain_fails_item_but_not_siblings() {
    let names = ["alpha", "beta", "gamma"];
    let executors: Vec<Arc<ScriptedBackend>> = names
        .iter()
        .map(|name| {
            let first = *name == "alpha";
            Arc::new(ScriptedBackend::new(name).with_responder(move |prompt| {
                match file_in_prompt(prompt).as_deref() {
                    Some("src/good.rs") if first => Reply::Ok(fenced("pub fn good() {}")),
                    _ => Reply::Fail(RATE_LIMITED.into()),
                }
            }))
        })
        .collect();
    let mut backends = vec![
        architect(&["src/good.rs", "src/bad.rs"]),
        approving_auditor(),
        consultant(),
    ];
    backends.extend(executors.iter().cloned());
    let orch = builder(auto_config(&names), &backends, Arc::new(MemoryWorkspace::new()))
        .build()
        .unwrap();
    let mut errors = orch.subscribe().only(&[EventKind::Error]);

    let report = orch
        .start(
            "good and bad",
            StartOptions {
                mode: Some(ScheduleMode::Sequential),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Failed);
    assert_eq!(report.phase, Phase::Error);
    assert_eq!(report.completed_files, vec!["src/good.rs"]);
    assert_eq!(report.failed_files, vec!["src/bad.rs"]);
    assert_eq!(report.metrics.fallback_rotations, names.len() as u64 - 1);

    let item_errors: Vec<Event> = errors
        .drain()
        .into_iter()
        .filter(|e| matches!(e, Event::Error { path: Some(_), .. }))
        .collect();
    assert!(matches!(
        &item_errors[0],
        Event::Error { code: ErrorCode::FatalChainExhausted, path: Some(p), .. } if p == "src/bad.rs"
    ));

    let record = orch.current_session().await.unwrap();
    let bad = record.item("src/bad.rs").unwrap();
    assert_eq!(bad.status, WorkItemStatus::Error);
    assert!(bad.last_error.as_ref().unwrap().contains("rate limit"));
    assert_eq!(record.fallbacks.len(), 2);
}

#[tokio::test]
async fn scenario_d_unclosed_bracket_is_recovered() {
    let broken = "fn main() {\n    println!(\"hi\");";
    let fixed = "fn main() {\n    println!(\"hi\");\n}";
    assert_eq!(
        detect_incomplete(broken).reason.as_deref(),
        Some(REASON_UNCLOSED_BRACKET)
    );

    let broken_reply = fenced(broken);
    let executor = Arc::new(
        ScriptedBackend::new("primary").with_responder(move |_| Reply::Ok(broken_reply.clone())),
    );
    let consultant = Arc::new(ScriptedBackend::new("consultant").with_script([Reply::Ok(fenced(fixed))]));
    let workspace = Arc::new(MemoryWorkspace::new());
    let orch = builder(
        auto_config(&["primary"]),
        &[
            architect(&["src/main.rs"]),
            executor,
            approving_auditor(),
            consultant.clone(),
        ],
        workspace.clone(),
    )
    .build()
    .unwrap();
    let mut events = orch.subscribe();

    let report = orch.start("say hi", StartOptions::default()).await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.completed_files, vec!["src/main.rs"]);
    assert_eq!(consultant.calls(), 1);
    assert_eq!(workspace.read_file("src/main.rs").await.unwrap(), fixed);

    let seen = events.drain();
    assert!(seen.iter().any(|e| matches!(
        e,
        Event::SyntaxCheck { valid: false, reason: Some(r), .. } if r == REASON_UNCLOSED_BRACKET
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        Event::RecoveryComplete { success: true, attempts: 1, .. }
    )));
    assert_eq!(
        phases(seen),
        vec![
            Phase::Planning,
            Phase::Executing,
            Phase::Recovery,
            Phase::Auditing,
            Phase::Complete
        ]
    );
}

#[tokio::test]
async fn scenario_e_exhausted_recovery_reverts_and_fails_session() {
    let broken = fenced("fn half(x: u32) -> u32 {\n    x / 2");
    let executor = Arc::new(
        ScriptedBackend::new("primary").with_responder(move |_| Reply::Ok(broken.clone())),
    );
    let consultant = Arc::new(
        ScriptedBackend::new("consultant")
            .with_responder(|_| Reply::Ok(fenced("fn still_broken() {"))),
    );
    let workspace = Arc::new(MemoryWorkspace::new().with_file("src/existing.rs", "// original\n"));
    let config = OrchestratorConfig {
        recovery: RecoveryConfig {
            max_attempts: 2,
            auto_revert_on_failure: true,
            ..Default::default()
        },
        ..auto_config(&["primary"])
    };
    let orch = builder(
        config,
        &[
            architect(&["src/existing.rs", "src/fresh.rs"]),
            executor,
            approving_auditor(),
            consultant.clone(),
        ],
        workspace.clone(),
    )
    .build()
    .unwrap();
    let mut reverts = orch
        .subscribe()
        .only(&[EventKind::FileReverted, EventKind::FileDeleted]);

    let report = orch
        .start(
            "halve numbers",
            StartOptions {
                mode: Some(ScheduleMode::Sequential),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Failed);
    assert_eq!(report.phase, Phase::Error);
    assert!(report.completed_files.is_empty());
    assert_eq!(report.failed_files.len(), 2);

    assert_eq!(
        workspace.read_file("src/existing.rs").await.unwrap(),
        "// original\n"
    );
    assert!(!workspace.exists("src/fresh.rs").await);
    let notices = reverts.drain();
    assert!(notices.contains(&Event::FileReverted {
        path: "src/existing.rs".into()
    }));
    assert!(notices.contains(&Event::FileDeleted {
        path: "src/fresh.rs".into()
    }));

    let record = orch.current_session().await.unwrap();
    for item in &record.work_items {
        assert_eq!(item.status, WorkItemStatus::Error);
        assert!(item.last_error.as_ref().unwrap().starts_with("RECOVERY_EXHAUSTED"));
    }

    // Never more consultant calls per item than the configured attempts.
    for path in ["src/existing.rs", "src/fresh.rs"] {
        let calls = consultant
            .prompts()
            .iter()
            .filter(|p| file_in_prompt(p).as_deref() == Some(path))
            .count();
        assert_eq!(calls, 2, "{}", path);
    }
}

#[tokio::test]
async fn parallel_mode_respects_concurrency_bound() {
    let files = ["src/a.rs", "src/b.rs", "src/c.rs", "src/d.rs", "src/e.rs"];
    let executor = Arc::new(valid_executor("primary").with_delay(Duration::from_millis(25)));
    let orch = builder(
        auto_config(&["primary"]),
        &[architect(&files), executor.clone(), approving_auditor(), consultant()],
        Arc::new(MemoryWorkspace::new()),
    )
    .build()
    .unwrap();

    let report = orch
        .start(
            "five modules",
            StartOptions {
                mode: Some(ScheduleMode::Parallel),
                max_concurrency: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(executor.max_in_flight() <= 2);
    assert!(executor.max_in_flight() >= 1);
    assert_eq!(report.completed_files.len() + report.failed_files.len(), files.len());
    assert_eq!(report.completed_files.len(), files.len());
}

#[tokio::test]
async fn pipeline_mode_completes_every_item() {
    let files = ["src/a.rs", "src/b.rs", "src/c.rs"];
    let auditor = Arc::new(
        ScriptedBackend::new("auditor")
            .with_delay(Duration::from_millis(20))
            .with_responder(|_| Reply::Ok("APPROVED".into())),
    );
    let orch = builder(
        auto_config(&["primary"]),
        &[
            architect(&files),
            Arc::new(valid_executor("primary")),
            auditor,
            consultant(),
        ],
        Arc::new(MemoryWorkspace::new()),
    )
    .build()
    .unwrap();

    let report = orch
        .start(
            "three modules",
            StartOptions {
                mode: Some(ScheduleMode::Pipeline),
                max_concurrency: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    let completed: BTreeSet<&str> = report.completed_files.iter().map(String::as_str).collect();
    assert_eq!(completed, files.into_iter().collect());
}

#[tokio::test]
async fn audit_feedback_triggers_another_iteration() {
    let auditor = Arc::new(
        ScriptedBackend::new("auditor")
            .with_script([
                // per-item review approves, batch audit asks for a fix
                Reply::Ok("APPROVED".into()),
                Reply::Ok("NEEDS_WORK\nISSUE src/lib.rs: missing docs".into()),
            ])
            .with_responder(|_| Reply::Ok("APPROVED".into())),
    );
    let executor = Arc::new(valid_executor("primary"));
    let orch = builder(
        auto_config(&["primary"]),
        &[architect(&["src/lib.rs"]), executor.clone(), auditor, consultant()],
        Arc::new(MemoryWorkspace::new()),
    )
    .build()
    .unwrap();
    let mut iterations = orch.subscribe().only(&[EventKind::Iteration]);

    let report = orch.start("library", StartOptions::default()).await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.iterations, 2);
    assert_eq!(iterations.drain().len(), 2);
    let prompts = executor.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("missing docs"));
}

#[tokio::test]
async fn cancel_during_execution_keeps_session_resumable() {
    let executor = Arc::new(ScriptedBackend::new("primary").with_responder(|_| Reply::Hang));
    let config = OrchestratorConfig {
        chain: ChainConfig {
            call_timeout: Duration::from_millis(300),
            ..ChainConfig::default()
        },
        ..auto_config(&["primary"])
    };
    let orch = builder(
        config,
        &[architect(&["src/slow.rs"]), executor, approving_auditor(), consultant()],
        Arc::new(MemoryWorkspace::new()),
    )
    .build()
    .unwrap();
    let mut started = orch.subscribe().only(&[EventKind::FileStart]);

    let runner = orch.clone();
    let handle = tokio::spawn(async move { runner.start("slow", StartOptions::default()).await });
    started.recv().await.unwrap();
    assert!(orch.cancel().await);

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert_eq!(report.phase, Phase::Executing);

    let record = orch.current_session().await.unwrap();
    assert!(record.session.can_resume);
    assert!(record.session.last_error.as_ref().unwrap().starts_with("CANCELLED"));
    let item = record.item("src/slow.rs").unwrap();
    assert!(!item.status.is_terminal());
}

#[tokio::test]
async fn crash_and_resume_restores_phase_and_terminal_items() {
    let dir = tempfile::tempdir().unwrap();
    let files = ["src/a.rs", "src/b.rs"];

    // First process: a completes, b hangs until the process "crashes".
    let hanging = Arc::new(ScriptedBackend::new("primary").with_responder(|prompt| {
        match file_in_prompt(prompt).as_deref() {
            Some("src/a.rs") => Reply::Ok(fenced("pub fn a() {}")),
            _ => Reply::Hang,
        }
    }));
    let workspace = Arc::new(MemoryWorkspace::new());
    let first = builder(
        auto_config(&["primary"]),
        &[architect(&files), hanging, approving_auditor(), consultant()],
        workspace.clone(),
    )
    .history(HistoryStore::new(dir.path()))
    .build()
    .unwrap();
    let mut starts = first.subscribe().only(&[EventKind::FileStart]);

    let runner = first.clone();
    let handle = tokio::spawn(async move {
        runner
            .start(
                "two files",
                StartOptions {
                    mode: Some(ScheduleMode::Sequential),
                    ..Default::default()
                },
            )
            .await
    });
    loop {
        match starts.recv().await.unwrap() {
            Event::FileStart { path, .. } if path == "src/b.rs" => break,
            _ => continue,
        }
    }
    handle.abort();
    let _ = handle.await;

    let history = HistoryStore::new(dir.path());
    let summary = history.latest_resumable().unwrap().unwrap();
    let before = history.load(&summary.id).unwrap();
    assert_eq!(before.session.phase, Phase::Executing);
    let terminal_before: BTreeSet<String> = before
        .work_items
        .iter()
        .filter(|i| i.status.is_terminal())
        .map(|i| i.path.clone())
        .collect();
    assert_eq!(terminal_before, BTreeSet::from(["src/a.rs".to_string()]));

    // Second process picks the session up from disk.
    let executor = Arc::new(valid_executor("primary"));
    let second = builder(
        auto_config(&["primary"]),
        &[architect(&files), executor.clone(), approving_auditor(), consultant()],
        workspace.clone(),
    )
    .history(HistoryStore::new(dir.path()))
    .build()
    .unwrap();
    let mut phase_events = second.subscribe().only(&[EventKind::PhaseStart]);

    let report = second.resume(&summary.id).await.unwrap();

    assert_eq!(phases(phase_events.drain())[0], Phase::Executing);
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.session_id, summary.id);
    assert!(
        executor
            .prompts()
            .iter()
            .all(|p| file_in_prompt(p).as_deref() == Some("src/b.rs"))
    );
    let after = history.load(&summary.id).unwrap();
    assert_eq!(after.session.phase, Phase::Complete);
    assert!(!after.session.can_resume);
    assert_eq!(after.item("src/a.rs").unwrap().attempts, before.item("src/a.rs").unwrap().attempts);
    assert!(matches!(
        second.resume(&summary.id).await,
        Err(weaver::OrchestratorError::NotResumable { .. })
    ));
}

#[tokio::test]
async fn finished_session_is_not_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let orch = builder(
        auto_config(&["primary"]),
        &[
            architect(&["src/a.rs"]),
            Arc::new(valid_executor("primary")),
            approving_auditor(),
            consultant(),
        ],
        Arc::new(MemoryWorkspace::new()),
    )
    .history(HistoryStore::new(dir.path()))
    .build()
    .unwrap();

    let report = orch.start("one file", StartOptions::default()).await.unwrap();
    orch.reset().await;

    assert!(matches!(
        orch.resume(&report.session_id).await,
        Err(weaver::OrchestratorError::NotResumable { .. })
    ));
}
