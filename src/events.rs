//! Typed event stream published by the orchestrator.
//!
//! Front ends subscribe through [`EventBus::subscribe`] and filter by
//! [`EventKind`]. Events serialize with a kebab-case `type` tag so the wire
//! names match the kind names exactly.

use crate::errors::ErrorCode;
use crate::state::{AgentRole, Phase, WorkItemStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    PhaseStart {
        phase: Phase,
    },
    PhaseComplete {
        phase: Phase,
    },
    FileStart {
        path: String,
        current: usize,
        total: usize,
    },
    FileComplete {
        path: String,
        status: WorkItemStatus,
        current: usize,
        total: usize,
    },
    SyntaxCheck {
        path: String,
        valid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ConsultantInvoked {
        path: String,
        attempt: u32,
    },
    AdapterFallback {
        role: AgentRole,
        from: String,
        to: String,
        reason: ErrorCode,
    },
    RecoveryStart {
        path: String,
        reason: String,
    },
    RecoveryAttempt {
        path: String,
        attempt: u32,
        max_attempts: u32,
    },
    RecoveryComplete {
        path: String,
        success: bool,
        attempts: u32,
    },
    FileReverted {
        path: String,
    },
    FileDeleted {
        path: String,
    },
    ObserverStart {
        iteration: u32,
    },
    ObserverRouteCapture {
        route: String,
    },
    ObserverRouteValidation {
        route: String,
        passed: bool,
        issues: usize,
    },
    ObserverComplete {
        passed: bool,
    },
    ObserverError {
        message: String,
    },
    PlanReady {
        summary: String,
        files: Vec<String>,
        requires_approval: bool,
    },
    Iteration {
        iteration: u32,
        max_iterations: u32,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

/// Discriminant of [`Event`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PhaseStart,
    PhaseComplete,
    FileStart,
    FileComplete,
    SyntaxCheck,
    ConsultantInvoked,
    AdapterFallback,
    RecoveryStart,
    RecoveryAttempt,
    RecoveryComplete,
    FileReverted,
    FileDeleted,
    ObserverStart,
    ObserverRouteCapture,
    ObserverRouteValidation,
    ObserverComplete,
    ObserverError,
    PlanReady,
    Iteration,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PhaseStart => "phase-start",
            EventKind::PhaseComplete => "phase-complete",
            EventKind::FileStart => "file-start",
            EventKind::FileComplete => "file-complete",
            EventKind::SyntaxCheck => "syntax-check",
            EventKind::ConsultantInvoked => "consultant-invoked",
            EventKind::AdapterFallback => "adapter-fallback",
            EventKind::RecoveryStart => "recovery-start",
            EventKind::RecoveryAttempt => "recovery-attempt",
            EventKind::RecoveryComplete => "recovery-complete",
            EventKind::FileReverted => "file-reverted",
            EventKind::FileDeleted => "file-deleted",
            EventKind::ObserverStart => "observer-start",
            EventKind::ObserverRouteCapture => "observer-route-capture",
            EventKind::ObserverRouteValidation => "observer-route-validation",
            EventKind::ObserverComplete => "observer-complete",
            EventKind::ObserverError => "observer-error",
            EventKind::PlanReady => "plan-ready",
            EventKind::Iteration => "iteration",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PhaseStart { .. } => EventKind::PhaseStart,
            Event::PhaseComplete { .. } => EventKind::PhaseComplete,
            Event::FileStart { .. } => EventKind::FileStart,
            Event::FileComplete { .. } => EventKind::FileComplete,
            Event::SyntaxCheck { .. } => EventKind::SyntaxCheck,
            Event::ConsultantInvoked { .. } => EventKind::ConsultantInvoked,
            Event::AdapterFallback { .. } => EventKind::AdapterFallback,
            Event::RecoveryStart { .. } => EventKind::RecoveryStart,
            Event::RecoveryAttempt { .. } => EventKind::RecoveryAttempt,
            Event::RecoveryComplete { .. } => EventKind::RecoveryComplete,
            Event::FileReverted { .. } => EventKind::FileReverted,
            Event::FileDeleted { .. } => EventKind::FileDeleted,
            Event::ObserverStart { .. } => EventKind::ObserverStart,
            Event::ObserverRouteCapture { .. } => EventKind::ObserverRouteCapture,
            Event::ObserverRouteValidation { .. } => EventKind::ObserverRouteValidation,
            Event::ObserverComplete { .. } => EventKind::ObserverComplete,
            Event::ObserverError { .. } => EventKind::ObserverError,
            Event::PlanReady { .. } => EventKind::PlanReady,
            Event::Iteration { .. } => EventKind::Iteration,
            Event::Error { .. } => EventKind::Error,
        }
    }
}

/// Broadcast publisher. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: Event) {
        tracing::trace!(kind = %event.kind(), "event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            kinds: None,
        }
    }
}

/// A subscription, optionally restricted to some kinds.
pub struct EventStream {
    receiver: broadcast::Receiver<Event>,
    kinds: Option<Vec<EventKind>>,
}

impl EventStream {
    pub fn only(mut self, kinds: &[EventKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    fn wanted(&self, event: &Event) -> bool {
        self.kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&event.kind()))
    }

    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wanted(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain whatever is already queued without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.wanted(&event) {
                        events.push(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged; events dropped");
                }
                Err(_) => return events,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_names_match_kinds() {
        let events = vec![
            Event::PhaseStart {
                phase: Phase::Planning,
            },
            Event::ObserverRouteValidation {
                route: "/".into(),
                passed: true,
                issues: 0,
            },
            Event::AdapterFallback {
                role: AgentRole::Executor,
                from: "a".into(),
                to: "b".into(),
                reason: ErrorCode::RateLimit,
            },
            Event::FileDeleted { path: "x".into() },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind().as_str());
        }
    }

    #[test]
    fn test_event_roundtrip() {
        let event = Event::FileComplete {
            path: "src/a.rs".into(),
            status: WorkItemStatus::Complete,
            current: 1,
            total: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"file-complete\""));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = EventBus::new();
        let mut files = bus.subscribe().only(&[EventKind::FileStart]);
        let mut all = bus.subscribe();

        bus.emit(Event::PhaseStart {
            phase: Phase::Executing,
        });
        bus.emit(Event::FileStart {
            path: "a".into(),
            current: 1,
            total: 1,
        });

        assert_eq!(files.recv().await.unwrap().kind(), EventKind::FileStart);
        let drained = all.drain();
        assert_eq!(drained.len(), 2);
        assert!(files.drain().is_empty());
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new().emit(Event::ObserverError {
            message: "nobody listening".into(),
        });
    }
}
