//! Single-writer session store.
//!
//! One background task owns the [`SessionRecord`]. Workers send closures over a
//! channel; the writer applies each one, refreshes `last_activity`, persists the
//! whole record through [`HistoryStore`] and only then acknowledges. Concurrent
//! producers therefore never interleave partial updates, and every acknowledged
//! mutation is already durable.

use super::history::HistoryStore;
use super::types::{
    AgentRole, AgentStatus, Checkpoint, Phase, SessionRecord, TaskStep, WorkItem,
};
use crate::backend::FallbackEvent;
use crate::errors::StoreError;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&mut SessionRecord) + Send>;

enum Command {
    Mutate {
        job: Job,
        ack: oneshot::Sender<Result<(), StoreError>>,
    },
    Read(oneshot::Sender<SessionRecord>),
}

/// Spawns the writer task for a session record.
pub struct SessionStore;

impl SessionStore {
    /// Start the writer. With `history = None` the record lives only in memory.
    pub fn spawn(record: SessionRecord, history: Option<HistoryStore>) -> StoreHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = record.session.id.clone();
        tokio::spawn(writer_loop(record, history, rx));
        StoreHandle { id, sender: tx }
    }
}

async fn writer_loop(
    mut record: SessionRecord,
    history: Option<HistoryStore>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Mutate { job, ack } => {
                job(&mut record);
                record.session.touch();
                let result = match &history {
                    Some(history) => persist(history.clone(), record.clone()).await,
                    None => Ok(()),
                };
                if let Err(e) = &result {
                    tracing::error!(session = %record.session.id, error = %e, "Failed to persist session");
                }
                let _ = ack.send(result);
            }
            Command::Read(reply) => {
                let _ = reply.send(record.clone());
            }
        }
    }
    tracing::debug!(session = %record.session.id, "Session writer stopped");
}

async fn persist(history: HistoryStore, record: SessionRecord) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || history.save(&record))
        .await
        .map_err(|_| StoreError::WriterClosed)?
}

/// Cloneable handle used by every producer of session updates.
#[derive(Clone)]
pub struct StoreHandle {
    id: String,
    sender: mpsc::UnboundedSender<Command>,
}

impl StoreHandle {
    pub fn session_id(&self) -> &str {
        &self.id
    }

    /// Apply `f` on the writer and wait until the result is persisted.
    pub async fn update<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut SessionRecord) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (value_tx, value_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let job: Job = Box::new(move |record| {
            let _ = value_tx.send(f(record));
        });
        self.sender
            .send(Command::Mutate { job, ack: ack_tx })
            .map_err(|_| StoreError::WriterClosed)?;
        ack_rx.await.map_err(|_| StoreError::WriterClosed)??;
        value_rx.await.map_err(|_| StoreError::WriterClosed)
    }

    /// A consistent copy of the current record.
    pub async fn snapshot(&self) -> Result<SessionRecord, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Read(tx))
            .map_err(|_| StoreError::WriterClosed)?;
        rx.await.map_err(|_| StoreError::WriterClosed)
    }

    pub async fn set_phase(&self, phase: Phase) -> Result<(), StoreError> {
        self.update(move |r| r.session.phase = phase).await
    }

    pub async fn set_last_error(&self, message: Option<String>) -> Result<(), StoreError> {
        self.update(move |r| r.session.last_error = message).await
    }

    pub async fn checkpoint(&self, name: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        self.update(move |r| {
            let phase = r.session.phase;
            r.checkpoints.push(Checkpoint {
                name,
                phase,
                timestamp: Utc::now(),
            });
        })
        .await
    }

    pub async fn set_agent_status(
        &self,
        role: AgentRole,
        status: AgentStatus,
        last_backend: Option<String>,
    ) -> Result<(), StoreError> {
        self.update(move |r| {
            if let Some(slot) = r.agents.get_mut(&role) {
                slot.status = status;
                if last_backend.is_some() {
                    slot.last_backend = last_backend;
                }
            }
        })
        .await
    }

    /// Replace the work item list, keeping state for paths already known.
    pub async fn set_work_items(&self, paths: Vec<String>) -> Result<(), StoreError> {
        self.update(move |r| {
            let mut items = Vec::with_capacity(paths.len());
            for path in paths {
                let existing = r.work_items.iter().find(|i| i.path == path).cloned();
                items.push(existing.unwrap_or_else(|| WorkItem::new(path)));
            }
            r.work_items = items;
        })
        .await
    }

    /// Mutate one work item. Returns `None` if the path is unknown.
    pub async fn update_item<F>(&self, path: &str, f: F) -> Result<Option<WorkItem>, StoreError>
    where
        F: FnOnce(&mut WorkItem) + Send + 'static,
    {
        let path = path.to_string();
        self.update(move |r| {
            r.item_mut(&path).map(|item| {
                f(item);
                item.clone()
            })
        })
        .await
    }

    /// Append a finished step together with the fallbacks its call rotated through.
    pub async fn record_step(
        &self,
        step: TaskStep,
        fallbacks: Vec<FallbackEvent>,
    ) -> Result<(), StoreError> {
        self.update(move |r| {
            r.metrics.record_fallbacks(fallbacks.len() as u64);
            r.fallbacks.extend(fallbacks);
            r.append_step(step);
        })
        .await
    }

    /// Remember a file's pre-session content the first time it is touched.
    pub async fn capture_snapshot(
        &self,
        path: &str,
        content: Option<String>,
    ) -> Result<(), StoreError> {
        let path = path.to_string();
        self.update(move |r| {
            r.snapshots.entry(path).or_insert(content);
        })
        .await
    }

    pub async fn set_feedback(
        &self,
        path: &str,
        issues: Vec<crate::prompts::Issue>,
    ) -> Result<(), StoreError> {
        let path = path.to_string();
        self.update(move |r| {
            if issues.is_empty() {
                r.feedback.remove(&path);
            } else {
                r.feedback.insert(path, issues);
            }
        })
        .await
    }
}
