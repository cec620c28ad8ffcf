//! Read-mostly result cache keyed by a SHA-256 of the task text.

use super::history::atomic_write;
use crate::errors::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Concurrent reads share the lock; writes are serialized and flushed to disk.
#[derive(Debug)]
pub struct ResultCache {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

pub fn task_key(task: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResultCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or start) a cache persisted at `path`. A corrupt file starts empty.
    pub fn open(path: &Path) -> Self {
        let entries = std::fs::read(path)
            .ok()
            .and_then(|bytes| match serde_json::from_slice(&bytes) {
                Ok(map) => Some(map),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable result cache");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            path: Some(path.to_path_buf()),
            entries: RwLock::new(entries),
        }
    }

    pub fn get(&self, task: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(&task_key(task)).map(|e| e.value.clone()))
    }

    pub fn put(&self, task: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.insert(
            task_key(task),
            CacheEntry {
                value,
                created_at: Utc::now(),
            },
        );
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
            let json = serde_json::to_vec_pretty(&*entries)?;
            atomic_write(path, &json)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
