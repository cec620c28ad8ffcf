//! On-disk session layout.
//!
//! ```text
//! <root>/sessions/index.json      lightweight summaries, newest first
//! <root>/sessions/<id>.json       full record per session
//! <root>/sessions/.lock           advisory lock serialising writers across processes
//! ```
//!
//! Every write goes to a temporary sibling, is fsynced and then renamed over the
//! target, so a reader (or a process restarting after a crash) only ever sees a
//! complete previous or complete next version of a file.

use super::types::{Phase, SessionRecord, SessionSummary};
use crate::errors::StoreError;
use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Filter for listing session summaries.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub phase: Option<Phase>,
    /// Case-insensitive substring match on task text or id.
    pub search: Option<String>,
    pub limit: Option<usize>,
}

/// Durable store of session summaries and full records.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    sessions_dir: PathBuf,
}

impl HistoryStore {
    pub fn new(root: &Path) -> Self {
        Self {
            sessions_dir: root.join("sessions"),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn index_file(&self) -> PathBuf {
        self.sessions_dir.join("index.json")
    }

    fn record_file(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.sessions_dir.join(format!("{}.json", id)))
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.sessions_dir).map_err(|e| StoreError::io(&self.sessions_dir, e))
    }

    /// Run `f` while holding the cross-process writer lock.
    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
        self.ensure_dir()?;
        let lock_path = self.sessions_dir.join(".lock");
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;
        lock.lock_exclusive()
            .map_err(|e| StoreError::io(&lock_path, e))?;
        let result = f();
        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!(path = %lock_path.display(), error = %e, "Failed to release session lock");
        }
        result
    }

    /// Persist the full record and refresh its index entry.
    pub fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.with_lock(|| {
            let json = serde_json::to_vec_pretty(record)?;
            atomic_write(&self.record_file(&record.session.id)?, &json)?;

            let mut index = self.read_index()?;
            let summary = record.summary();
            index.retain(|s| s.id != summary.id);
            index.push(summary);
            self.write_index(&mut index)
        })
    }

    pub fn load(&self, id: &str) -> Result<SessionRecord, StoreError> {
        let path = self.record_file(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        let content = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<SessionSummary>, StoreError> {
        let search = filter.search.as_ref().map(|s| s.to_lowercase());
        let mut summaries: Vec<SessionSummary> = self
            .read_index()?
            .into_iter()
            .filter(|s| filter.phase.is_none_or(|p| s.phase == p))
            .filter(|s| {
                search.as_ref().is_none_or(|needle| {
                    s.task.to_lowercase().contains(needle) || s.id.starts_with(needle.as_str())
                })
            })
            .collect();
        sort_newest_first(&mut summaries);
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    /// Most recently active session that can still be resumed.
    pub fn latest_resumable(&self) -> Result<Option<SessionSummary>, StoreError> {
        Ok(self
            .list(&ListFilter::default())?
            .into_iter()
            .find(|s| s.can_resume))
    }

    /// Delete a session's record and index entry. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.record_file(id)?;
        self.with_lock(|| {
            let mut index = self.read_index()?;
            let before = index.len();
            index.retain(|s| s.id != id);
            let mut existed = index.len() != before;

            if path.exists() {
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
                existed = true;
            }
            self.write_index(&mut index)?;
            Ok(existed)
        })
    }

    /// Mark a session as explicitly cleared so it can no longer be resumed.
    pub fn clear(&self, id: &str) -> Result<(), StoreError> {
        let mut record = self.load(id)?;
        record.session.cleared = true;
        record.session.touch();
        self.save(&record)
    }

    /// Clear every resumable session. Returns how many were cleared.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        let resumable: Vec<String> = self
            .list(&ListFilter::default())?
            .into_iter()
            .filter(|s| s.can_resume)
            .map(|s| s.id)
            .collect();
        for id in &resumable {
            self.clear(id)?;
        }
        Ok(resumable.len())
    }

    fn read_index(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let path = self.index_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(serde_json::from_slice(&content)?)
    }

    fn write_index(&self, index: &mut [SessionSummary]) -> Result<(), StoreError> {
        sort_newest_first(index);
        let json = serde_json::to_vec_pretty(&index)?;
        atomic_write(&self.index_file(), &json)
    }
}

/// Session ids name files inside the sessions directory, so only plain
/// identifier characters are accepted.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let plain = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain && id != "index" {
        Ok(())
    } else {
        Err(StoreError::InvalidId { id: id.to_string() })
    }
}

fn sort_newest_first(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
}

/// Write `bytes` to `path` via temp file + fsync + rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "data".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{AgentRole, AgentSlot, Session, SessionOptions, WorkItem};
    use tempfile::tempdir;

    fn record(task: &str, phase: Phase) -> SessionRecord {
        let mut session = Session::new(task);
        session.phase = phase;
        session.touch();
        SessionRecord::new(
            session,
            SessionOptions::default(),
            vec![AgentSlot::new(AgentRole::Executor, vec!["alpha".into()])],
        )
    }

    #[test]
    fn test_empty_store_lists_nothing() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        assert!(store.list(&ListFilter::default()).unwrap().is_empty());
        assert!(store.latest_resumable().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let mut rec = record("add login page", Phase::Executing);
        rec.work_items.push(WorkItem::new("src/login.rs"));
        store.save(&rec).unwrap();

        let loaded = store.load(&rec.session.id).unwrap();
        assert_eq!(loaded, rec);
        let listed = store.list(&ListFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_count, 1);
    }

    #[test]
    fn test_save_twice_updates_index_entry() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let mut rec = record("task", Phase::Planning);
        store.save(&rec).unwrap();
        rec.session.phase = Phase::Complete;
        rec.session.touch();
        store.save(&rec).unwrap();

        let listed = store.list(&ListFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].phase, Phase::Complete);
        assert!(!listed[0].can_resume);
    }

    #[test]
    fn test_list_filters() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        store.save(&record("build parser", Phase::Complete)).unwrap();
        store.save(&record("fix login", Phase::Error)).unwrap();
        store.save(&record("Parser docs", Phase::Executing)).unwrap();

        let parsers = store
            .list(&ListFilter {
                search: Some("parser".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(parsers.len(), 2);

        let errors = store
            .list(&ListFilter {
                phase: Some(Phase::Error),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].task, "fix login");

        let limited = store
            .list(&ListFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let rec = record("task", Phase::Complete);
        store.save(&rec).unwrap();
        assert!(store.delete(&rec.session.id).unwrap());
        assert!(!store.delete(&rec.session.id).unwrap());
        assert!(matches!(
            store.load(&rec.session.id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rejects_ids_outside_sessions_dir() {
        let dir = tempdir().unwrap();
        let root = dir.path().join(".weaver");
        let store = HistoryStore::new(&root);
        store.save(&record("task", Phase::Complete)).unwrap();
        let outside = dir.path().join("victim.json");
        fs::write(&outside, "{}").unwrap();

        for id in ["../../victim", "../victim", "a/b", "..", "", "index"] {
            assert!(
                matches!(store.delete(id), Err(StoreError::InvalidId { .. })),
                "id {:?} should be rejected",
                id
            );
            assert!(matches!(store.load(id), Err(StoreError::InvalidId { .. })));
            assert!(matches!(store.clear(id), Err(StoreError::InvalidId { .. })));
        }
        assert!(outside.exists());
        assert_eq!(store.list(&ListFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_clear_disables_resume() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let rec = record("task", Phase::Executing);
        store.save(&rec).unwrap();
        assert!(store.latest_resumable().unwrap().is_some());

        assert_eq!(store.clear_all().unwrap(), 1);
        assert!(store.latest_resumable().unwrap().is_none());
        let loaded = store.load(&rec.session.id).unwrap();
        assert!(loaded.session.cleared);
        assert!(!loaded.session.can_resume);
    }

    #[test]
    fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        let rec = record("survive restart", Phase::Auditing);
        {
            let store = HistoryStore::new(dir.path());
            store.save(&rec).unwrap();
        }
        {
            let store = HistoryStore::new(dir.path());
            let loaded = store.load(&rec.session.id).unwrap();
            assert_eq!(loaded.session.phase, Phase::Auditing);
            assert!(loaded.session.can_resume);
        }
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("data.json");
        atomic_write(&target, b"{}").unwrap();
        atomic_write(&target, b"{\"a\":1}").unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["data.json"]);
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":1}");
    }
}
