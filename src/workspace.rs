//! Filesystem capability used for generated files.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;

#[async_trait]
pub trait Workspace: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> bool;

    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Current content, or `None` when the file does not exist.
    async fn snapshot(&self, path: &str) -> Result<Option<String>> {
        if self.exists(path).await {
            Ok(Some(self.read_file(path).await?))
        } else {
            Ok(None)
        }
    }
}

/// Files under a root directory. Paths may not escape the root.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if escapes {
            anyhow::bail!("Path '{}' is outside the workspace", path);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("Failed to write {}", full.display()))
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => tokio::fs::try_exists(full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .with_context(|| format!("Failed to remove {}", full.display()))
    }
}

/// In-memory files, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    files: RwLock<HashMap<String, String>>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        if let Ok(mut files) = self.files.try_write() {
            files.insert(path.to_string(), content.to_string());
        }
        self
    }

    pub async fn files(&self) -> HashMap<String, String> {
        self.files.read().await.clone()
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    async fn read_file(&self, path: &str) -> Result<String> {
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .with_context(|| format!("No such file: {}", path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .write()
            .await
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        self.files.read().await.contains_key(path)
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.files
            .write()
            .await
            .remove(path)
            .map(|_| ())
            .with_context(|| format!("No such file: {}", path))
    }
}
