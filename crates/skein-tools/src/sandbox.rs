// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

/// Metadata the runtime needs about a sandboxed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Modification time in milliseconds since the epoch.
    pub mtime_ms: i64,
    pub size: u64,
}

/// Filesystem primitives consumed by the file pool and by file-backed tools.
/// The real sandbox implementation lives with the embedding application;
/// [`LocalSandbox`] is the root-confined local variant used here and in tests.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn read_file(&self, path: &str) -> anyhow::Result<String>;
    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;
    /// `Ok(None)` when the file does not exist.
    async fn stat(&self, path: &str) -> anyhow::Result<Option<FileStat>>;
    async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }
}

/// Sandbox rooted at a directory; rejects escapes via `..` or absolute paths.
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(path);
        let mut clean = PathBuf::new();
        for comp in rel.components() {
            match comp {
                Component::Normal(p) => clean.push(p),
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    anyhow::bail!("absolute paths are not allowed in the sandbox: {path}")
                }
                Component::ParentDir => {
                    anyhow::bail!("path escapes the sandbox root: {path}")
                }
            }
        }
        Ok(self.root.join(clean))
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::read_to_string(&full).await?)
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<FileStat>> {
        let full = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) => {
                let mtime_ms = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                Ok(Some(FileStat { mtime_ms, size: meta.len() }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
