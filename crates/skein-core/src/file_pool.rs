// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use notify::Watcher;
use tracing::{debug, warn};

use skein_events::EventKind;
use skein_tools::Sandbox;

use crate::bus::EventBus;

#[derive(Debug, Clone, Default)]
struct FileAccess {
    last_read: Option<DateTime<Utc>>,
    last_edit: Option<DateTime<Utc>>,
    last_read_mtime: Option<i64>,
    last_edit_mtime: Option<i64>,
    last_known_mtime: Option<i64>,
}

/// Tracks read/edit mtimes per file so write-class tools can detect external
/// modification, and so compression knows which files to capture.
pub struct FilePool {
    sandbox: Arc<dyn Sandbox>,
    entries: Mutex<HashMap<String, FileAccess>>,
    bus: Mutex<Option<Arc<EventBus>>>,
    watcher: Mutex<Option<WatcherHandle>>,
}

struct WatcherHandle {
    root: PathBuf,
    /// Held to keep the platform watcher alive; dropping it stops delivery.
    _watcher: notify::RecommendedWatcher,
}

impl FilePool {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Arc<Self> {
        Arc::new(Self {
            sandbox,
            entries: Mutex::new(HashMap::new()),
            bus: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    /// Attach a bus so external-change notifications surface as monitor
    /// `file_changed` events.
    pub fn attach_bus(&self, bus: Arc<EventBus>) {
        *self.bus.lock().unwrap() = Some(bus);
    }

    /// Record that `path` was read; captures the current mtime.
    pub async fn record_read(&self, path: &str) -> anyhow::Result<()> {
        let stat = self.sandbox.stat(path).await?;
        let mtime = stat.map(|s| s.mtime_ms);
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(path.to_string()).or_default();
        entry.last_read = Some(Utc::now());
        entry.last_read_mtime = mtime;
        entry.last_known_mtime = mtime;
        Ok(())
    }

    /// Record that `path` was edited (written) by a tool.
    pub async fn record_edit(&self, path: &str) -> anyhow::Result<()> {
        let stat = self.sandbox.stat(path).await?;
        let mtime = stat.map(|s| s.mtime_ms);
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(path.to_string()).or_default();
        entry.last_edit = Some(Utc::now());
        entry.last_edit_mtime = mtime;
        entry.last_known_mtime = mtime;
        Ok(())
    }

    /// Freshness check before a write.  `None` means fresh; `Some(reason)`
    /// explains the staleness.
    ///
    /// Fresh iff the current mtime equals the last read or last edit mtime,
    /// or the file does not exist yet.  An existing file that was never read
    /// or edited through the pool is stale by definition (read before
    /// overwrite).
    pub async fn validate_write(&self, path: &str) -> anyhow::Result<Option<String>> {
        let Some(stat) = self.sandbox.stat(path).await? else {
            return Ok(None);
        };
        let entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(path) else {
            return Ok(Some(format!(
                "{path} exists but has not been read in this session"
            )));
        };
        let current = Some(stat.mtime_ms);
        if current == entry.last_read_mtime || current == entry.last_edit_mtime {
            Ok(None)
        } else {
            Ok(Some(format!(
                "{path} was modified externally since it was last read (mtime {} vs recorded {:?})",
                stat.mtime_ms,
                entry.last_read_mtime.or(entry.last_edit_mtime)
            )))
        }
    }

    /// Paths ordered by most recent access, newest first.
    pub fn accessed_files(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        let mut paths: Vec<(String, DateTime<Utc>)> = entries
            .iter()
            .filter_map(|(path, access)| {
                let latest = access.last_read.max(access.last_edit)?;
                Some((path.clone(), latest))
            })
            .collect();
        paths.sort_by(|a, b| b.1.cmp(&a.1));
        paths.into_iter().map(|(p, _)| p).collect()
    }

    /// Called by the platform watcher (or tests) when a file changed outside
    /// the runtime.  Updates the last-known mtime and announces the change.
    pub fn note_external_change(&self, path: &str, mtime_ms: i64) {
        {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(path.to_string()).or_default();
            entry.last_known_mtime = Some(mtime_ms);
        }
        if let Some(bus) = self.bus.lock().unwrap().clone() {
            bus.emit(EventKind::FileChanged { path: path.into(), timestamp: Utc::now() });
        }
    }

    /// Start a platform watcher rooted at `root` (the sandbox root on disk).
    /// Tracked paths are resolved against it; change notifications call
    /// [`note_external_change`](Self::note_external_change).
    pub fn enable_watcher(self: &Arc<Self>, root: impl Into<PathBuf>) -> anyhow::Result<()> {
        let root: PathBuf = root.into();
        let pool = Arc::downgrade(self);
        let watch_root = root.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let Ok(event) = res else { return };
                let Some(pool) = pool.upgrade() else { return };
                for path in &event.paths {
                    let Ok(rel) = path.strip_prefix(&watch_root) else { continue };
                    let rel = rel.to_string_lossy().to_string();
                    let mtime = std::fs::metadata(path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_millis() as i64);
                    if let Some(mtime) = mtime {
                        let tracked = pool.entries.lock().unwrap().contains_key(&rel);
                        if tracked {
                            debug!(path = %rel, "watched file changed externally");
                            pool.note_external_change(&rel, mtime);
                        }
                    }
                }
            })?;
        if let Err(e) = watcher.watch(&root, notify::RecursiveMode::Recursive) {
            warn!(root = %root.display(), error = %e, "file watcher unavailable");
            return Err(e.into());
        }
        *self.watcher.lock().unwrap() = Some(WatcherHandle { root, _watcher: watcher });
        Ok(())
    }

    /// Root the watcher is bound to, when enabled.
    pub fn watch_root(&self) -> Option<PathBuf> {
        self.watcher.lock().unwrap().as_ref().map(|w| w.root.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use skein_events::Channel;
    use skein_store::MemoryStore;
    use skein_tools::LocalSandbox;

    use super::*;
    use crate::bus::{BusOptions, SubscribeOptions};

    async fn pool() -> (tempfile::TempDir, Arc<dyn Sandbox>, Arc<FilePool>) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox: Arc<dyn Sandbox> = Arc::new(LocalSandbox::new(dir.path()));
        let pool = FilePool::new(sandbox.clone());
        (dir, sandbox, pool)
    }

    #[tokio::test]
    async fn unread_missing_file_is_fresh() {
        let (_dir, _sb, pool) = pool().await;
        assert_eq!(pool.validate_write("new.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_then_write_is_fresh() {
        let (_dir, sb, pool) = pool().await;
        sb.write_file("a.txt", "v1").await.unwrap();
        pool.record_read("a.txt").await.unwrap();
        assert_eq!(pool.validate_write("a.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn external_modification_is_stale() {
        let (_dir, sb, pool) = pool().await;
        sb.write_file("a.txt", "v1").await.unwrap();
        pool.record_read("a.txt").await.unwrap();
        // External writer changes the file; force a different mtime.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sb.write_file("a.txt", "v2 from someone else").await.unwrap();
        let reason = pool.validate_write("a.txt").await.unwrap();
        assert!(reason.is_some(), "modified file must be stale");
        assert!(reason.unwrap().contains("a.txt"));
    }

    #[tokio::test]
    async fn own_edit_keeps_file_fresh() {
        let (_dir, sb, pool) = pool().await;
        sb.write_file("a.txt", "v1").await.unwrap();
        pool.record_read("a.txt").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sb.write_file("a.txt", "v2").await.unwrap();
        pool.record_edit("a.txt").await.unwrap();
        assert_eq!(pool.validate_write("a.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn existing_untracked_file_is_stale() {
        let (_dir, sb, pool) = pool().await;
        sb.write_file("a.txt", "v1").await.unwrap();
        let reason = pool.validate_write("a.txt").await.unwrap();
        assert!(reason.unwrap().contains("has not been read"));
    }

    #[tokio::test]
    async fn accessed_files_newest_first() {
        let (_dir, sb, pool) = pool().await;
        for name in ["one.txt", "two.txt"] {
            sb.write_file(name, "x").await.unwrap();
        }
        pool.record_read("one.txt").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        pool.record_read("two.txt").await.unwrap();
        assert_eq!(pool.accessed_files(), vec!["two.txt", "one.txt"]);
    }

    #[tokio::test]
    async fn note_external_change_emits_file_changed() {
        let (_dir, _sb, pool) = pool().await;
        let bus = EventBus::new("a1", Arc::new(MemoryStore::new()), BusOptions::default());
        pool.attach_bus(bus.clone());
        let mut stream = bus.subscribe(SubscribeOptions::channel(Channel::Monitor)).await;
        pool.note_external_change("a.txt", 12345);
        let env = stream.next().await.unwrap();
        match env.event.payload.kind().unwrap() {
            EventKind::FileChanged { path, .. } => assert_eq!(path, "a.txt"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn watcher_binds_to_root() {
        let (dir, _sb, pool) = pool().await;
        pool.enable_watcher(dir.path()).unwrap();
        assert_eq!(pool.watch_root().unwrap(), dir.path());
    }
}
