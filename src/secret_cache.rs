use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, error, info};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::Error;

#[derive(Debug, Default)]
struct CacheState {
    base: HashMap<String, String>,
    /// value and the generation it was pushed at
    overrides: HashMap<String, (String, u64)>,
    generation: u64,
}

/// Certificate files mirrored from disk, with in-process overrides layered on top.
///
/// Keys are file paths as strings. An override shadows the base entry for the same
/// key until a [`SecretCache::load`] started after the push replaces the base map.
#[derive(Debug, Default)]
pub struct SecretCache {
    state: Mutex<CacheState>,
}

impl SecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        // a poisoned map is still usable: no mutation leaves an entry half written
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_override(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut state = self.state();
        state.generation += 1;
        let generation = state.generation;
        state.overrides.insert(key.into(), (value.into(), generation));
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state();
        state
            .overrides
            .get(key)
            .map(|(value, _)| value)
            .or_else(|| state.base.get(key))
            .cloned()
    }

    fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Installs `files` as the base map, dropping overrides pushed at or before `started`.
    fn swap_base(&self, files: HashMap<String, String>, started: u64) {
        let mut state = self.state();
        state.base = files;
        state.overrides.retain(|_, (_, generation)| *generation > started);
    }

    /// Reads `path` (a directory's regular files, or a single file) and swaps it in as
    /// the new base map. Overrides pushed while the read is in flight survive the swap.
    /// On error the previous base map and overrides are kept.
    pub async fn load(&self, path: &Path) -> Result<(), Error> {
        debug!("loading certificate mirror from {}", path.display());
        let started = self.generation();
        let files = read_files(path).await?;
        debug!("loaded {} files from {}", files.len(), path.display());

        self.swap_base(files, started);
        Ok(())
    }

    /// Loads `path` once, then reloads it in the background whenever a file under it
    /// is created or written.
    pub async fn watch(self: &Arc<Self>, path: PathBuf) -> Result<(), Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = tx.send(event);
        })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        self.load(&path).await?;

        let cache = self.clone();
        tokio::spawn(async move {
            // moved in so the watcher lives as long as this task
            let _watcher = watcher;
            info!("watching certificate mirror at {}", path.display());
            while let Some(event) = rx.recv().await {
                match event {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                        debug!("certificate mirror changed: {:?}", event.paths);
                        if let Err(e) = cache.load(&path).await {
                            error!("failed to reload certificate mirror {}: {e}", path.display());
                        }
                    }
                    Err(e) => {
                        error!("certificate mirror watch error: {e}");
                    }
                }
            }
        });
        Ok(())
    }
}

async fn read_files(path: &Path) -> Result<HashMap<String, String>, Error> {
    let metadata = tokio::fs::metadata(path).await?;
    let mut candidates = vec![];
    if metadata.is_dir() {
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            candidates.push(entry.path());
        }
    } else {
        candidates.push(path.to_path_buf());
    }

    let mut files = HashMap::new();
    for file in candidates {
        // follows symlinks, which is how mounted Secret volumes expose their keys
        if tokio::fs::metadata(&file).await?.is_dir() {
            continue;
        }
        let content = tokio::fs::read(&file).await?;
        files.insert(
            file.to_string_lossy().into_owned(),
            String::from_utf8_lossy(&content).into_owned(),
        );
    }
    Ok(files)
}
