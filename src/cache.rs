//! Persistent byte cache for media payloads.
//!
//! Maps a source URL to the bytes it served. Entries live as files
//! named by the SHA-256 of the URL inside a single collection directory,
//! so they survive restarts. A small LRU keeps recently used blobs in memory,
//! bounded by entry count and by total bytes.

use crate::error::{ViewerError, ViewerResult};
use bytes::Bytes;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use walkdir::WalkDir;

const COLLECTION: &str = "media";
const PARTIAL_SUFFIX: &str = "part";
pub const DEFAULT_MEMORY_BUDGET: u64 = 64 << 20;

#[derive(Default)]
struct CacheState {
    opened: bool,
    /// Entry file name -> size in bytes.
    index: HashMap<String, u64>,
    total_bytes: u64,
    memory: Option<LruCache<String, Bytes>>,
    memory_bytes: u64,
}

impl CacheState {
    /// Keep `bytes` in the memory front. Blobs larger than `budget` stay on
    /// disk only.
    fn remember(&mut self, key: String, bytes: Bytes, budget: u64) {
        let Some(memory) = self.memory.as_mut() else {
            return;
        };
        if let Some(old) = memory.pop(&key) {
            self.memory_bytes -= old.len() as u64;
        }
        let size = bytes.len() as u64;
        if size > budget {
            return;
        }

        if let Some((_, evicted)) = memory.push(key, bytes) {
            self.memory_bytes -= evicted.len() as u64;
        }
        self.memory_bytes += size;
        while self.memory_bytes > budget {
            match memory.pop_lru() {
                Some((_, evicted)) => self.memory_bytes -= evicted.len() as u64,
                None => break,
            }
        }
    }
}

pub struct ByteCache {
    collection_dir: PathBuf,
    memory_entries: usize,
    memory_budget: u64,
    state: Mutex<CacheState>,
    write_seq: AtomicU64,
}

impl ByteCache {
    /// Create a handle rooted at `cache_dir`. Nothing touches disk until [`open`](Self::open).
    pub fn new(cache_dir: impl Into<PathBuf>, memory_entries: usize) -> Self {
        Self {
            collection_dir: cache_dir.into().join(COLLECTION),
            memory_entries,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            state: Mutex::new(CacheState::default()),
            write_seq: AtomicU64::new(0),
        }
    }

    /// Cap the bytes held by the memory front.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Ensure the store and its collection exist. Safe to call repeatedly.
    pub async fn open(&self) -> ViewerResult<()> {
        let mut state = self.state.lock().await;
        if state.opened {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.collection_dir)
            .await
            .map_err(|e| {
                ViewerError::StorageUnavailable(format!(
                    "cannot create {}: {}",
                    self.collection_dir.display(),
                    e
                ))
            })?;

        // An existing but read-only directory is as useless as a missing one.
        let probe = self.collection_dir.join(".probe");
        tokio::fs::write(&probe, b"")
            .await
            .map_err(|e| ViewerError::StorageUnavailable(format!("store not writable: {e}")))?;
        let _ = tokio::fs::remove_file(&probe).await;

        let (index, total_bytes) = scan_collection(&self.collection_dir);
        state.index = index;
        state.total_bytes = total_bytes;
        state.memory = NonZeroUsize::new(self.memory_entries).map(LruCache::new);
        state.opened = true;

        tracing::info!(
            "Byte cache opened at {}: {} entries, {:.2} MB",
            self.collection_dir.display(),
            state.index.len(),
            state.total_bytes as f64 / 1024.0 / 1024.0
        );
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.opened
    }

    /// Point lookup. A missing entry is `Ok(None)`.
    pub async fn get(&self, url: &str) -> ViewerResult<Option<Bytes>> {
        let key = entry_name(url);
        {
            let mut state = self.state.lock().await;
            if !state.opened {
                return Err(ViewerError::StorageUnavailable("cache not opened".into()));
            }
            if let Some(bytes) = state.memory.as_mut().and_then(|m| m.get(&key)) {
                return Ok(Some(bytes.clone()));
            }
        }

        let path = self.collection_dir.join(&key);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let bytes = Bytes::from(data);
                let mut state = self.state.lock().await;
                state.remember(key, bytes.clone(), self.memory_budget);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                tracing::warn!("Failed to read cache entry {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    /// Best-effort insert or overwrite. Failures are logged, never returned.
    pub async fn put(&self, url: &str, bytes: Bytes) {
        if let Err(e) = self.try_put(url, bytes).await {
            tracing::warn!("Failed to cache {}: {}", url, e);
        }
    }

    async fn try_put(&self, url: &str, bytes: Bytes) -> ViewerResult<()> {
        if !self.is_open().await {
            return Err(ViewerError::StorageUnavailable("cache not opened".into()));
        }

        let key = entry_name(url);
        let path = self.collection_dir.join(&key);
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let partial = self
            .collection_dir
            .join(format!("{key}.{seq}.{PARTIAL_SUFFIX}"));

        // Readers only ever see complete files: write aside, then rename.
        let write = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&partial, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(ViewerError::StorageUnavailable(e.to_string()));
        }

        let size = bytes.len() as u64;
        let mut state = self.state.lock().await;
        if let Some(previous) = state.index.insert(key.clone(), size) {
            state.total_bytes = state.total_bytes.saturating_sub(previous);
        }
        state.total_bytes += size;
        state.remember(key, bytes, self.memory_budget);

        tracing::debug!(
            "Cached {} ({:.2} KB), total: {:.2} MB",
            url,
            size as f64 / 1024.0,
            state.total_bytes as f64 / 1024.0 / 1024.0
        );
        Ok(())
    }

    /// On-disk location an entry for `url` would occupy.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.collection_dir.join(entry_name(url))
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            item_count: state.index.len(),
            total_bytes: state.total_bytes,
            memory_items: state.memory.as_ref().map_or(0, |m| m.len()),
            memory_bytes: state.memory_bytes,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub item_count: usize,
    pub total_bytes: u64,
    pub memory_items: usize,
    pub memory_bytes: u64,
}

fn entry_name(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

/// Index complete entries; leftover partial writes from a crash are removed.
fn scan_collection(dir: &Path) -> (HashMap<String, u64>, u64) {
    let mut index = HashMap::new();
    let mut total = 0;

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(PARTIAL_SUFFIX) {
            tracing::debug!("Removing partial cache write {:?}", path);
            let _ = fs::remove_file(path);
            continue;
        }
        if name.starts_with('.') {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
            index.insert(name.to_string(), metadata.len());
        }
    }

    (index, total)
}
