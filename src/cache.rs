//! Two-level media cache.
//!
//! The disk layer keeps downloaded asset bytes across runs, LRU-evicted
//! against a byte budget. The warmed layer maps asset id to a fully-ready
//! media handle and is cleared on every house switch; writes carry the epoch
//! of the house load that produced them, so work finishing after a switch is
//! discarded instead of leaking into the new house.

use crate::media::ProbeInfo;
use anyhow::{Context, Result};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use walkdir::WalkDir;

/// A fully-warmed media handle. Present in the warmed set only once the
/// metadata, data and can-play signals have all fired for the asset.
#[derive(Debug, Clone)]
pub struct WarmedMedia {
    pub asset_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub duration: Option<Duration>,
}

impl WarmedMedia {
    pub fn new(asset_id: String, path: PathBuf, bytes: u64, probe: &ProbeInfo) -> Self {
        Self {
            asset_id,
            path,
            bytes,
            duration: probe.duration,
        }
    }
}

#[derive(Debug, Clone)]
struct DiskEntry {
    path: PathBuf,
    bytes: u64,
}

#[derive(Debug)]
struct DiskState {
    lru: LruCache<String, DiskEntry>,
    current_bytes: u64,
}

/// Shared media cache. Written by the preloader, read everywhere else.
pub struct MediaCache {
    cache_dir: PathBuf,
    max_bytes: u64,
    disk: RwLock<DiskState>,
    warmed: RwLock<HashMap<String, WarmedMedia>>,
    epoch: AtomicU64,
}

impl MediaCache {
    pub fn new(cache_dir: PathBuf, max_size_gb: u64) -> Result<Self> {
        let max_bytes = max_size_gb * 1024 * 1024 * 1024;
        fs::create_dir_all(&cache_dir).context("Failed to create cache directory")?;

        let mut state = DiskState {
            lru: LruCache::new(NonZeroUsize::new(10_000).unwrap()),
            current_bytes: 0,
        };
        scan_existing(&cache_dir, &mut state);

        tracing::info!(
            "Cache initialized: {:.2} GB / {} GB used, {} files",
            state.current_bytes as f64 / 1024.0 / 1024.0 / 1024.0,
            max_size_gb,
            state.lru.len()
        );

        Ok(Self {
            cache_dir,
            max_bytes,
            disk: RwLock::new(state),
            warmed: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        })
    }

    /// The epoch of the most recent house load.
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start a new house load: bump the epoch and drop every warmed entry.
    /// In-flight preloads that captured an older epoch will see their
    /// commits rejected.
    pub async fn advance_epoch(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.warmed.write().await.clear();
        epoch
    }

    /// Where an asset's bytes land on disk. Content-safe name derived from
    /// the opaque asset id; extension carried over from the source URL.
    pub fn local_path(&self, asset_id: &str, url: &str) -> PathBuf {
        let stem = file_stem(asset_id);
        self.cache_dir
            .join(format!("{}.{}", stem, url_extension(url)))
    }

    /// Look up already-downloaded bytes for an asset, promoting the entry.
    pub async fn stored(&self, asset_id: &str) -> Option<(PathBuf, u64)> {
        let stem = file_stem(asset_id);
        let mut disk = self.disk.write().await;
        let entry = disk.lru.get(&stem)?;
        if !entry.path.exists() {
            return None;
        }
        Some((entry.path.clone(), entry.bytes))
    }

    /// Record a finished download, evicting least-recently-used files until
    /// the byte budget holds.
    pub async fn commit_stored(&self, asset_id: &str, path: &Path, bytes: u64) {
        let stem = file_stem(asset_id);
        let mut disk = self.disk.write().await;
        while disk.current_bytes + bytes > self.max_bytes {
            if !evict_lru(&mut disk) {
                tracing::warn!("Cache full and cannot evict, continuing anyway");
                break;
            }
        }
        if let Some(old) = disk.lru.put(
            stem,
            DiskEntry {
                path: path.to_path_buf(),
                bytes,
            },
        ) {
            disk.current_bytes = disk.current_bytes.saturating_sub(old.bytes);
        }
        disk.current_bytes += bytes;
        tracing::debug!(
            "Cached {} ({:.2} KB), total: {:.2} MB",
            asset_id,
            bytes as f64 / 1024.0,
            disk.current_bytes as f64 / 1024.0 / 1024.0
        );
    }

    /// Publish a warmed handle. Rejected when the owning house load has been
    /// superseded; the bytes stay in the disk layer either way.
    pub async fn insert_warmed(&self, media: WarmedMedia, epoch: u64) -> bool {
        if epoch != self.current_epoch() {
            tracing::debug!(
                "Discarding stale warmed entry {} (epoch {} != {})",
                media.asset_id,
                epoch,
                self.current_epoch()
            );
            return false;
        }
        self.warmed.write().await.insert(media.asset_id.clone(), media);
        true
    }

    /// A fully-warmed handle for the asset, if preloading finished for the
    /// current house.
    pub async fn warmed(&self, asset_id: &str) -> Option<WarmedMedia> {
        self.warmed.read().await.get(asset_id).cloned()
    }

    pub async fn warmed_count(&self) -> usize {
        self.warmed.read().await.len()
    }

    /// Drop disk entries for assets no house references anymore.
    pub async fn sweep_orphans(&self, keep_asset_ids: &HashSet<String>) {
        let keep: HashSet<String> = keep_asset_ids.iter().map(|id| file_stem(id)).collect();
        let mut disk = self.disk.write().await;
        let stale: Vec<String> = disk
            .lru
            .iter()
            .filter(|(stem, _)| !keep.contains(*stem))
            .map(|(stem, _)| stem.clone())
            .collect();
        for stem in stale {
            if let Some(entry) = disk.lru.pop(&stem) {
                tracing::debug!("Removing orphaned cache file {:?}", entry.path);
                if entry.path.exists() {
                    let _ = fs::remove_file(&entry.path);
                }
                disk.current_bytes = disk.current_bytes.saturating_sub(entry.bytes);
            }
        }
    }
}

fn scan_existing(cache_dir: &Path, state: &mut DiskState) {
    for entry in WalkDir::new(cache_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        if path.extension().is_some_and(|ext| ext == "part") {
            // Interrupted download from a previous run.
            let _ = fs::remove_file(&path);
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Ok(metadata) = fs::metadata(&path) {
            let bytes = metadata.len();
            state.lru.put(
                stem.to_string(),
                DiskEntry {
                    path: path.clone(),
                    bytes,
                },
            );
            state.current_bytes += bytes;
        }
    }
}

fn evict_lru(disk: &mut DiskState) -> bool {
    if let Some((_, entry)) = disk.lru.pop_lru() {
        tracing::debug!("Evicting {:?}", entry.path);
        if entry.path.exists() {
            if let Err(e) = fs::remove_file(&entry.path) {
                tracing::warn!("Failed to remove cached file: {}", e);
            }
        }
        disk.current_bytes = disk.current_bytes.saturating_sub(entry.bytes);
        return true;
    }
    false
}

fn file_stem(asset_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(asset_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn url_extension(url: &str) -> &str {
    url.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 4 && ext.chars().all(char::is_alphanumeric))
        .unwrap_or("mp4")
}
