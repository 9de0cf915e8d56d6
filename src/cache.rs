//! Directory-backed query cache.
//!
//! Caches the payload of every remote query keyed by
//! `(data_type, object_ref, parameter tuple, schema version)`. Entries are
//! whole or absent; a reader never sees a partial write because writes go
//! to a temp file in the same directory, are fsynced, and land with an
//! atomic rename.
//!
//! A read misses when the file is absent, older than the TTL, or written by
//! a different [`CACHE_SCHEMA_VERSION`]. Payloads at or above 4 KiB are
//! gzip-compressed. Hit/miss/write counters are monotonic and reset only by
//! [`QueryCache::clear`].
//!
//! Concurrent fetches of the same key are deduplicated with a per-key lock:
//! the second caller blocks on the first and then reads the file the first
//! one wrote.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheConfig;

/// Bumped whenever the cached payload shapes change; older entries are
/// treated as misses.
pub const CACHE_SCHEMA_VERSION: u32 = 3;

/// Payloads at or above this size are stored gzip-compressed.
const COMPRESS_THRESHOLD: usize = 4 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    schema_version: u32,
    created_at: i64,
    data_type: String,
    object_ref: String,
    #[serde(default)]
    params: Vec<(String, String)>,
    payload: Value,
}

/// Monotonic counters, plus a directory scan for size figures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub compressed_writes: u64,
    pub bytes_saved: u64,
    pub errors: u64,
    pub files: u64,
    pub total_bytes: u64,
}

impl CacheStats {
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

pub struct QueryCache {
    dir: PathBuf,
    ttl: Duration,
    compression: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    compressed_writes: AtomicU64,
    bytes_saved: AtomicU64,
    errors: AtomicU64,
    tmp_counter: AtomicU64,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl QueryCache {
    pub fn open(config: &CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("creating cache dir {}", config.dir.display()))?;
        Ok(Self {
            dir: config.dir.clone(),
            ttl: Duration::from_secs(config.ttl_hours * 3600),
            compression: config.compression,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            compressed_writes: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            tmp_counter: AtomicU64::new(0),
            flights: Mutex::new(HashMap::new()),
        })
    }

    /// Stable 16-hex-char key over data type, ref, sorted params, and the
    /// running schema version.
    pub fn key(data_type: &str, object_ref: &str, params: &[(String, String)]) -> String {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();
        let mut hasher = Sha256::new();
        hasher.update(data_type.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(object_ref.as_bytes());
        for (k, v) in sorted {
            hasher.update(b"\x1f");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        hasher.update(b"\x1f");
        hasher.update(CACHE_SCHEMA_VERSION.to_le_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    /// Per-key lock for singleflight fetches. Callers hold the guard across
    /// the whole check–fetch–write sequence.
    pub async fn flight_guard(
        &self,
        data_type: &str,
        object_ref: &str,
        params: &[(String, String)],
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let key = Self::key(data_type, object_ref, params);
        let lock = {
            let mut flights = self.flights.lock().expect("flights mutex poisoned");
            flights
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Fetch a fresh entry's payload, or record a miss.
    pub fn get(
        &self,
        data_type: &str,
        object_ref: &str,
        params: &[(String, String)],
    ) -> Option<Value> {
        let key = Self::key(data_type, object_ref, params);
        let (path, compressed) = match self.find_entry_file(&key, data_type) {
            Some(found) => found,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let entry = match self.read_entry(&path, compressed) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable cache entry");
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.schema_version != CACHE_SCHEMA_VERSION {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let age = chrono::Utc::now().timestamp().saturating_sub(entry.created_at);
        if age < 0 || age as u64 >= self.ttl.as_secs() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        debug!(data_type, object_ref, "cache hit");
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.payload)
    }

    /// Write an entry atomically. Errors are counted and logged, never
    /// propagated, since the pipeline can always re-fetch.
    pub fn put(
        &self,
        data_type: &str,
        object_ref: &str,
        params: &[(String, String)],
        payload: &Value,
    ) {
        if let Err(e) = self.try_put(data_type, object_ref, params, payload) {
            warn!(data_type, object_ref, error = %e, "cache write failed");
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn try_put(
        &self,
        data_type: &str,
        object_ref: &str,
        params: &[(String, String)],
        payload: &Value,
    ) -> Result<()> {
        let key = Self::key(data_type, object_ref, params);
        let entry = CacheEntry {
            schema_version: CACHE_SCHEMA_VERSION,
            created_at: chrono::Utc::now().timestamp(),
            data_type: data_type.to_string(),
            object_ref: object_ref.to_string(),
            params: params.to_vec(),
            payload: payload.clone(),
        };
        let encoded = serde_json::to_vec(&entry)?;

        let compress = self.compression && encoded.len() >= COMPRESS_THRESHOLD;
        let final_path = self.entry_path(&key, data_type, compress);
        // Remove the other representation so a shrinking payload cannot
        // leave a stale compressed twin behind.
        let twin = self.entry_path(&key, data_type, !compress);
        let _ = std::fs::remove_file(&twin);

        let bytes = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&encoded)?;
            let compressed = encoder.finish()?;
            self.compressed_writes.fetch_add(1, Ordering::Relaxed);
            self.bytes_saved.fetch_add(
                (encoded.len().saturating_sub(compressed.len())) as u64,
                Ordering::Relaxed,
            );
            compressed
        } else {
            encoded
        };

        let tmp = self.dir.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &final_path)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Selective clear. `data_type = None` matches everything;
    /// `older_than = None` ignores age. Returns the number of files removed.
    /// Clearing everything also resets the counters.
    pub fn clear(&self, data_type: Option<&str>, older_than: Option<Duration>) -> usize {
        let mut removed = 0usize;
        let now = std::time::SystemTime::now();
        for file in self.entry_files() {
            if let Some(dt) = data_type {
                let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !name.contains(&format!("_{}.", dt)) {
                    continue;
                }
            }
            if let Some(min_age) = older_than {
                let old_enough = std::fs::metadata(&file)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .map(|age| age >= min_age)
                    .unwrap_or(false);
                if !old_enough {
                    continue;
                }
            }
            if std::fs::remove_file(&file).is_ok() {
                removed += 1;
            }
        }
        if data_type.is_none() && older_than.is_none() {
            self.hits.store(0, Ordering::Relaxed);
            self.misses.store(0, Ordering::Relaxed);
            self.writes.store(0, Ordering::Relaxed);
            self.compressed_writes.store(0, Ordering::Relaxed);
            self.bytes_saved.store(0, Ordering::Relaxed);
            self.errors.store(0, Ordering::Relaxed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let mut files = 0u64;
        let mut total_bytes = 0u64;
        for file in self.entry_files() {
            if let Ok(meta) = std::fs::metadata(&file) {
                files += 1;
                total_bytes += meta.len();
            }
        }
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            compressed_writes: self.compressed_writes.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            files,
            total_bytes,
        }
    }

    fn entry_path(&self, key: &str, data_type: &str, compressed: bool) -> PathBuf {
        let ext = if compressed { "json.gz" } else { "json" };
        self.dir.join(format!("{}_{}.{}", key, data_type, ext))
    }

    fn find_entry_file(&self, key: &str, data_type: &str) -> Option<(PathBuf, bool)> {
        let plain = self.entry_path(key, data_type, false);
        if plain.exists() {
            return Some((plain, false));
        }
        let gz = self.entry_path(key, data_type, true);
        if gz.exists() {
            return Some((gz, true));
        }
        None
    }

    fn read_entry(&self, path: &Path, compressed: bool) -> Result<CacheEntry> {
        let bytes = std::fs::read(path)?;
        let decoded = if compressed {
            let mut decoder = GzDecoder::new(&bytes[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        } else {
            bytes
        };
        Ok(serde_json::from_slice(&decoded)?)
    }

    fn entry_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if path.is_file() && !name.starts_with(".tmp-") {
                    files.push(path);
                }
            }
        }
        files
    }
}
