//! Per-fragment row-count caches and their on-disk sidecar.
//!
//! A fragment optionally tracks the bit count of its hottest rows so top-K
//! queries avoid scanning every row. The cache is a rebuildable sidecar: the
//! fragment file stays authoritative, and the sidecar carries the fragment
//! digest it was computed from — a mismatch at open discards it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

// ─────────────────────────────────────────────
// CachePolicy
// ─────────────────────────────────────────────

/// How a view tracks row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// No cache at all (forced for bit-sliced views).
    None,
    /// Keep counts for recently touched rows only.
    Lru,
    /// Keep counts for every row, report the top-N by count.
    Ranked,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Ranked
    }
}

impl std::str::FromStr for CachePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "none" => Ok(CachePolicy::None),
            "lru" => Ok(CachePolicy::Lru),
            "ranked" => Ok(CachePolicy::Ranked),
            other => Err(CoreError::UnknownCachePolicy(other.to_string())),
        }
    }
}

impl std::fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachePolicy::None => write!(f, "none"),
            CachePolicy::Lru => write!(f, "lru"),
            CachePolicy::Ranked => write!(f, "ranked"),
        }
    }
}

/// Default number of rows tracked by a ranked or LRU cache.
pub const DEFAULT_CACHE_SIZE: u32 = 50_000;

// ─────────────────────────────────────────────
// RowCache
// ─────────────────────────────────────────────

/// In-memory row → bit-count tracker behind a fragment.
#[derive(Debug)]
pub enum RowCache {
    None,
    Lru(LruCache<u64, u64>),
    Ranked { counts: HashMap<u64, u64>, size: u32 },
}

impl RowCache {
    pub fn new(policy: CachePolicy, size: u32) -> Self {
        let size = size.max(1);
        match policy {
            CachePolicy::None => RowCache::None,
            CachePolicy::Lru => RowCache::Lru(LruCache::new(
                NonZeroUsize::new(size as usize).unwrap_or(NonZeroUsize::MIN),
            )),
            CachePolicy::Ranked => RowCache::Ranked {
                counts: HashMap::new(),
                size,
            },
        }
    }

    /// Record the current count of a row.
    pub fn update(&mut self, row: u64, count: u64) {
        match self {
            RowCache::None => {}
            RowCache::Lru(lru) => {
                if count == 0 {
                    lru.pop(&row);
                } else {
                    lru.put(row, count);
                }
            }
            RowCache::Ranked { counts, .. } => {
                if count == 0 {
                    counts.remove(&row);
                } else {
                    counts.insert(row, count);
                }
            }
        }
    }

    /// Drop everything (used before a full recalculation).
    pub fn clear(&mut self) {
        match self {
            RowCache::None => {}
            RowCache::Lru(lru) => lru.clear(),
            RowCache::Ranked { counts, .. } => counts.clear(),
        }
    }

    /// The top `n` rows by count, descending, ties broken by ascending row ID.
    pub fn top(&self, n: usize) -> Vec<(u64, u64)> {
        let mut entries: Vec<(u64, u64)> = match self {
            RowCache::None => return Vec::new(),
            RowCache::Lru(lru) => lru.iter().map(|(r, c)| (*r, *c)).collect(),
            RowCache::Ranked { counts, size } => {
                let mut v: Vec<(u64, u64)> = counts.iter().map(|(r, c)| (*r, *c)).collect();
                v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                v.truncate(*size as usize);
                v
            }
        };
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }

    /// All tracked entries, used to persist the sidecar.
    pub fn entries(&self) -> Vec<(u64, u64)> {
        match self {
            RowCache::None => Vec::new(),
            RowCache::Lru(lru) => lru.iter().map(|(r, c)| (*r, *c)).collect(),
            RowCache::Ranked { counts, .. } => counts.iter().map(|(r, c)| (*r, *c)).collect(),
        }
    }

    /// Bulk-load entries from a sidecar snapshot.
    pub fn load(&mut self, entries: Vec<(u64, u64)>) {
        self.clear();
        for (row, count) in entries {
            self.update(row, count);
        }
    }
}

// ─────────────────────────────────────────────
// Sidecar file
// ─────────────────────────────────────────────
//
// Layout: [magic: u32][len: u32][crc32: u32][payload: bincode CacheSnapshot]
//
// The snapshot embeds the fragment digest it was computed from; a reader
// with a different digest must discard the sidecar and recompute.

const CACHE_MAGIC: u32 = 0x54455343; // "TESC"

/// Maximum sidecar payload size (8 MiB). Prevents OOM on corrupted files.
const MAX_CACHE_BYTES: u32 = 8 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    digest: u64,
    entries: Vec<(u64, u64)>,
}

/// Write the sidecar atomically (temp file + rename).
pub fn store_sidecar(path: &Path, digest: u64, entries: Vec<(u64, u64)>) -> Result<(), CoreError> {
    let mut entries = entries;
    entries.sort_unstable();
    let payload = bincode::serialize(&CacheSnapshot { digest, entries })?;
    let crc = crc32fast::hash(&payload);

    let tmp = path.with_extension("cache.tmp");
    {
        let file = File::create(&tmp).map_err(|e| CoreError::storage(&tmp, e))?;
        let mut w = BufWriter::new(file);
        w.write_all(&CACHE_MAGIC.to_le_bytes())
            .and_then(|_| w.write_all(&(payload.len() as u32).to_le_bytes()))
            .and_then(|_| w.write_all(&crc.to_le_bytes()))
            .and_then(|_| w.write_all(&payload))
            .and_then(|_| w.flush())
            .map_err(|e| CoreError::storage(&tmp, e))?;
        w.get_ref()
            .sync_data()
            .map_err(|e| CoreError::storage(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| CoreError::storage(path, e))
}

/// Load the sidecar if it exists, is intact, and matches `expected_digest`.
/// Any mismatch is logged and treated as "no sidecar".
pub fn load_sidecar(path: &Path, expected_digest: u64) -> Option<Vec<(u64, u64)>> {
    if !path.exists() {
        return None;
    }
    let snapshot = match read_snapshot(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable cache sidecar");
            return None;
        }
    };
    if snapshot.digest != expected_digest {
        warn!(path = %path.display(), "cache sidecar digest mismatch, recomputing");
        return None;
    }
    Some(snapshot.entries)
}

fn read_snapshot(path: &Path) -> Result<CacheSnapshot, CoreError> {
    let file = File::open(path).map_err(|e| CoreError::storage(path, e))?;
    let mut r = BufReader::new(file);

    let mut header = [0u8; 12];
    r.read_exact(&mut header)
        .map_err(|e| CoreError::storage(path, e))?;
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if magic != CACHE_MAGIC || len > MAX_CACHE_BYTES {
        return Err(CoreError::Corrupt {
            what: "cache sidecar",
            path: path.display().to_string(),
            detail: "bad magic or length".to_string(),
        });
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .map_err(|e| CoreError::storage(path, e))?;
    if crc32fast::hash(&payload) != crc {
        return Err(CoreError::Corrupt {
            what: "cache sidecar",
            path: path.display().to_string(),
            detail: "crc mismatch".to_string(),
        });
    }
    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ranked_cache_tops_by_count() {
        let mut c = RowCache::new(CachePolicy::Ranked, 10);
        c.update(1, 5);
        c.update(2, 9);
        c.update(3, 9);
        c.update(4, 1);
        assert_eq!(c.top(2), vec![(2, 9), (3, 9)]);
        c.update(2, 0); // row emptied
        assert_eq!(c.top(2), vec![(3, 9), (1, 5)]);
    }

    #[test]
    fn lru_cache_evicts_oldest() {
        let mut c = RowCache::new(CachePolicy::Lru, 2);
        c.update(1, 10);
        c.update(2, 20);
        c.update(3, 30);
        let rows: Vec<u64> = c.entries().into_iter().map(|(r, _)| r).collect();
        assert!(!rows.contains(&1));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn none_cache_tracks_nothing() {
        let mut c = RowCache::new(CachePolicy::None, 100);
        c.update(1, 5);
        assert!(c.top(10).is_empty());
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.cache");
        store_sidecar(&path, 42, vec![(1, 5), (2, 9)]).unwrap();
        assert_eq!(load_sidecar(&path, 42), Some(vec![(1, 5), (2, 9)]));
    }

    #[test]
    fn sidecar_digest_mismatch_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.cache");
        store_sidecar(&path, 42, vec![(1, 5)]).unwrap();
        assert_eq!(load_sidecar(&path, 43), None);
    }

    #[test]
    fn sidecar_corruption_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.cache");
        store_sidecar(&path, 42, vec![(1, 5)]).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert_eq!(load_sidecar(&path, 42), None);
    }

    #[test]
    fn missing_sidecar_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_sidecar(&dir.path().join("none.cache"), 0), None);
    }

    #[test]
    fn policy_parse_round_trip() {
        for p in [CachePolicy::None, CachePolicy::Lru, CachePolicy::Ranked] {
            assert_eq!(p.to_string().parse::<CachePolicy>().unwrap(), p);
        }
        assert!("bogus".parse::<CachePolicy>().is_err());
    }
}
