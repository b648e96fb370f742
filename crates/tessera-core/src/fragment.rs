//! Fragment — the bitmap of one shard of one view.
//!
//! A fragment owns a two-dimensional sparse bitmap addressed as
//! (rowID, columnID), with columns confined to the fragment's shard range
//! `[shard * SHARD_WIDTH, (shard + 1) * SHARD_WIDTH)`. Rows are stored as
//! roaring bitmaps of column *offsets* relative to the shard base, which
//! keeps every offset inside u32 range.
//!
//! Bit-sliced (BSI) views reuse the same row space: row 0 is the presence
//! bit and rows `1..=bit_depth` hold the little-endian value bits of each
//! column.
//!
//! ## File format
//!
//! The fragment file is a concatenation of framed row containers, written
//! as an atomic snapshot (temp file + rename) in ascending row order:
//!
//! ```text
//! [magic: u32][row_id: u64][len: u32][crc32: u32][payload: roaring bytes]
//! ```
//!
//! Equal logical state always serializes to equal bytes, so fragment
//! digests are comparable across replicas. Any framing or checksum
//! violation on open is fatal and aborts the component open.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use roaring::RoaringBitmap;
use siphasher::sip::SipHasher24;
use tracing::{debug, warn};

use crate::cache::{self, CachePolicy, RowCache};
use crate::error::CoreError;
use crate::row::Row;
use crate::SHARD_WIDTH;

/// Presence row of a BSI block.
pub const BSI_EXISTS_ROW: u64 = 0;
/// First value-bit row of a BSI block; bit `i` lives at `BSI_OFFSET_ROW + i`.
pub const BSI_OFFSET_ROW: u64 = 1;

const FRAGMENT_MAGIC: u32 = 0x54455346; // "TESF"

/// Maximum serialized size of a single row container (16 MiB).
const MAX_ROW_BYTES: u32 = 16 * 1024 * 1024;

/// Mutations between automatic snapshots.
const SNAPSHOT_EVERY: u64 = 65_536;

// ─────────────────────────────────────────────
// RangeOp
// ─────────────────────────────────────────────

/// Comparison operators understood by the bit-sliced range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
}

// ─────────────────────────────────────────────
// Fragment
// ─────────────────────────────────────────────

pub struct Fragment {
    path: PathBuf,
    index: String,
    field: String,
    view: String,
    shard: u64,
    inner: Mutex<FragmentData>,
}

struct FragmentData {
    rows: BTreeMap<u64, RoaringBitmap>,
    cache: RowCache,
    dirty_ops: u64,
}

impl FragmentData {
    fn set_pos(&mut self, row: u64, off: u32) -> bool {
        self.rows.entry(row).or_default().insert(off)
    }

    fn clear_pos(&mut self, row: u64, off: u32) -> bool {
        if let Some(bm) = self.rows.get_mut(&row) {
            let changed = bm.remove(off);
            if bm.is_empty() {
                self.rows.remove(&row);
            }
            changed
        } else {
            false
        }
    }

    fn row_count(&self, row: u64) -> u64 {
        self.rows.get(&row).map(|b| b.len()).unwrap_or(0)
    }

    fn touch_cache(&mut self, row: u64) {
        let count = self.row_count(row);
        self.cache.update(row, count);
    }
}

impl Fragment {
    /// Open the fragment at `path`, loading the bitmap file if present and
    /// the cache sidecar if it matches the bitmap digest.
    pub fn open(
        path: impl Into<PathBuf>,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
        cache_policy: CachePolicy,
        cache_size: u32,
    ) -> Result<Self, CoreError> {
        let path = path.into();
        let rows = read_rows(&path)?;

        let mut data = FragmentData {
            rows,
            cache: RowCache::new(cache_policy, cache_size),
            dirty_ops: 0,
        };

        if cache_policy != CachePolicy::None {
            let digest = digest_rows(&data.rows);
            match cache::load_sidecar(&path.with_extension("cache"), digest) {
                Some(entries) => data.cache.load(entries),
                None => {
                    let counts: Vec<(u64, u64)> =
                        data.rows.iter().map(|(r, bm)| (*r, bm.len())).collect();
                    for (row, count) in counts {
                        data.cache.update(row, count);
                    }
                }
            }
        }

        debug!(index, field, view, shard, "fragment opened");
        Ok(Fragment {
            path,
            index: index.to_string(),
            field: field.to_string(),
            view: view.to_string(),
            shard,
            inner: Mutex::new(data),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FragmentData> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn shard(&self) -> u64 {
        self.shard
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the rebuildable cache sidecar next to the fragment file.
    pub fn cache_path(&self) -> PathBuf {
        self.path.with_extension("cache")
    }

    fn offset(&self, column: u64) -> Result<u32, CoreError> {
        if column / SHARD_WIDTH != self.shard {
            return Err(CoreError::ColumnOutOfShard {
                column,
                shard: self.shard,
            });
        }
        Ok((column % SHARD_WIDTH) as u32)
    }

    // ── Bit operations ─────────────────────────────────

    /// Set a bit. Returns `true` if the bit was not already set.
    pub fn set_bit(&self, row_id: u64, column: u64) -> Result<bool, CoreError> {
        let off = self.offset(column)?;
        let mut data = self.lock();
        let changed = data.set_pos(row_id, off);
        if changed {
            data.touch_cache(row_id);
            data.dirty_ops += 1;
        }
        self.maybe_snapshot(&mut data)?;
        Ok(changed)
    }

    /// Clear a bit. Returns `true` if the bit was set.
    pub fn clear_bit(&self, row_id: u64, column: u64) -> Result<bool, CoreError> {
        let off = self.offset(column)?;
        let mut data = self.lock();
        let changed = data.clear_pos(row_id, off);
        if changed {
            data.touch_cache(row_id);
            data.dirty_ops += 1;
        }
        self.maybe_snapshot(&mut data)?;
        Ok(changed)
    }

    /// Set a bit for a mutex field: clears the column from every other row
    /// first, so at most one row bit is set per column.
    pub fn set_mutex(&self, row_id: u64, column: u64) -> Result<bool, CoreError> {
        let off = self.offset(column)?;
        let mut data = self.lock();
        let mut changed = false;
        let others: Vec<u64> = data
            .rows
            .keys()
            .copied()
            .filter(|r| *r != row_id)
            .collect();
        for r in others {
            if data.clear_pos(r, off) {
                data.touch_cache(r);
                changed = true;
            }
        }
        if data.set_pos(row_id, off) {
            data.touch_cache(row_id);
            changed = true;
        }
        if changed {
            data.dirty_ops += 1;
        }
        self.maybe_snapshot(&mut data)?;
        Ok(changed)
    }

    /// The set of columns in `row_id`, as absolute column IDs. Read-only.
    pub fn row(&self, row_id: u64) -> Row {
        let data = self.lock();
        let base = self.shard * SHARD_WIDTH;
        match data.rows.get(&row_id) {
            Some(bm) => bm.iter().map(|off| base + off as u64).collect(),
            None => Row::new(),
        }
    }

    /// Row IDs present in this fragment, ascending.
    pub fn row_ids(&self) -> Vec<u64> {
        self.lock().rows.keys().copied().collect()
    }

    // ── BSI operations ─────────────────────────────────

    /// Store `value` for `column` across `bit_depth` value rows and set the
    /// presence bit. Returns `true` if any bit changed.
    pub fn set_value(&self, column: u64, bit_depth: u64, value: u64) -> Result<bool, CoreError> {
        let off = self.offset(column)?;
        let mut data = self.lock();
        let mut changed = false;
        for i in 0..bit_depth {
            let row = BSI_OFFSET_ROW + i;
            if value & (1 << i) != 0 {
                changed |= data.set_pos(row, off);
            } else {
                changed |= data.clear_pos(row, off);
            }
        }
        changed |= data.set_pos(BSI_EXISTS_ROW, off);
        if changed {
            data.dirty_ops += 1;
        }
        self.maybe_snapshot(&mut data)?;
        Ok(changed)
    }

    /// Read the value stored for `column`. Returns `(0, false)` when the
    /// presence bit is unset.
    pub fn value(&self, column: u64, bit_depth: u64) -> Result<(u64, bool), CoreError> {
        let off = self.offset(column)?;
        let data = self.lock();
        if !data
            .rows
            .get(&BSI_EXISTS_ROW)
            .map(|b| b.contains(off))
            .unwrap_or(false)
        {
            return Ok((0, false));
        }
        let mut value = 0u64;
        for i in 0..bit_depth {
            if data
                .rows
                .get(&(BSI_OFFSET_ROW + i))
                .map(|b| b.contains(off))
                .unwrap_or(false)
            {
                value |= 1 << i;
            }
        }
        Ok((value, true))
    }

    fn bsi_candidates(&self, data: &FragmentData, filter: Option<&Row>) -> RoaringBitmap {
        let exists = data
            .rows
            .get(&BSI_EXISTS_ROW)
            .cloned()
            .unwrap_or_default();
        match filter {
            Some(f) => &exists & &f.shard_offsets(self.shard),
            None => exists,
        }
    }

    /// Sum of stored values over the present columns of `filter`
    /// (all present columns when `filter` is `None`). Returns `(sum, count)`.
    pub fn sum(&self, filter: Option<&Row>, bit_depth: u64) -> (u64, u64) {
        let data = self.lock();
        let cands = self.bsi_candidates(&data, filter);
        let count = cands.len();
        if count == 0 {
            return (0, 0);
        }
        let mut sum = 0u64;
        for i in 0..bit_depth {
            if let Some(bm) = data.rows.get(&(BSI_OFFSET_ROW + i)) {
                sum += (1u64 << i) * (bm & &cands).len();
            }
        }
        (sum, count)
    }

    /// Minimum stored value and the number of columns holding it.
    /// `(0, 0)` when no columns are present.
    pub fn min(&self, filter: Option<&Row>, bit_depth: u64) -> (u64, u64) {
        let data = self.lock();
        let mut cands = self.bsi_candidates(&data, filter);
        if cands.is_empty() {
            return (0, 0);
        }
        let mut min = 0u64;
        for i in (0..bit_depth).rev() {
            let ones = data
                .rows
                .get(&(BSI_OFFSET_ROW + i))
                .map(|b| &cands & b)
                .unwrap_or_default();
            if ones.len() < cands.len() {
                cands -= ones;
            } else {
                min |= 1 << i;
                cands = ones;
            }
        }
        (min, cands.len())
    }

    /// Maximum stored value and the number of columns holding it.
    pub fn max(&self, filter: Option<&Row>, bit_depth: u64) -> (u64, u64) {
        let data = self.lock();
        let mut cands = self.bsi_candidates(&data, filter);
        if cands.is_empty() {
            return (0, 0);
        }
        let mut max = 0u64;
        for i in (0..bit_depth).rev() {
            let ones = data
                .rows
                .get(&(BSI_OFFSET_ROW + i))
                .map(|b| &cands & b)
                .unwrap_or_default();
            if !ones.is_empty() {
                max |= 1 << i;
                cands = ones;
            }
        }
        (max, cands.len())
    }

    /// Columns whose presence bit is set, as absolute column IDs.
    pub fn not_null(&self) -> Row {
        self.row(BSI_EXISTS_ROW)
    }

    /// Columns whose stored value satisfies `op predicate`.
    pub fn range_op(&self, op: RangeOp, bit_depth: u64, predicate: u64) -> Row {
        let data = self.lock();
        let local = self.range_local(&data, op, bit_depth, predicate);
        self.to_row(local)
    }

    /// Columns whose stored value lies in `[predicate_min, predicate_max]`.
    pub fn range_between(
        &self,
        bit_depth: u64,
        predicate_min: u64,
        predicate_max: u64,
    ) -> Row {
        let data = self.lock();
        let lo = self.range_local(&data, RangeOp::Gte, bit_depth, predicate_min);
        let hi = self.range_local(&data, RangeOp::Lte, bit_depth, predicate_max);
        self.to_row(&lo & &hi)
    }

    fn to_row(&self, local: RoaringBitmap) -> Row {
        let base = self.shard * SHARD_WIDTH;
        local.iter().map(|off| base + off as u64).collect()
    }

    fn range_local(
        &self,
        data: &FragmentData,
        op: RangeOp,
        bit_depth: u64,
        predicate: u64,
    ) -> RoaringBitmap {
        let exists = data
            .rows
            .get(&BSI_EXISTS_ROW)
            .cloned()
            .unwrap_or_default();
        match op {
            RangeOp::Eq => Self::range_eq(data, exists, bit_depth, predicate),
            RangeOp::Neq => {
                let eq = Self::range_eq(data, exists.clone(), bit_depth, predicate);
                &exists - &eq
            }
            RangeOp::Lt => Self::range_lt(data, exists, bit_depth, predicate, false),
            RangeOp::Lte => Self::range_lt(data, exists, bit_depth, predicate, true),
            RangeOp::Gt => Self::range_gt(data, exists, bit_depth, predicate, false),
            RangeOp::Gte => Self::range_gt(data, exists, bit_depth, predicate, true),
        }
    }

    fn range_eq(
        data: &FragmentData,
        exists: RoaringBitmap,
        bit_depth: u64,
        predicate: u64,
    ) -> RoaringBitmap {
        let mut cands = exists;
        for i in (0..bit_depth).rev() {
            let row = data.rows.get(&(BSI_OFFSET_ROW + i));
            if predicate & (1 << i) != 0 {
                cands = match row {
                    Some(bm) => &cands & bm,
                    None => RoaringBitmap::new(),
                };
            } else if let Some(bm) = row {
                cands -= bm;
            }
            if cands.is_empty() {
                break;
            }
        }
        cands
    }

    fn range_lt(
        data: &FragmentData,
        exists: RoaringBitmap,
        bit_depth: u64,
        predicate: u64,
        allow_eq: bool,
    ) -> RoaringBitmap {
        let mut keep = RoaringBitmap::new();
        let mut cands = exists;
        for i in (0..bit_depth).rev() {
            let ones = data
                .rows
                .get(&(BSI_OFFSET_ROW + i))
                .map(|b| &cands & b)
                .unwrap_or_default();
            if predicate & (1 << i) != 0 {
                // A zero here is strictly less regardless of lower bits.
                keep |= &cands - &ones;
                cands = ones;
            } else {
                // A one here is strictly greater; drop it.
                cands -= ones;
            }
            if cands.is_empty() {
                break;
            }
        }
        if allow_eq {
            keep | cands
        } else {
            keep
        }
    }

    fn range_gt(
        data: &FragmentData,
        exists: RoaringBitmap,
        bit_depth: u64,
        predicate: u64,
        allow_eq: bool,
    ) -> RoaringBitmap {
        let mut keep = RoaringBitmap::new();
        let mut cands = exists;
        for i in (0..bit_depth).rev() {
            let ones = data
                .rows
                .get(&(BSI_OFFSET_ROW + i))
                .map(|b| &cands & b)
                .unwrap_or_default();
            if predicate & (1 << i) != 0 {
                // A zero here is strictly less; drop it.
                cands = ones;
            } else {
                // A one here is strictly greater regardless of lower bits.
                keep |= &ones;
                cands -= ones;
            }
            if cands.is_empty() {
                break;
            }
        }
        if allow_eq {
            keep | cands
        } else {
            keep
        }
    }

    // ── Cache ──────────────────────────────────────────

    /// The top `n` rows by bit count, descending.
    pub fn top(&self, n: usize) -> Vec<(u64, u64)> {
        let data = self.lock();
        match data.cache {
            RowCache::None => {
                let mut v: Vec<(u64, u64)> =
                    data.rows.iter().map(|(r, bm)| (*r, bm.len())).collect();
                v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                v.truncate(n);
                v
            }
            _ => data.cache.top(n),
        }
    }

    /// Rebuild the row-count cache from the bitmap.
    pub fn recalculate_cache(&self) {
        let mut data = self.lock();
        data.cache.clear();
        let counts: Vec<(u64, u64)> = data.rows.iter().map(|(r, bm)| (*r, bm.len())).collect();
        for (row, count) in counts {
            data.cache.update(row, count);
        }
    }

    // ── Digest / merge ─────────────────────────────────

    /// Stable digest of the bitmap: XOR of per-row SipHash over the
    /// serialized row container. Equal logical state ⇒ equal digest.
    pub fn digest(&self) -> u64 {
        digest_rows(&self.lock().rows)
    }

    /// Serialized row containers, used by anti-entropy and resize transfers.
    pub fn export_rows(&self) -> Vec<(u64, Vec<u8>)> {
        let data = self.lock();
        data.rows
            .iter()
            .map(|(row, bm)| (*row, row_bytes(bm)))
            .collect()
    }

    /// Union remote row containers into this fragment. Monotonic: bits are
    /// gained, never lost. Persists a snapshot when anything changed.
    pub fn merge_rows(&self, rows: Vec<(u64, Vec<u8>)>) -> Result<bool, CoreError> {
        let mut data = self.lock();
        let mut changed = false;
        for (row, bytes) in rows {
            let incoming = RoaringBitmap::deserialize_from(&bytes[..])
                .map_err(|e| CoreError::Serialization(e.to_string()))?;
            let local = data.rows.entry(row).or_default();
            let before = local.len();
            *local |= incoming;
            if local.len() != before {
                changed = true;
                data.touch_cache(row);
            }
        }
        if changed {
            self.write_snapshot_locked(&mut data)?;
        }
        Ok(changed)
    }

    // ── Persistence ────────────────────────────────────

    fn maybe_snapshot(&self, data: &mut FragmentData) -> Result<(), CoreError> {
        if data.dirty_ops >= SNAPSHOT_EVERY {
            self.write_snapshot_locked(data)?;
        }
        Ok(())
    }

    /// Persist the bitmap and the cache sidecar.
    pub fn flush(&self) -> Result<(), CoreError> {
        let mut data = self.lock();
        self.write_snapshot_locked(&mut data)?;
        let digest = digest_rows(&data.rows);
        let entries = data.cache.entries();
        if !matches!(data.cache, RowCache::None) {
            cache::store_sidecar(&self.cache_path(), digest, entries)?;
        }
        Ok(())
    }

    /// Flush and release. The fragment must not be used afterwards.
    pub fn close(&self) -> Result<(), CoreError> {
        self.flush()
    }

    fn write_snapshot_locked(&self, data: &mut FragmentData) -> Result<(), CoreError> {
        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp).map_err(|e| CoreError::storage(&tmp, e))?;
            let mut w = BufWriter::new(file);
            for (row, bm) in &data.rows {
                let payload = row_bytes(bm);
                let crc = crc32fast::hash(&payload);
                w.write_all(&FRAGMENT_MAGIC.to_le_bytes())
                    .and_then(|_| w.write_all(&row.to_le_bytes()))
                    .and_then(|_| w.write_all(&(payload.len() as u32).to_le_bytes()))
                    .and_then(|_| w.write_all(&crc.to_le_bytes()))
                    .and_then(|_| w.write_all(&payload))
                    .map_err(|e| CoreError::storage(&tmp, e))?;
            }
            w.flush().map_err(|e| CoreError::storage(&tmp, e))?;
            w.get_ref()
                .sync_data()
                .map_err(|e| CoreError::storage(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| CoreError::storage(&self.path, e))?;
        data.dirty_ops = 0;
        Ok(())
    }
}

// ─────────────────────────────────────────────
// File helpers
// ─────────────────────────────────────────────

fn row_bytes(bm: &RoaringBitmap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bm.serialized_size());
    bm.serialize_into(&mut buf)
        .expect("serializing a roaring bitmap into a Vec cannot fail");
    buf
}

fn digest_rows(rows: &BTreeMap<u64, RoaringBitmap>) -> u64 {
    let mut digest = 0u64;
    for (row, bm) in rows {
        let mut h = SipHasher24::new();
        h.write_u64(*row);
        h.write(&row_bytes(bm));
        digest ^= h.finish();
    }
    digest
}

fn read_rows(path: &Path) -> Result<BTreeMap<u64, RoaringBitmap>, CoreError> {
    let mut rows = BTreeMap::new();
    if !path.exists() {
        return Ok(rows);
    }
    let corrupt = |detail: &str| CoreError::Corrupt {
        what: "fragment",
        path: path.display().to_string(),
        detail: detail.to_string(),
    };

    let file = File::open(path).map_err(|e| CoreError::storage(path, e))?;
    let mut r = BufReader::new(file);
    loop {
        let mut magic_buf = [0u8; 4];
        match r.read_exact(&mut magic_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CoreError::storage(path, e)),
        }
        if u32::from_le_bytes(magic_buf) != FRAGMENT_MAGIC {
            return Err(corrupt("bad record magic"));
        }

        let mut row_buf = [0u8; 8];
        r.read_exact(&mut row_buf)
            .map_err(|_| corrupt("truncated row id"))?;
        let row = u64::from_le_bytes(row_buf);

        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)
            .map_err(|_| corrupt("truncated length"))?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_ROW_BYTES {
            return Err(corrupt("row container too large"));
        }

        let mut crc_buf = [0u8; 4];
        r.read_exact(&mut crc_buf)
            .map_err(|_| corrupt("truncated checksum"))?;
        let crc = u32::from_le_bytes(crc_buf);

        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload)
            .map_err(|_| corrupt("truncated payload"))?;
        if crc32fast::hash(&payload) != crc {
            return Err(corrupt("checksum mismatch"));
        }

        let bm = RoaringBitmap::deserialize_from(&payload[..])
            .map_err(|_| corrupt("undecodable row container"))?;
        rows.insert(row, bm);
    }
    Ok(rows)
}

/// Remove the fragment file and its sidecar. A missing sidecar is logged
/// and ignored; a missing fragment file is an error.
pub fn delete_files(path: &Path) -> Result<(), CoreError> {
    fs::remove_file(path).map_err(|e| CoreError::storage(path, e))?;
    let cache = path.with_extension("cache");
    if let Err(e) = fs::remove_file(&cache) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %cache.display(), error = %e, "failed to delete cache sidecar");
        } else {
            debug!(path = %cache.display(), "no cache sidecar to delete");
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tmp() -> TempDir {
        TempDir::new().unwrap()
    }

    fn open_frag(dir: &TempDir, shard: u64) -> Fragment {
        Fragment::open(
            dir.path().join(shard.to_string()),
            "i",
            "f",
            "standard",
            shard,
            CachePolicy::Ranked,
            1000,
        )
        .unwrap()
    }

    #[test]
    fn set_get_clear_round_trip() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        assert!(f.set_bit(7, 100).unwrap());
        assert!(f.row(7).contains(100));
        assert!(f.clear_bit(7, 100).unwrap());
        assert!(!f.row(7).contains(100));
    }

    #[test]
    fn set_bit_is_idempotent() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        assert!(f.set_bit(3, 9).unwrap());
        assert!(!f.set_bit(3, 9).unwrap());
        assert_eq!(f.row(3).count(), 1);
        assert!(!f.clear_bit(3, 10).unwrap());
    }

    #[test]
    fn columns_outside_shard_are_rejected() {
        let dir = tmp();
        let f = open_frag(&dir, 1);
        assert!(f.set_bit(0, 5).is_err());
        assert!(f.set_bit(0, SHARD_WIDTH).is_ok());
        assert!(f.set_bit(0, 2 * SHARD_WIDTH).is_err());
    }

    #[test]
    fn row_reports_absolute_columns() {
        let dir = tmp();
        let f = open_frag(&dir, 2);
        let col = 2 * SHARD_WIDTH + 17;
        f.set_bit(1, col).unwrap();
        assert_eq!(f.row(1).columns(), vec![col]);
    }

    #[test]
    fn mutex_keeps_one_row_per_column() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        f.set_mutex(1, 42).unwrap();
        f.set_mutex(2, 42).unwrap();
        assert!(!f.row(1).contains(42));
        assert!(f.row(2).contains(42));
    }

    #[test]
    fn persistence_round_trip_is_byte_stable() {
        let dir = tmp();
        let path = dir.path().join("0");
        {
            let f = open_frag(&dir, 0);
            f.set_bit(7, 100).unwrap();
            f.set_bit(9, 3).unwrap();
            f.flush().unwrap();
        }
        let first = fs::read(&path).unwrap();
        let digest = {
            let f = open_frag(&dir, 0);
            assert!(f.row(7).contains(100));
            assert!(f.row(9).contains(3));
            f.flush().unwrap();
            f.digest()
        };
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);

        // Same logical state built in a different order digests identically.
        let dir2 = tmp();
        let g = open_frag(&dir2, 0);
        g.set_bit(9, 3).unwrap();
        g.set_bit(7, 100).unwrap();
        assert_eq!(g.digest(), digest);
    }

    #[test]
    fn set_then_clear_leaves_empty_state() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        f.set_bit(7, 1).unwrap();
        f.clear_bit(7, 1).unwrap();
        assert_eq!(f.digest(), {
            let dir2 = tmp();
            open_frag(&dir2, 0).digest()
        });
    }

    #[test]
    fn corrupted_file_fails_open() {
        let dir = tmp();
        let path = dir.path().join("0");
        {
            let f = open_frag(&dir, 0);
            f.set_bit(1, 1).unwrap();
            f.flush().unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = Fragment::open(&path, "i", "f", "standard", 0, CachePolicy::Ranked, 100)
            .err()
            .expect("open must fail on corruption");
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn stale_cache_sidecar_is_recomputed() {
        let dir = tmp();
        let path = dir.path().join("0");
        {
            let f = open_frag(&dir, 0);
            f.set_bit(1, 1).unwrap();
            f.flush().unwrap(); // sidecar written for this state
        }
        {
            // Mutate the bitmap, then crash without a flush: snapshot the new
            // bitmap directly so the sidecar is now stale.
            let f = open_frag(&dir, 0);
            f.set_bit(2, 2).unwrap();
            let mut data = f.lock();
            f.write_snapshot_locked(&mut data).unwrap();
        }
        let f = Fragment::open(&path, "i", "f", "standard", 0, CachePolicy::Ranked, 100).unwrap();
        // The stale sidecar must not mask row 2.
        assert_eq!(f.top(10), vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn top_ranks_rows_by_count() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        for c in 0..5 {
            f.set_bit(10, c).unwrap();
        }
        for c in 0..3 {
            f.set_bit(20, c).unwrap();
        }
        f.set_bit(30, 0).unwrap();
        assert_eq!(f.top(2), vec![(10, 5), (20, 3)]);
        f.recalculate_cache();
        assert_eq!(f.top(2), vec![(10, 5), (20, 3)]);
    }

    // ── BSI ────────────────────────────────────────────

    #[test]
    fn bsi_round_trip_all_values() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        for v in 0..16u64 {
            f.set_value(v, 4, v).unwrap();
        }
        for v in 0..16u64 {
            assert_eq!(f.value(v, 4).unwrap(), (v, true));
        }
        assert_eq!(f.value(99, 4).unwrap(), (0, false));
    }

    #[test]
    fn bsi_set_value_overwrites() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        assert!(f.set_value(1, 8, 200).unwrap());
        assert!(f.set_value(1, 8, 3).unwrap());
        assert!(!f.set_value(1, 8, 3).unwrap());
        assert_eq!(f.value(1, 8).unwrap(), (3, true));
    }

    #[test]
    fn bsi_sum_min_max() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        f.set_value(1, 8, 10).unwrap();
        f.set_value(2, 8, 20).unwrap();
        f.set_value(3, 8, 30).unwrap();

        assert_eq!(f.sum(None, 8), (60, 3));
        assert_eq!(f.min(None, 8), (10, 1));
        assert_eq!(f.max(None, 8), (30, 1));

        let filter = Row::from_columns([2, 3]);
        assert_eq!(f.sum(Some(&filter), 8), (50, 2));
        assert_eq!(f.min(Some(&filter), 8), (20, 1));

        let empty = Row::new();
        assert_eq!(f.sum(Some(&empty), 8), (0, 0));
        assert_eq!(f.min(Some(&empty), 8), (0, 0));
        assert_eq!(f.max(Some(&empty), 8), (0, 0));
    }

    #[test]
    fn bsi_min_max_count_ties() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        f.set_value(1, 4, 7).unwrap();
        f.set_value(2, 4, 7).unwrap();
        f.set_value(3, 4, 9).unwrap();
        assert_eq!(f.min(None, 4), (7, 2));
        assert_eq!(f.max(None, 4), (9, 1));
    }

    #[test]
    fn bsi_range_operators() {
        let dir = tmp();
        let f = open_frag(&dir, 0);
        for (col, v) in [(1u64, 10u64), (2, 20), (3, 30), (4, 20)] {
            f.set_value(col, 8, v).unwrap();
        }

        assert_eq!(f.range_op(RangeOp::Lt, 8, 20).columns(), vec![1]);
        assert_eq!(f.range_op(RangeOp::Lte, 8, 20).columns(), vec![1, 2, 4]);
        assert_eq!(f.range_op(RangeOp::Gt, 8, 20).columns(), vec![3]);
        assert_eq!(f.range_op(RangeOp::Gte, 8, 20).columns(), vec![2, 3, 4]);
        assert_eq!(f.range_op(RangeOp::Eq, 8, 20).columns(), vec![2, 4]);
        assert_eq!(f.range_op(RangeOp::Neq, 8, 20).columns(), vec![1, 3]);
        assert_eq!(f.range_between(8, 15, 25).columns(), vec![2, 4]);
        assert!(f.range_op(RangeOp::Lt, 8, 0).is_empty());
        assert_eq!(f.range_op(RangeOp::Gte, 8, 0).count(), 4);
    }

    // ── Digest / merge ─────────────────────────────────

    #[test]
    fn merge_is_monotonic() {
        let dir_a = tmp();
        let dir_b = tmp();
        let a = open_frag(&dir_a, 0);
        let b = open_frag(&dir_b, 0);
        a.set_bit(1, 10).unwrap();
        a.set_bit(2, 20).unwrap();
        b.set_bit(1, 11).unwrap();

        assert_ne!(a.digest(), b.digest());
        assert!(b.merge_rows(a.export_rows()).unwrap());
        assert!(a.merge_rows(b.export_rows()).unwrap());

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.row(1).columns(), vec![10, 11]);
        assert_eq!(b.row(2).columns(), vec![20]);

        // Re-merging identical data changes nothing.
        assert!(!b.merge_rows(a.export_rows()).unwrap());
    }
}
