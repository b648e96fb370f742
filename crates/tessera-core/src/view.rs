//! View — fragments grouped under one bitmap layout.
//!
//! A field owns one view per layout: `standard`, one per time quantum unit
//! (`standard_201701`, ...), or a single bit-sliced `bsig_<field>` view for
//! numeric data. The view routes single-column operations to the fragment
//! owning `column / SHARD_WIDTH` and fans reads out over all fragments.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::broadcast::{Broadcaster, Message};
use crate::cache::CachePolicy;
use crate::error::CoreError;
use crate::fragment::{self, Fragment, RangeOp, BSI_EXISTS_ROW};
use crate::row::Row;
use crate::{SHARD_WIDTH, VIEW_BSI_PREFIX};

pub struct View {
    index: String,
    field: String,
    name: String,
    path: PathBuf,
    node_id: String,
    cache_policy: CachePolicy,
    cache_size: u32,
    broadcaster: Arc<dyn Broadcaster>,
    inner: RwLock<ViewData>,
}

struct ViewData {
    fragments: HashMap<u64, Arc<Fragment>>,
    /// Highest shard ever seen by this view. Crossing it triggers a
    /// synchronous `CreateShard` broadcast before the creation succeeds.
    max_shard: u64,
}

impl View {
    /// Open the view at `path`, creating its directory layout and loading
    /// any fragments already on disk.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path: impl Into<PathBuf>,
        index: &str,
        field: &str,
        name: &str,
        node_id: &str,
        cache_policy: CachePolicy,
        cache_size: u32,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, CoreError> {
        let path = path.into();
        // Bit-sliced views never keep a row cache.
        let cache_policy = if name.starts_with(VIEW_BSI_PREFIX) {
            CachePolicy::None
        } else {
            cache_policy
        };

        let fragments_dir = path.join("fragments");
        fs::create_dir_all(&fragments_dir).map_err(|e| CoreError::storage(&fragments_dir, e))?;

        let view = View {
            index: index.to_string(),
            field: field.to_string(),
            name: name.to_string(),
            path,
            node_id: node_id.to_string(),
            cache_policy,
            cache_size,
            broadcaster,
            inner: RwLock::new(ViewData {
                fragments: HashMap::new(),
                max_shard: 0,
            }),
        };
        view.open_fragments()?;
        Ok(view)
    }

    fn open_fragments(&self) -> Result<(), CoreError> {
        let dir = self.path.join("fragments");
        let entries = fs::read_dir(&dir).map_err(|e| CoreError::storage(&dir, e))?;
        let mut data = self.write();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            // Fragment files are named by shard number; skip sidecars.
            let shard: u64 = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => match name.parse() {
                    Ok(shard) => shard,
                    Err(_) => continue,
                },
                None => continue,
            };
            let frag = self.open_fragment(shard)?;
            data.max_shard = data.max_shard.max(shard);
            data.fragments.insert(shard, Arc::new(frag));
        }
        debug!(
            index = %self.index,
            field = %self.field,
            view = %self.name,
            fragments = data.fragments.len(),
            "view opened"
        );
        Ok(())
    }

    fn open_fragment(&self, shard: u64) -> Result<Fragment, CoreError> {
        Fragment::open(
            self.fragment_path(shard),
            &self.index,
            &self.field,
            &self.name,
            shard,
            self.cache_policy,
            self.cache_size,
        )
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ViewData> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ViewData> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_bsi(&self) -> bool {
        self.name.starts_with(VIEW_BSI_PREFIX)
    }

    pub fn max_shard(&self) -> u64 {
        self.read().max_shard
    }

    fn fragment_path(&self, shard: u64) -> PathBuf {
        self.path.join("fragments").join(shard.to_string())
    }

    // ── Fragment management ────────────────────────────

    pub fn fragment(&self, shard: u64) -> Option<Arc<Fragment>> {
        self.read().fragments.get(&shard).cloned()
    }

    pub fn all_fragments(&self) -> Vec<Arc<Fragment>> {
        self.read().fragments.values().cloned().collect()
    }

    pub fn shards(&self) -> Vec<u64> {
        let mut shards: Vec<u64> = self.read().fragments.keys().copied().collect();
        shards.sort_unstable();
        shards
    }

    /// Get or create the fragment for `shard`, broadcasting `CreateShard`
    /// when the shard crosses the view watermark. A failed broadcast aborts
    /// the creation; nothing is inserted and the watermark is unchanged.
    pub fn create_fragment_if_not_exists(
        &self,
        shard: u64,
    ) -> Result<(Arc<Fragment>, bool), CoreError> {
        // Held across the broadcast on purpose: two writers must not both
        // conclude they were first over the watermark.
        let mut data = self.write();
        if let Some(frag) = data.fragments.get(&shard) {
            return Ok((frag.clone(), false));
        }
        let frag = Arc::new(self.open_fragment(shard)?);
        if shard > data.max_shard {
            self.broadcaster
                .send_sync(&Message::CreateShard {
                    index: self.index.clone(),
                    shard,
                    origin: self.node_id.clone(),
                })
                .map_err(|e| CoreError::Broadcast(e.to_string()))?;
            data.max_shard = shard;
        }
        data.fragments.insert(shard, frag.clone());
        Ok((frag, true))
    }

    /// Like [`create_fragment_if_not_exists`] but without the broadcast —
    /// used when applying remote state (resize pulls, anti-entropy).
    pub fn create_fragment_base(&self, shard: u64) -> Result<Arc<Fragment>, CoreError> {
        let mut data = self.write();
        if let Some(frag) = data.fragments.get(&shard) {
            return Ok(frag.clone());
        }
        let frag = Arc::new(self.open_fragment(shard)?);
        data.max_shard = data.max_shard.max(shard);
        data.fragments.insert(shard, frag.clone());
        Ok(frag)
    }

    /// Close and delete one fragment and its files.
    pub fn delete_fragment(&self, shard: u64) -> Result<(), CoreError> {
        let mut data = self.write();
        let frag = data
            .fragments
            .remove(&shard)
            .ok_or(CoreError::FragmentNotFound(shard))?;
        info!(
            index = %self.index,
            field = %self.field,
            view = %self.name,
            shard,
            "deleting fragment"
        );
        frag.close()?;
        fragment::delete_files(frag.path())
    }

    // ── Bit fan-outs ───────────────────────────────────

    pub fn set_bit(&self, row_id: u64, column: u64) -> Result<bool, CoreError> {
        if self.is_bsi() && row_id == BSI_EXISTS_ROW {
            return Err(CoreError::FieldTypeMismatch("bit-sliced view presence row"));
        }
        let (frag, _) = self.create_fragment_if_not_exists(column / SHARD_WIDTH)?;
        frag.set_bit(row_id, column)
    }

    pub fn clear_bit(&self, row_id: u64, column: u64) -> Result<bool, CoreError> {
        match self.fragment(column / SHARD_WIDTH) {
            Some(frag) => frag.clear_bit(row_id, column),
            None => Ok(false),
        }
    }

    pub fn set_mutex(&self, row_id: u64, column: u64) -> Result<bool, CoreError> {
        let (frag, _) = self.create_fragment_if_not_exists(column / SHARD_WIDTH)?;
        frag.set_mutex(row_id, column)
    }

    /// Union of `row_id` across every fragment.
    pub fn row(&self, row_id: u64) -> Row {
        let mut row = Row::new();
        for frag in self.all_fragments() {
            row.merge(&frag.row(row_id));
        }
        row
    }

    // ── BSI fan-outs ───────────────────────────────────

    pub fn set_value(&self, column: u64, bit_depth: u64, value: u64) -> Result<bool, CoreError> {
        let (frag, _) = self.create_fragment_if_not_exists(column / SHARD_WIDTH)?;
        frag.set_value(column, bit_depth, value)
    }

    pub fn value(&self, column: u64, bit_depth: u64) -> Result<(u64, bool), CoreError> {
        match self.fragment(column / SHARD_WIDTH) {
            Some(frag) => frag.value(column, bit_depth),
            None => Ok((0, false)),
        }
    }

    pub fn sum(&self, filter: Option<&Row>, bit_depth: u64) -> (u64, u64) {
        let mut sum = 0u64;
        let mut count = 0u64;
        for frag in self.all_fragments() {
            let (fsum, fcount) = frag.sum(filter, bit_depth);
            sum += fsum;
            count += fcount;
        }
        (sum, count)
    }

    pub fn min(&self, filter: Option<&Row>, bit_depth: u64) -> (u64, u64) {
        let mut min = 0u64;
        let mut count = 0u64;
        let mut has_value = false;
        for frag in self.all_fragments() {
            let (fmin, fcount) = frag.min(filter, bit_depth);
            if fcount == 0 {
                continue;
            }
            if !has_value || fmin < min {
                min = fmin;
                count = fcount;
                has_value = true;
            } else if fmin == min {
                count += fcount;
            }
        }
        (min, count)
    }

    pub fn max(&self, filter: Option<&Row>, bit_depth: u64) -> (u64, u64) {
        let mut max = 0u64;
        let mut count = 0u64;
        let mut has_value = false;
        for frag in self.all_fragments() {
            let (fmax, fcount) = frag.max(filter, bit_depth);
            if fcount == 0 {
                continue;
            }
            if !has_value || fmax > max {
                max = fmax;
                count = fcount;
                has_value = true;
            } else if fmax == max {
                count += fcount;
            }
        }
        (max, count)
    }

    pub fn not_null(&self) -> Row {
        let mut row = Row::new();
        for frag in self.all_fragments() {
            row.merge(&frag.not_null());
        }
        row
    }

    pub fn range_op(&self, op: RangeOp, bit_depth: u64, predicate: u64) -> Row {
        let mut row = Row::new();
        for frag in self.all_fragments() {
            row.merge(&frag.range_op(op, bit_depth, predicate));
        }
        row
    }

    pub fn range_between(&self, bit_depth: u64, min: u64, max: u64) -> Row {
        let mut row = Row::new();
        for frag in self.all_fragments() {
            row.merge(&frag.range_between(bit_depth, min, max));
        }
        row
    }

    // ── Lifecycle ──────────────────────────────────────

    pub fn recalculate_caches(&self) {
        for frag in self.all_fragments() {
            frag.recalculate_cache();
        }
    }

    pub fn close(&self) -> Result<(), CoreError> {
        let data = self.read();
        for frag in data.fragments.values() {
            frag.close()?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NopBroadcaster;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Broadcaster that records sync messages and can be told to fail.
    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: Mutex<Vec<Message>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl Broadcaster for RecordingBroadcaster {
        fn send_sync(&self, msg: &Message) -> Result<(), CoreError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::Broadcast("peer unreachable".into()));
            }
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(msg.clone());
            Ok(())
        }

        fn send_async(&self, msg: &Message) -> Result<(), CoreError> {
            self.send_sync(msg)
        }

        fn send_to(&self, _node: &crate::node::Node, msg: &Message) -> Result<(), CoreError> {
            self.send_sync(msg)
        }
    }

    fn open_view(dir: &TempDir, name: &str, b: Arc<dyn Broadcaster>) -> View {
        View::open(
            dir.path().join(name),
            "i",
            "f",
            name,
            "node-a",
            CachePolicy::Ranked,
            1000,
            b,
        )
        .unwrap()
    }

    #[test]
    fn routes_shard_boundary_columns_to_adjacent_fragments() {
        let dir = TempDir::new().unwrap();
        let v = open_view(&dir, "standard", Arc::new(NopBroadcaster));
        v.set_bit(7, SHARD_WIDTH - 1).unwrap();
        v.set_bit(7, SHARD_WIDTH).unwrap();

        assert_eq!(v.shards(), vec![0, 1]);
        assert_eq!(v.row(7).columns(), vec![SHARD_WIDTH - 1, SHARD_WIDTH]);
        assert_eq!(v.row(7).count(), 2);
    }

    #[test]
    fn crossing_the_watermark_broadcasts_create_shard() {
        let dir = TempDir::new().unwrap();
        let b = Arc::new(RecordingBroadcaster::default());
        let v = open_view(&dir, "standard", b.clone());

        v.set_bit(0, 5).unwrap(); // shard 0: equals initial watermark, no broadcast
        v.set_bit(0, 3 * SHARD_WIDTH).unwrap(); // shard 3: crosses
        v.set_bit(0, 2 * SHARD_WIDTH).unwrap(); // shard 2: below watermark

        let sent = b.sent.lock().unwrap();
        let shards: Vec<u64> = sent
            .iter()
            .filter_map(|m| match m {
                Message::CreateShard { shard, .. } => Some(*shard),
                _ => None,
            })
            .collect();
        assert_eq!(shards, vec![3]);
        assert_eq!(v.max_shard(), 3);
    }

    #[test]
    fn failed_broadcast_aborts_fragment_creation() {
        let dir = TempDir::new().unwrap();
        let b = Arc::new(RecordingBroadcaster::default());
        let v = open_view(&dir, "standard", b.clone());
        b.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(v.set_bit(0, 5 * SHARD_WIDTH).is_err());
        assert!(v.fragment(5).is_none());
        assert_eq!(v.max_shard(), 0);

        b.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(v.set_bit(0, 5 * SHARD_WIDTH).is_ok());
        assert_eq!(v.max_shard(), 5);
    }

    #[test]
    fn clear_bit_without_fragment_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let v = open_view(&dir, "standard", Arc::new(NopBroadcaster));
        assert!(!v.clear_bit(1, 1).unwrap());
        assert!(v.shards().is_empty());
    }

    #[test]
    fn bsi_view_forces_cache_off_and_guards_presence_row() {
        let dir = TempDir::new().unwrap();
        let v = open_view(&dir, "bsig_f", Arc::new(NopBroadcaster));
        assert_eq!(v.cache_policy, CachePolicy::None);
        assert!(v.set_bit(0, 1).is_err());
        assert!(v.set_bit(1, 1).is_ok());
    }

    #[test]
    fn reopens_fragments_from_disk() {
        let dir = TempDir::new().unwrap();
        {
            let v = open_view(&dir, "standard", Arc::new(NopBroadcaster));
            v.set_bit(9, 4).unwrap();
            v.set_bit(9, SHARD_WIDTH + 4).unwrap();
            v.close().unwrap();
        }
        let v = open_view(&dir, "standard", Arc::new(NopBroadcaster));
        assert_eq!(v.shards(), vec![0, 1]);
        assert_eq!(v.max_shard(), 1);
        assert_eq!(v.row(9).count(), 2);
    }

    #[test]
    fn delete_fragment_removes_files() {
        let dir = TempDir::new().unwrap();
        let v = open_view(&dir, "standard", Arc::new(NopBroadcaster));
        v.set_bit(1, 2).unwrap();
        v.close().unwrap();
        let path = v.fragment_path(0);
        assert!(path.exists());

        v.delete_fragment(0).unwrap();
        assert!(!path.exists());
        assert!(v.fragment(0).is_none());
        assert!(matches!(
            v.delete_fragment(0),
            Err(CoreError::FragmentNotFound(0))
        ));
    }

    #[test]
    fn bsi_fan_out_across_shards() {
        let dir = TempDir::new().unwrap();
        let v = open_view(&dir, "bsig_f", Arc::new(NopBroadcaster));
        v.set_value(1, 8, 10).unwrap();
        v.set_value(SHARD_WIDTH + 1, 8, 30).unwrap();

        assert_eq!(v.sum(None, 8), (40, 2));
        assert_eq!(v.min(None, 8), (10, 1));
        assert_eq!(v.max(None, 8), (30, 1));
        assert_eq!(
            v.range_op(RangeOp::Gt, 8, 15).columns(),
            vec![SHARD_WIDTH + 1]
        );
        assert_eq!(v.value(SHARD_WIDTH + 1, 8).unwrap(), (30, true));
        assert_eq!(v.value(42, 8).unwrap(), (0, false));
    }
}
