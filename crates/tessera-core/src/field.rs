//! Field — a typed, named column within an index.
//!
//! The field decides which views a write lands in: plain `set` fields use
//! the standard view, `time` fields add one view per quantum unit, `mutex`
//! and `bool` fields enforce at-most-one-row semantics, and `int` fields
//! store values in a single bit-sliced `bsig_<field>` view. Numeric fields
//! also translate between the user's signed range and the unsigned offsets
//! the bit-sliced encoding works in.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attr::AttrStore;
use crate::broadcast::{Broadcaster, Message};
use crate::cache::{CachePolicy, DEFAULT_CACHE_SIZE};
use crate::error::CoreError;
pub use crate::fragment::RangeOp;
use crate::row::Row;
use crate::time::{views_by_time, TimeQuantum};
use crate::view::View;
use crate::{validate_name, VIEW_BSI_PREFIX, VIEW_STANDARD};

// ─────────────────────────────────────────────
// FieldType / FieldOptions
// ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Plain row/column bitmap.
    Set,
    /// Bit-sliced signed integer per column.
    Int,
    /// Set plus per-quantum time views.
    Time,
    /// At most one row bit per column.
    Mutex,
    /// Mutex restricted to rows 0 (false) and 1 (true).
    Bool,
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType::Set
    }
}

impl std::str::FromStr for FieldType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "set" => Ok(FieldType::Set),
            "int" => Ok(FieldType::Int),
            "time" => Ok(FieldType::Time),
            "mutex" => Ok(FieldType::Mutex),
            "bool" => Ok(FieldType::Bool),
            other => Err(CoreError::UnknownFieldType(other.to_string())),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Set => write!(f, "set"),
            FieldType::Int => write!(f, "int"),
            FieldType::Time => write!(f, "time"),
            FieldType::Mutex => write!(f, "mutex"),
            FieldType::Bool => write!(f, "bool"),
        }
    }
}

/// Persisted per-field configuration (stored as the field's `.meta` record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOptions {
    pub field_type: FieldType,
    pub cache_policy: CachePolicy,
    pub cache_size: u32,
    /// Inclusive signed value range for `int` fields.
    pub min: i64,
    pub max: i64,
    /// Materialised granularities for `time` fields.
    pub time_quantum: TimeQuantum,
}

impl Default for FieldOptions {
    fn default() -> Self {
        Self {
            field_type: FieldType::Set,
            cache_policy: CachePolicy::Ranked,
            cache_size: DEFAULT_CACHE_SIZE,
            min: 0,
            max: 0,
            time_quantum: TimeQuantum::default(),
        }
    }
}

impl FieldOptions {
    pub fn int(min: i64, max: i64) -> Self {
        Self {
            field_type: FieldType::Int,
            cache_policy: CachePolicy::None,
            min,
            max,
            ..Default::default()
        }
    }

    pub fn time(quantum: TimeQuantum) -> Self {
        Self {
            field_type: FieldType::Time,
            time_quantum: quantum,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.field_type == FieldType::Int && self.min >= self.max {
            return Err(CoreError::InvalidRange {
                min: self.min,
                max: self.max,
            });
        }
        if self.field_type == FieldType::Time && self.time_quantum.is_empty() {
            return Err(CoreError::UnknownTimeQuantum(String::new()));
        }
        Ok(())
    }

    /// Bits needed to encode any offset in `[0, max - min]`.
    pub fn bit_depth(&self) -> u64 {
        let range = (self.max as i128 - self.min as i128) as u128;
        let bits = (128 - range.leading_zeros()) as u64;
        bits.clamp(1, 64)
    }
}

// ─────────────────────────────────────────────
// .meta persistence
// ─────────────────────────────────────────────
//
// Record: [magic: u32][len: u32][crc32: u32][payload: bincode FieldOptions]
// Decoding reads exactly one record and tolerates unknown trailing bytes,
// so newer writers may append extensions without breaking old readers.

const META_MAGIC: u32 = 0x5445534D; // "TESM"
const MAX_META_BYTES: u32 = 1024 * 1024;

pub(crate) fn save_meta<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    let payload = bincode::serialize(value)?;
    let tmp = path.with_extension("meta.tmp");
    {
        let file = File::create(&tmp).map_err(|e| CoreError::storage(&tmp, e))?;
        let mut w = BufWriter::new(file);
        w.write_all(&META_MAGIC.to_le_bytes())
            .and_then(|_| w.write_all(&(payload.len() as u32).to_le_bytes()))
            .and_then(|_| w.write_all(&crc32fast::hash(&payload).to_le_bytes()))
            .and_then(|_| w.write_all(&payload))
            .and_then(|_| w.flush())
            .map_err(|e| CoreError::storage(&tmp, e))?;
        w.get_ref()
            .sync_data()
            .map_err(|e| CoreError::storage(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| CoreError::storage(path, e))
}

pub(crate) fn load_meta<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CoreError> {
    let corrupt = |detail: &str| CoreError::Corrupt {
        what: "meta record",
        path: path.display().to_string(),
        detail: detail.to_string(),
    };
    let file = File::open(path).map_err(|e| CoreError::storage(path, e))?;
    let mut r = BufReader::new(file);

    let mut header = [0u8; 12];
    r.read_exact(&mut header)
        .map_err(|_| corrupt("truncated header"))?;
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if magic != META_MAGIC || len > MAX_META_BYTES {
        return Err(corrupt("bad magic or length"));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .map_err(|_| corrupt("truncated payload"))?;
    if crc32fast::hash(&payload) != crc {
        return Err(corrupt("checksum mismatch"));
    }
    // Anything after the record is a forward-compatible extension; ignore it.
    Ok(bincode::deserialize(&payload)?)
}

// ─────────────────────────────────────────────
// Field
// ─────────────────────────────────────────────

pub struct Field {
    index: String,
    name: String,
    path: PathBuf,
    node_id: String,
    options: FieldOptions,
    broadcaster: Arc<dyn Broadcaster>,
    row_attrs: Arc<dyn AttrStore>,
    views: RwLock<HashMap<String, Arc<View>>>,
}

impl Field {
    /// Open the field at `path`. When a `.meta` record exists it wins;
    /// otherwise `options` (validated) is persisted as the new record.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path: impl Into<PathBuf>,
        index: &str,
        name: &str,
        node_id: &str,
        options: Option<FieldOptions>,
        broadcaster: Arc<dyn Broadcaster>,
        row_attrs: Arc<dyn AttrStore>,
    ) -> Result<Self, CoreError> {
        validate_name(name)?;
        let path = path.into();
        fs::create_dir_all(path.join("attrs")).map_err(|e| CoreError::storage(&path, e))?;
        fs::create_dir_all(path.join("views")).map_err(|e| CoreError::storage(&path, e))?;

        let meta_path = path.join(".meta");
        let options = if meta_path.exists() {
            load_meta(&meta_path)?
        } else {
            let options = options.unwrap_or_default();
            options.validate()?;
            save_meta(&meta_path, &options)?;
            options
        };

        let field = Field {
            index: index.to_string(),
            name: name.to_string(),
            path,
            node_id: node_id.to_string(),
            options,
            broadcaster,
            row_attrs,
            views: RwLock::new(HashMap::new()),
        };
        field.open_views()?;
        Ok(field)
    }

    fn open_views(&self) -> Result<(), CoreError> {
        let dir = self.path.join("views");
        let entries = fs::read_dir(&dir).map_err(|e| CoreError::storage(&dir, e))?;
        let mut views = self.write_views();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let view_name = entry.file_name().to_string_lossy().into_owned();
            let view = self.open_view(&view_name)?;
            views.insert(view_name, Arc::new(view));
        }
        debug!(index = %self.index, field = %self.name, views = views.len(), "field opened");
        Ok(())
    }

    fn open_view(&self, view_name: &str) -> Result<View, CoreError> {
        View::open(
            self.path.join("views").join(view_name),
            &self.index,
            &self.name,
            view_name,
            &self.node_id,
            self.options.cache_policy,
            self.options.cache_size,
            self.broadcaster.clone(),
        )
    }

    fn read_views(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<View>>> {
        self.views.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_views(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<View>>> {
        self.views.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &FieldOptions {
        &self.options
    }

    pub fn field_type(&self) -> FieldType {
        self.options.field_type
    }

    pub fn row_attrs(&self) -> &Arc<dyn AttrStore> {
        &self.row_attrs
    }

    fn bsi_view_name(&self) -> String {
        format!("{VIEW_BSI_PREFIX}{}", self.name)
    }

    // ── Views ──────────────────────────────────────────

    pub fn view(&self, name: &str) -> Option<Arc<View>> {
        self.read_views().get(name).cloned()
    }

    pub fn views(&self) -> Vec<Arc<View>> {
        self.read_views().values().cloned().collect()
    }

    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_views().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get or create a view, announcing the creation to every peer first.
    /// The view only exists locally once every peer has acknowledged.
    pub fn create_view_if_not_exists(
        &self,
        view_name: &str,
    ) -> Result<(Arc<View>, bool), CoreError> {
        if let Some(view) = self.view(view_name) {
            return Ok((view, false));
        }
        self.broadcaster
            .send_sync(&Message::CreateView {
                index: self.index.clone(),
                field: self.name.clone(),
                view: view_name.to_string(),
            })
            .map_err(|e| CoreError::Broadcast(e.to_string()))?;
        Ok((self.create_view_base(view_name)?, true))
    }

    /// Create a view locally without broadcasting (remote apply path).
    pub fn create_view_base(&self, view_name: &str) -> Result<Arc<View>, CoreError> {
        let mut views = self.write_views();
        if let Some(view) = views.get(view_name) {
            return Ok(view.clone());
        }
        let view = Arc::new(self.open_view(view_name)?);
        views.insert(view_name.to_string(), view.clone());
        Ok(view)
    }

    /// Delete a view: announce, then drop it locally with its files.
    pub fn delete_view(&self, view_name: &str) -> Result<(), CoreError> {
        if self.view(view_name).is_none() {
            return Err(CoreError::ViewNotFound(view_name.to_string()));
        }
        self.broadcaster
            .send_sync(&Message::DeleteView {
                index: self.index.clone(),
                field: self.name.clone(),
                view: view_name.to_string(),
            })
            .map_err(|e| CoreError::Broadcast(e.to_string()))?;
        self.delete_view_base(view_name)
    }

    pub fn delete_view_base(&self, view_name: &str) -> Result<(), CoreError> {
        let view = {
            let mut views = self.write_views();
            match views.remove(view_name) {
                Some(view) => view,
                None => return Err(CoreError::ViewNotFound(view_name.to_string())),
            }
        };
        view.close()?;
        fs::remove_dir_all(view.path()).map_err(|e| CoreError::storage(view.path(), e))?;
        info!(index = %self.index, field = %self.name, view = view_name, "view deleted");
        Ok(())
    }

    // ── Bit writes ─────────────────────────────────────

    /// Set a bit, routed by field type. `timestamp` only matters for time
    /// fields, which additionally write one bit per quantum view.
    pub fn set_bit(
        &self,
        row_id: u64,
        column: u64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<bool, CoreError> {
        match self.options.field_type {
            FieldType::Set => {
                let (view, _) = self.create_view_if_not_exists(VIEW_STANDARD)?;
                view.set_bit(row_id, column)
            }
            FieldType::Mutex => {
                let (view, _) = self.create_view_if_not_exists(VIEW_STANDARD)?;
                view.set_mutex(row_id, column)
            }
            FieldType::Bool => {
                if row_id > 1 {
                    return Err(CoreError::InvalidBoolRow(row_id));
                }
                let (view, _) = self.create_view_if_not_exists(VIEW_STANDARD)?;
                view.set_mutex(row_id, column)
            }
            FieldType::Time => {
                let (view, _) = self.create_view_if_not_exists(VIEW_STANDARD)?;
                let mut changed = view.set_bit(row_id, column)?;
                if let Some(t) = timestamp {
                    for name in views_by_time(VIEW_STANDARD, t, self.options.time_quantum) {
                        let (view, _) = self.create_view_if_not_exists(&name)?;
                        changed |= view.set_bit(row_id, column)?;
                    }
                }
                Ok(changed)
            }
            FieldType::Int => Err(CoreError::FieldTypeMismatch("int")),
        }
    }

    pub fn clear_bit(&self, row_id: u64, column: u64) -> Result<bool, CoreError> {
        match self.view(VIEW_STANDARD) {
            Some(view) => view.clear_bit(row_id, column),
            None => Ok(false),
        }
    }

    /// The standard-view row, as absolute column IDs.
    pub fn row(&self, row_id: u64) -> Row {
        match self.view(VIEW_STANDARD) {
            Some(view) => view.row(row_id),
            None => Row::new(),
        }
    }

    /// Top `n` rows of the standard view by bit count.
    pub fn top_n(&self, n: usize) -> Vec<(u64, u64)> {
        let view = match self.view(VIEW_STANDARD) {
            Some(view) => view,
            None => return Vec::new(),
        };
        let mut counts: HashMap<u64, u64> = HashMap::new();
        for frag in view.all_fragments() {
            for (row, count) in frag.top(usize::MAX) {
                *counts.entry(row).or_default() += count;
            }
        }
        let mut entries: Vec<(u64, u64)> = counts.into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }

    // ── Numeric (BSI) operations ───────────────────────

    fn require_int(&self) -> Result<(), CoreError> {
        if self.options.field_type != FieldType::Int {
            return Err(CoreError::FieldTypeMismatch("non-int field"));
        }
        Ok(())
    }

    fn to_offset(&self, value: i64) -> Result<u64, CoreError> {
        if value < self.options.min || value > self.options.max {
            return Err(CoreError::ValueOutOfRange(value));
        }
        Ok((value as i128 - self.options.min as i128) as u64)
    }

    fn from_offset(&self, offset: u64) -> i64 {
        (self.options.min as i128 + offset as i128) as i64
    }

    /// Store a signed value for `column`.
    pub fn set_value(&self, column: u64, value: i64) -> Result<bool, CoreError> {
        self.require_int()?;
        let offset = self.to_offset(value)?;
        let (view, _) = self.create_view_if_not_exists(&self.bsi_view_name())?;
        view.set_value(column, self.options.bit_depth(), offset)
    }

    /// Read the value stored for `column`; `None` when the column has none.
    pub fn value(&self, column: u64) -> Result<Option<i64>, CoreError> {
        self.require_int()?;
        let view = match self.view(&self.bsi_view_name()) {
            Some(view) => view,
            None => return Ok(None),
        };
        let (offset, exists) = view.value(column, self.options.bit_depth())?;
        Ok(exists.then(|| self.from_offset(offset)))
    }

    /// Sum of values over present columns in `filter` (all when `None`).
    pub fn sum(&self, filter: Option<&Row>) -> Result<(i64, u64), CoreError> {
        self.require_int()?;
        let view = match self.view(&self.bsi_view_name()) {
            Some(view) => view,
            None => return Ok((0, 0)),
        };
        let (offset_sum, count) = view.sum(filter, self.options.bit_depth());
        let sum =
            (self.options.min as i128 * count as i128 + offset_sum as i128) as i64;
        Ok((sum, count))
    }

    pub fn min(&self, filter: Option<&Row>) -> Result<Option<(i64, u64)>, CoreError> {
        self.require_int()?;
        let view = match self.view(&self.bsi_view_name()) {
            Some(view) => view,
            None => return Ok(None),
        };
        let (offset, count) = view.min(filter, self.options.bit_depth());
        Ok((count > 0).then(|| (self.from_offset(offset), count)))
    }

    pub fn max(&self, filter: Option<&Row>) -> Result<Option<(i64, u64)>, CoreError> {
        self.require_int()?;
        let view = match self.view(&self.bsi_view_name()) {
            Some(view) => view,
            None => return Ok(None),
        };
        let (offset, count) = view.max(filter, self.options.bit_depth());
        Ok((count > 0).then(|| (self.from_offset(offset), count)))
    }

    /// Columns whose stored value satisfies `op value`. Predicates outside
    /// the field range collapse to the trivially-empty or trivially-full
    /// answer without touching the fragments.
    pub fn range_op(&self, op: RangeOp, value: i64) -> Result<Row, CoreError> {
        self.require_int()?;
        let view = match self.view(&self.bsi_view_name()) {
            Some(view) => view,
            None => return Ok(Row::new()),
        };
        let (min, max) = (self.options.min, self.options.max);
        if value < min {
            return Ok(match op {
                RangeOp::Gt | RangeOp::Gte | RangeOp::Neq => view.not_null(),
                RangeOp::Lt | RangeOp::Lte | RangeOp::Eq => Row::new(),
            });
        }
        if value > max {
            return Ok(match op {
                RangeOp::Lt | RangeOp::Lte | RangeOp::Neq => view.not_null(),
                RangeOp::Gt | RangeOp::Gte | RangeOp::Eq => Row::new(),
            });
        }
        let offset = (value as i128 - min as i128) as u64;
        Ok(view.range_op(op, self.options.bit_depth(), offset))
    }

    /// Columns whose stored value lies in `[lo, hi]`.
    pub fn range_between(&self, lo: i64, hi: i64) -> Result<Row, CoreError> {
        self.require_int()?;
        let view = match self.view(&self.bsi_view_name()) {
            Some(view) => view,
            None => return Ok(Row::new()),
        };
        if lo > hi || hi < self.options.min || lo > self.options.max {
            return Ok(Row::new());
        }
        let lo = lo.max(self.options.min);
        let hi = hi.min(self.options.max);
        let depth = self.options.bit_depth();
        let base = self.options.min as i128;
        Ok(view.range_between(depth, (lo as i128 - base) as u64, (hi as i128 - base) as u64))
    }

    // ── Lifecycle ──────────────────────────────────────

    pub fn recalculate_caches(&self) {
        for view in self.views() {
            view.recalculate_caches();
        }
    }

    pub fn close(&self) -> Result<(), CoreError> {
        for view in self.views() {
            view.close()?;
        }
        Ok(())
    }

    /// Close everything and remove the field directory. Called by the index
    /// after the deletion has been announced.
    pub fn destroy(&self) -> Result<(), CoreError> {
        if let Err(e) = self.close() {
            warn!(index = %self.index, field = %self.name, error = %e, "error closing field during delete");
        }
        fs::remove_dir_all(&self.path).map_err(|e| CoreError::storage(&self.path, e))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
