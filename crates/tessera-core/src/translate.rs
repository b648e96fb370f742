//! Translation between external string keys and internal 64-bit IDs.
//!
//! Column and row keys arrive as strings; the bitmap hierarchy only speaks
//! dense u64 IDs. The store is bidirectional and durable: assignments are
//! appended to a framed log (`.keys` under the data root) and replayed into
//! memory on open.
//!
//! In a cluster exactly one node — the translation primary — assigns new
//! IDs; replicas apply entries replicated from the primary and refuse to
//! invent their own. How entries travel is the transport's business; the
//! seam here is [`TranslateFile::apply_entry`].

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreError;

pub trait TranslateStore: Send + Sync {
    /// Resolve a column key to its ID, assigning the next dense ID when the
    /// key is new (primary only).
    fn translate_column_to_id(&self, index: &str, key: &str) -> Result<u64, CoreError>;

    fn translate_column_to_key(&self, index: &str, id: u64) -> Result<Option<String>, CoreError>;

    fn translate_row_to_id(&self, index: &str, field: &str, key: &str)
        -> Result<u64, CoreError>;

    fn translate_row_to_key(
        &self,
        index: &str,
        field: &str,
        id: u64,
    ) -> Result<Option<String>, CoreError>;
}

// ─────────────────────────────────────────────
// Log format
// ─────────────────────────────────────────────
//
// Record: [magic: u32][len: u32][crc32: u32][payload: bincode TranslateEntry]

const KEYS_MAGIC: u32 = 0x5445534B; // "TESK"
const MAX_ENTRY_BYTES: u32 = 1024 * 1024;

/// One durable key assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TranslateEntry {
    Column { index: String, key: String, id: u64 },
    Row { index: String, field: String, key: String, id: u64 },
}

// ─────────────────────────────────────────────
// TranslateFile
// ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct KeyMap {
    by_key: HashMap<String, u64>,
    by_id: HashMap<u64, String>,
    next: u64,
}

impl KeyMap {
    fn insert(&mut self, key: String, id: u64) {
        self.by_key.insert(key.clone(), id);
        self.by_id.insert(id, key);
        self.next = self.next.max(id + 1);
    }
}

struct TranslateData {
    writer: BufWriter<File>,
    columns: HashMap<String, KeyMap>,
    rows: HashMap<(String, String), KeyMap>,
}

/// Append-only, file-backed translate store.
pub struct TranslateFile {
    path: PathBuf,
    /// Replica mode: lookups only, new keys are refused.
    read_only: bool,
    inner: Mutex<TranslateData>,
}

impl TranslateFile {
    /// Open (or create) the log at `path` and replay it. `read_only` marks
    /// this node as a translation replica.
    pub fn open(path: impl Into<PathBuf>, read_only: bool) -> Result<Self, CoreError> {
        let path = path.into();
        let mut columns: HashMap<String, KeyMap> = HashMap::new();
        let mut rows: HashMap<(String, String), KeyMap> = HashMap::new();

        if path.exists() {
            let (entries, good_offset) = replay(&path)?;
            for entry in entries {
                match entry {
                    TranslateEntry::Column { index, key, id } => {
                        columns.entry(index).or_default().insert(key, id);
                    }
                    TranslateEntry::Row { index, field, key, id } => {
                        rows.entry((index, field)).or_default().insert(key, id);
                    }
                }
            }
            // Drop any corrupted tail so future appends stay readable.
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| CoreError::storage(&path, e))?;
            file.set_len(good_offset)
                .map_err(|e| CoreError::storage(&path, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CoreError::storage(&path, e))?;

        debug!(path = %path.display(), read_only, "translate store opened");
        Ok(Self {
            path,
            read_only,
            inner: Mutex::new(TranslateData {
                writer: BufWriter::new(file),
                columns,
                rows,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TranslateData> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an entry replicated from the translation primary.
    pub fn apply_entry(&self, entry: TranslateEntry) -> Result<(), CoreError> {
        let mut data = self.lock();
        append_entry(&self.path, &mut data.writer, &entry)?;
        match entry {
            TranslateEntry::Column { index, key, id } => {
                data.columns.entry(index).or_default().insert(key, id);
            }
            TranslateEntry::Row { index, field, key, id } => {
                data.rows.entry((index, field)).or_default().insert(key, id);
            }
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), CoreError> {
        let mut data = self.lock();
        data.writer
            .flush()
            .and_then(|_| data.writer.get_ref().sync_data())
            .map_err(|e| CoreError::storage(&self.path, e))
    }
}

impl TranslateStore for TranslateFile {
    fn translate_column_to_id(&self, index: &str, key: &str) -> Result<u64, CoreError> {
        let mut data = self.lock();
        if let Some(id) = data.columns.get(index).and_then(|m| m.by_key.get(key)) {
            return Ok(*id);
        }
        if self.read_only {
            return Err(CoreError::TranslationNotPrimary(key.to_string()));
        }
        let id = data.columns.entry(index.to_string()).or_default().next;
        let entry = TranslateEntry::Column {
            index: index.to_string(),
            key: key.to_string(),
            id,
        };
        append_entry(&self.path, &mut data.writer, &entry)?;
        data.columns
            .entry(index.to_string())
            .or_default()
            .insert(key.to_string(), id);
        Ok(id)
    }

    fn translate_column_to_key(&self, index: &str, id: u64) -> Result<Option<String>, CoreError> {
        let data = self.lock();
        Ok(data
            .columns
            .get(index)
            .and_then(|m| m.by_id.get(&id))
            .cloned())
    }

    fn translate_row_to_id(
        &self,
        index: &str,
        field: &str,
        key: &str,
    ) -> Result<u64, CoreError> {
        let scope = (index.to_string(), field.to_string());
        let mut data = self.lock();
        if let Some(id) = data.rows.get(&scope).and_then(|m| m.by_key.get(key)) {
            return Ok(*id);
        }
        if self.read_only {
            return Err(CoreError::TranslationNotPrimary(key.to_string()));
        }
        let id = data.rows.entry(scope.clone()).or_default().next;
        let entry = TranslateEntry::Row {
            index: index.to_string(),
            field: field.to_string(),
            key: key.to_string(),
            id,
        };
        append_entry(&self.path, &mut data.writer, &entry)?;
        data.rows.entry(scope).or_default().insert(key.to_string(), id);
        Ok(id)
    }

    fn translate_row_to_key(
        &self,
        index: &str,
        field: &str,
        id: u64,
    ) -> Result<Option<String>, CoreError> {
        let data = self.lock();
        Ok(data
            .rows
            .get(&(index.to_string(), field.to_string()))
            .and_then(|m| m.by_id.get(&id))
            .cloned())
    }
}

// ─────────────────────────────────────────────
// Log I/O
// ─────────────────────────────────────────────

fn append_entry(
    path: &Path,
    writer: &mut BufWriter<File>,
    entry: &TranslateEntry,
) -> Result<(), CoreError> {
    let payload = bincode::serialize(entry)?;
    writer
        .write_all(&KEYS_MAGIC.to_le_bytes())
        .and_then(|_| writer.write_all(&(payload.len() as u32).to_le_bytes()))
        .and_then(|_| writer.write_all(&crc32fast::hash(&payload).to_le_bytes()))
        .and_then(|_| writer.write_all(&payload))
        .and_then(|_| writer.flush())
        .and_then(|_| writer.get_ref().sync_data())
        .map_err(|e| CoreError::storage(path, e))
}

/// Read all intact records. Returns the entries plus the byte offset of the
/// last good record boundary; everything after it is a corrupted tail.
fn replay(path: &Path) -> Result<(Vec<TranslateEntry>, u64), CoreError> {
    let file = File::open(path).map_err(|e| CoreError::storage(path, e))?;
    let mut r = BufReader::new(file);
    let mut entries = Vec::new();
    let mut good_offset = 0u64;
    loop {
        let mut magic_buf = [0u8; 4];
        match r.read_exact(&mut magic_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CoreError::storage(path, e)),
        }
        if u32::from_le_bytes(magic_buf) != KEYS_MAGIC {
            break; // corrupted tail
        }
        let mut len_buf = [0u8; 4];
        if r.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_ENTRY_BYTES {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if r.read_exact(&mut crc_buf).is_err() {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        if r.read_exact(&mut payload).is_err() {
            break;
        }
        if crc32fast::hash(&payload) != u32::from_le_bytes(crc_buf) {
            break;
        }
        match bincode::deserialize(&payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        good_offset += 12 + len as u64;
    }
    Ok((entries, good_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn assigns_dense_ids_per_scope() {
        let dir = TempDir::new().unwrap();
        let t = TranslateFile::open(dir.path().join(".keys"), false).unwrap();

        assert_eq!(t.translate_column_to_id("i", "alice").unwrap(), 0);
        assert_eq!(t.translate_column_to_id("i", "bob").unwrap(), 1);
        assert_eq!(t.translate_column_to_id("i", "alice").unwrap(), 0);
        assert_eq!(t.translate_column_to_id("j", "carol").unwrap(), 0);

        assert_eq!(t.translate_row_to_id("i", "f", "red").unwrap(), 0);
        assert_eq!(t.translate_row_to_id("i", "g", "red").unwrap(), 0);
        assert_eq!(t.translate_row_to_id("i", "f", "blue").unwrap(), 1);
    }

    #[test]
    fn reverse_lookup() {
        let dir = TempDir::new().unwrap();
        let t = TranslateFile::open(dir.path().join(".keys"), false).unwrap();
        let id = t.translate_column_to_id("i", "alice").unwrap();
        assert_eq!(t.translate_column_to_key("i", id).unwrap(), Some("alice".into()));
        assert_eq!(t.translate_column_to_key("i", 99).unwrap(), None);
    }

    #[test]
    fn replays_assignments_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".keys");
        {
            let t = TranslateFile::open(&path, false).unwrap();
            t.translate_column_to_id("i", "alice").unwrap();
            t.translate_row_to_id("i", "f", "red").unwrap();
            t.close().unwrap();
        }
        let t = TranslateFile::open(&path, false).unwrap();
        assert_eq!(t.translate_column_to_id("i", "alice").unwrap(), 0);
        assert_eq!(t.translate_column_to_id("i", "bob").unwrap(), 1);
        assert_eq!(t.translate_row_to_key("i", "f", 0).unwrap(), Some("red".into()));
    }

    #[test]
    fn replica_refuses_new_keys_but_serves_applied_ones() {
        let dir = TempDir::new().unwrap();
        let t = TranslateFile::open(dir.path().join(".keys"), true).unwrap();

        assert!(matches!(
            t.translate_column_to_id("i", "alice"),
            Err(CoreError::TranslationNotPrimary(_))
        ));

        t.apply_entry(TranslateEntry::Column {
            index: "i".into(),
            key: "alice".into(),
            id: 7,
        })
        .unwrap();
        assert_eq!(t.translate_column_to_id("i", "alice").unwrap(), 7);
        assert_eq!(t.translate_column_to_key("i", 7).unwrap(), Some("alice".into()));
    }

    #[test]
    fn corrupted_tail_is_dropped_on_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".keys");
        {
            let t = TranslateFile::open(&path, false).unwrap();
            t.translate_column_to_id("i", "alice").unwrap();
            t.close().unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"\xDE\xAD\xBE\xEF").unwrap();
        drop(f);

        {
            let t = TranslateFile::open(&path, false).unwrap();
            assert_eq!(t.translate_column_to_id("i", "alice").unwrap(), 0);
            // Appends after the truncated tail must stay durable.
            assert_eq!(t.translate_column_to_id("i", "bob").unwrap(), 1);
            t.close().unwrap();
        }
        let t = TranslateFile::open(&path, false).unwrap();
        assert_eq!(t.translate_column_to_id("i", "bob").unwrap(), 1);
    }
}
