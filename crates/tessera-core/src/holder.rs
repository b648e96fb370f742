//! Holder — the process-wide root owning every index.
//!
//! Opening the holder scans the data directory, loads or generates the
//! persistent NodeID, opens all indexes (and their fields, views and
//! fragments), then trips the `opened` latch other components await before
//! touching schema state. A clean-shutdown marker lets the next start-up
//! skip cache recomputation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};

use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcast::{Broadcaster, Message};
use crate::error::CoreError;
use crate::index::{Index, IndexOptions};
use crate::schema::{FieldSchema, IndexSchema, Schema};
use crate::stats::StatsClient;

/// Clean-shutdown marker under the data root. Present ⇒ the previous
/// process closed every fragment properly.
const SHUTDOWN_MARKER: &str = ".shutdown";

// ─────────────────────────────────────────────
// Latch
// ─────────────────────────────────────────────

/// One-shot event: transitions once from closed to open, never back.
/// Waiters observe the event idempotently.
#[derive(Debug, Default)]
pub struct Latch {
    opened: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn open(&self) {
        let mut opened = self.opened.lock().unwrap_or_else(|e| e.into_inner());
        *opened = true;
        self.cv.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the latch opens. Returns immediately if already open.
    pub fn wait(&self) {
        let mut opened = self.opened.lock().unwrap_or_else(|e| e.into_inner());
        while !*opened {
            opened = self.cv.wait(opened).unwrap_or_else(|e| e.into_inner());
        }
    }
}

// ─────────────────────────────────────────────
// Holder
// ─────────────────────────────────────────────

pub struct Holder {
    path: PathBuf,
    broadcaster: Arc<dyn Broadcaster>,
    stats: Arc<dyn StatsClient>,
    node_id: OnceLock<String>,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    opened: Latch,
}

impl Holder {
    pub fn new(
        path: impl Into<PathBuf>,
        broadcaster: Arc<dyn Broadcaster>,
        stats: Arc<dyn StatsClient>,
    ) -> Self {
        Self {
            path: path.into(),
            broadcaster,
            stats,
            node_id: OnceLock::new(),
            indexes: RwLock::new(HashMap::new()),
            opened: Latch::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Event other components await before processing schema traffic.
    pub fn opened(&self) -> &Latch {
        &self.opened
    }

    fn read_indexes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Index>>> {
        self.indexes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_indexes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Index>>> {
        self.indexes.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── NodeID ─────────────────────────────────────────

    /// Load the persistent NodeID from `<root>/id`, generating and writing
    /// a fresh 32-hex-char ID on first boot. Usable before `open`.
    pub fn load_node_id(&self) -> Result<String, CoreError> {
        if let Some(id) = self.node_id.get() {
            return Ok(id.clone());
        }
        fs::create_dir_all(&self.path).map_err(|e| CoreError::storage(&self.path, e))?;
        let id_path = self.path.join("id");
        let id = if id_path.exists() {
            let raw = fs::read_to_string(&id_path).map_err(|e| CoreError::storage(&id_path, e))?;
            let id = raw.trim().to_string();
            if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(CoreError::Corrupt {
                    what: "node id",
                    path: id_path.display().to_string(),
                    detail: "expected 32 hex characters".to_string(),
                });
            }
            id
        } else {
            let id = Uuid::new_v4().simple().to_string();
            let tmp = id_path.with_extension("tmp");
            fs::write(&tmp, &id).map_err(|e| CoreError::storage(&tmp, e))?;
            fs::rename(&tmp, &id_path).map_err(|e| CoreError::storage(&id_path, e))?;
            info!(node_id = %id, "generated new node id");
            id
        };
        Ok(self.node_id.get_or_init(|| id).clone())
    }

    /// The NodeID once loaded.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.get().map(|s| s.as_str())
    }

    // ── Lifecycle ──────────────────────────────────────

    /// Scan the data directory and open every index found. Trips the
    /// `opened` latch on success.
    pub fn open(&self) -> Result<(), CoreError> {
        fs::create_dir_all(&self.path).map_err(|e| CoreError::storage(&self.path, e))?;
        let node_id = self.load_node_id()?;

        // A present marker means the previous shutdown flushed everything;
        // consume it either way so a crash leaves it absent.
        let marker = self.path.join(SHUTDOWN_MARKER);
        let clean = if marker.exists() {
            fs::remove_file(&marker).map_err(|e| CoreError::storage(&marker, e))?;
            true
        } else {
            false
        };

        let mut opened_any = false;
        let entries = fs::read_dir(&self.path).map_err(|e| CoreError::storage(&self.path, e))?;
        {
            let mut indexes = self.write_indexes();
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let index = Index::open(
                    &path,
                    &name,
                    &node_id,
                    None,
                    self.broadcaster.clone(),
                )?;
                indexes.insert(name, Arc::new(index));
                opened_any = true;
            }
        }

        if opened_any && !clean {
            info!("unclean shutdown detected, recalculating fragment caches");
            self.recalculate_caches();
        }

        self.opened.open();
        info!(
            path = %self.path.display(),
            indexes = self.read_indexes().len(),
            "holder opened"
        );
        Ok(())
    }

    /// Close every index, flush fragments, and write the clean-shutdown
    /// marker.
    pub fn close(&self) -> Result<(), CoreError> {
        for index in self.indexes() {
            index.close()?;
        }
        let marker = self.path.join(SHUTDOWN_MARKER);
        fs::write(&marker, b"clean\n").map_err(|e| CoreError::storage(&marker, e))?;
        info!("holder closed");
        Ok(())
    }

    // ── Indexes ────────────────────────────────────────

    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        self.read_indexes().get(name).cloned()
    }

    pub fn indexes(&self) -> Vec<Arc<Index>> {
        let mut indexes: Vec<Arc<Index>> = self.read_indexes().values().cloned().collect();
        indexes.sort_by(|a, b| a.name().cmp(b.name()));
        indexes
    }

    pub fn field(&self, index: &str, field: &str) -> Option<Arc<crate::field::Field>> {
        self.index(index).and_then(|i| i.field(field))
    }

    /// Create an index: validate, announce to every peer, apply locally.
    pub fn create_index(
        &self,
        name: &str,
        options: IndexOptions,
    ) -> Result<Arc<Index>, CoreError> {
        crate::validate_name(name)?;
        if self.index(name).is_some() {
            return Err(CoreError::IndexExists(name.to_string()));
        }
        self.broadcaster
            .send_sync(&Message::CreateIndex {
                index: name.to_string(),
                options,
            })
            .map_err(|e| CoreError::Broadcast(e.to_string()))?;
        let index = self.create_index_base(name, options)?;
        self.stats.count("create_index", 1);
        info!(index = name, "index created");
        Ok(index)
    }

    /// Create an index locally without broadcasting. Idempotent.
    pub fn create_index_base(
        &self,
        name: &str,
        options: IndexOptions,
    ) -> Result<Arc<Index>, CoreError> {
        crate::validate_name(name)?;
        let node_id = self.load_node_id()?;
        let mut indexes = self.write_indexes();
        if let Some(index) = indexes.get(name) {
            return Ok(index.clone());
        }
        let index = Arc::new(Index::open(
            self.path.join(name),
            name,
            &node_id,
            Some(options),
            self.broadcaster.clone(),
        )?);
        indexes.insert(name.to_string(), index.clone());
        Ok(index)
    }

    /// Delete an index and everything under it, announcing first.
    pub fn delete_index(&self, name: &str) -> Result<(), CoreError> {
        if self.index(name).is_none() {
            return Err(CoreError::IndexNotFound(name.to_string()));
        }
        self.broadcaster
            .send_sync(&Message::DeleteIndex {
                index: name.to_string(),
            })
            .map_err(|e| CoreError::Broadcast(e.to_string()))?;
        self.delete_index_base(name)
    }

    pub fn delete_index_base(&self, name: &str) -> Result<(), CoreError> {
        let index = {
            let mut indexes = self.write_indexes();
            match indexes.remove(name) {
                Some(index) => index,
                None => return Err(CoreError::IndexNotFound(name.to_string())),
            }
        };
        index.destroy()?;
        self.stats.count("delete_index", 1);
        info!(index = name, "index deleted");
        Ok(())
    }

    // ── Schema ─────────────────────────────────────────

    /// Canonical schema of everything this holder owns.
    pub fn schema(&self) -> Schema {
        let mut schema = Schema::default();
        for index in self.indexes() {
            let mut fields = Vec::new();
            for field in index.fields() {
                fields.push(FieldSchema {
                    name: field.name().to_string(),
                    options: field.options().clone(),
                    views: field.view_names(),
                });
            }
            schema.indexes.push(IndexSchema {
                name: index.name().to_string(),
                options: index.options(),
                fields,
            });
        }
        schema.normalize();
        schema
    }

    /// Apply a remote schema: create whatever is missing, delete nothing.
    pub fn apply_schema(&self, schema: &Schema) -> Result<(), CoreError> {
        for index_schema in &schema.indexes {
            let index = self.create_index_base(&index_schema.name, index_schema.options)?;
            for field_schema in &index_schema.fields {
                let field =
                    index.create_field_base(&field_schema.name, field_schema.options.clone())?;
                for view in &field_schema.views {
                    field.create_view_base(view)?;
                }
            }
        }
        Ok(())
    }

    /// Highest known shard per index, local and remote combined.
    pub fn max_shards(&self) -> HashMap<String, u64> {
        self.indexes()
            .iter()
            .map(|i| (i.name().to_string(), i.max_shard()))
            .collect()
    }

    pub fn recalculate_caches(&self) {
        for index in self.indexes() {
            index.recalculate_caches();
        }
    }

    /// Flush every fragment without closing. Used by periodic maintenance.
    pub fn flush(&self) {
        for index in self.indexes() {
            for field in index.fields() {
                for view in field.views() {
                    for frag in view.all_fragments() {
                        if let Err(e) = frag.flush() {
                            warn!(error = %e, "fragment flush failed");
                        }
                    }
                }
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
