//! Index — a namespace of fields sharing one column-ID space.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attr::{AttrStore, MemAttrStore};
use crate::broadcast::{Broadcaster, Message};
use crate::error::CoreError;
use crate::field::{self, Field, FieldOptions};
use crate::validate_name;

/// Persisted per-index configuration (the index `.meta` record).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Whether external string keys are translated for this index.
    pub keys: bool,
}

pub struct Index {
    name: String,
    path: PathBuf,
    node_id: String,
    options: IndexOptions,
    broadcaster: Arc<dyn Broadcaster>,
    column_attrs: Arc<dyn AttrStore>,
    /// Highest shard each peer has reported for this index.
    remote_max_shards: DashMap<String, u64>,
    fields: RwLock<HashMap<String, Arc<Field>>>,
}

impl Index {
    /// Open the index at `path`, loading its `.meta` record (or persisting
    /// `options` as the new one) and every field directory inside.
    pub fn open(
        path: impl Into<PathBuf>,
        name: &str,
        node_id: &str,
        options: Option<IndexOptions>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, CoreError> {
        validate_name(name)?;
        let path = path.into();
        fs::create_dir_all(path.join("attrs")).map_err(|e| CoreError::storage(&path, e))?;

        let meta_path = path.join(".meta");
        let options = if meta_path.exists() {
            field::load_meta(&meta_path)?
        } else {
            let options = options.unwrap_or_default();
            field::save_meta(&meta_path, &options)?;
            options
        };

        let index = Index {
            name: name.to_string(),
            path,
            node_id: node_id.to_string(),
            options,
            broadcaster,
            column_attrs: Arc::new(MemAttrStore::new()),
            remote_max_shards: DashMap::new(),
            fields: RwLock::new(HashMap::new()),
        };
        index.open_fields()?;
        Ok(index)
    }

    fn open_fields(&self) -> Result<(), CoreError> {
        let entries = fs::read_dir(&self.path).map_err(|e| CoreError::storage(&self.path, e))?;
        let mut fields = self.write_fields();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let field_name = entry.file_name().to_string_lossy().into_owned();
            if field_name == "attrs" {
                continue;
            }
            let field = self.open_field(&field_name, None)?;
            fields.insert(field_name, Arc::new(field));
        }
        debug!(index = %self.name, fields = fields.len(), "index opened");
        Ok(())
    }

    fn open_field(&self, name: &str, options: Option<FieldOptions>) -> Result<Field, CoreError> {
        Field::open(
            self.path.join(name),
            &self.name,
            name,
            &self.node_id,
            options,
            self.broadcaster.clone(),
            Arc::new(MemAttrStore::new()),
        )
    }

    fn read_fields(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Field>>> {
        self.fields.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_fields(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Field>>> {
        self.fields.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> IndexOptions {
        self.options
    }

    pub fn column_attrs(&self) -> &Arc<dyn AttrStore> {
        &self.column_attrs
    }

    // ── Fields ─────────────────────────────────────────

    pub fn field(&self, name: &str) -> Option<Arc<Field>> {
        self.read_fields().get(name).cloned()
    }

    pub fn fields(&self) -> Vec<Arc<Field>> {
        let mut fields: Vec<Arc<Field>> = self.read_fields().values().cloned().collect();
        fields.sort_by(|a, b| a.name().cmp(b.name()));
        fields
    }

    /// Create a field: validate, announce to every peer, then build the
    /// directory layout and persist the options.
    pub fn create_field(
        &self,
        name: &str,
        options: FieldOptions,
    ) -> Result<Arc<Field>, CoreError> {
        validate_name(name)?;
        options.validate()?;
        if self.field(name).is_some() {
            return Err(CoreError::FieldExists(name.to_string()));
        }
        self.broadcaster
            .send_sync(&Message::CreateField {
                index: self.name.clone(),
                field: name.to_string(),
                options: options.clone(),
            })
            .map_err(|e| CoreError::Broadcast(e.to_string()))?;
        let field = self.create_field_base(name, options)?;
        info!(index = %self.name, field = name, "field created");
        Ok(field)
    }

    /// Create a field locally without broadcasting (remote apply path).
    /// Idempotent: an existing field is returned as-is.
    pub fn create_field_base(
        &self,
        name: &str,
        options: FieldOptions,
    ) -> Result<Arc<Field>, CoreError> {
        validate_name(name)?;
        let mut fields = self.write_fields();
        if let Some(field) = fields.get(name) {
            return Ok(field.clone());
        }
        let field = Arc::new(self.open_field(name, Some(options))?);
        fields.insert(name.to_string(), field.clone());
        Ok(field)
    }

    /// Delete a field and everything under it, announcing the deletion
    /// before applying it locally.
    pub fn delete_field(&self, name: &str) -> Result<(), CoreError> {
        if self.field(name).is_none() {
            return Err(CoreError::FieldNotFound(name.to_string()));
        }
        self.broadcaster
            .send_sync(&Message::DeleteField {
                index: self.name.clone(),
                field: name.to_string(),
            })
            .map_err(|e| CoreError::Broadcast(e.to_string()))?;
        self.delete_field_base(name)
    }

    pub fn delete_field_base(&self, name: &str) -> Result<(), CoreError> {
        let field = {
            let mut fields = self.write_fields();
            match fields.remove(name) {
                Some(field) => field,
                None => return Err(CoreError::FieldNotFound(name.to_string())),
            }
        };
        field.destroy()?;
        info!(index = %self.name, field = name, "field deleted");
        Ok(())
    }

    // ── Shard bookkeeping ──────────────────────────────

    /// Record the highest shard `node` has reported for this index.
    pub fn set_remote_max_shard(&self, node: &str, shard: u64) {
        self.remote_max_shards
            .entry(node.to_string())
            .and_modify(|s| *s = (*s).max(shard))
            .or_insert(shard);
    }

    /// Highest shard seen locally across all fields and views.
    pub fn local_max_shard(&self) -> u64 {
        self.fields()
            .iter()
            .flat_map(|f| f.views())
            .map(|v| v.max_shard())
            .max()
            .unwrap_or(0)
    }

    /// Highest shard known for this index: the max of local observation
    /// and every peer's report.
    pub fn max_shard(&self) -> u64 {
        let remote = self
            .remote_max_shards
            .iter()
            .map(|e| *e.value())
            .max()
            .unwrap_or(0);
        self.local_max_shard().max(remote)
    }

    // ── Lifecycle ──────────────────────────────────────

    pub fn recalculate_caches(&self) {
        for field in self.fields() {
            field.recalculate_caches();
        }
    }

    pub fn close(&self) -> Result<(), CoreError> {
        for field in self.fields() {
            field.close()?;
        }
        Ok(())
    }

    /// Close everything and remove the index directory.
    pub fn destroy(&self) -> Result<(), CoreError> {
        self.close()?;
        fs::remove_dir_all(&self.path).map_err(|e| CoreError::storage(&self.path, e))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NopBroadcaster;
    use crate::field::FieldType;
    use tempfile::TempDir;

    fn open_index(dir: &TempDir) -> Index {
        Index::open(
            dir.path().join("events"),
            "events",
            "node-a",
            None,
            Arc::new(NopBroadcaster),
        )
        .unwrap()
    }

    #[test]
    fn create_and_reload_fields() {
        let dir = TempDir::new().unwrap();
        {
            let idx = open_index(&dir);
            idx.create_field("kind", FieldOptions::default()).unwrap();
            idx.create_field("amount", FieldOptions::int(0, 1000)).unwrap();
            idx.close().unwrap();
        }
        let idx = open_index(&dir);
        let names: Vec<String> = idx.fields().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["amount", "kind"]);
        assert_eq!(
            idx.field("amount").unwrap().field_type(),
            FieldType::Int
        );
    }

    #[test]
    fn duplicate_field_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let idx = open_index(&dir);
        idx.create_field("kind", FieldOptions::default()).unwrap();
        assert!(matches!(
            idx.create_field("kind", FieldOptions::default()),
            Err(CoreError::FieldExists(_))
        ));
        // ... but the base path is idempotent for remote apply.
        assert!(idx
            .create_field_base("kind", FieldOptions::default())
            .is_ok());
    }

    #[test]
    fn invalid_field_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let idx = open_index(&dir);
        assert!(idx.create_field("Bad Name", FieldOptions::default()).is_err());
    }

    #[test]
    fn delete_field_removes_directory() {
        let dir = TempDir::new().unwrap();
        let idx = open_index(&dir);
        let field = idx.create_field("kind", FieldOptions::default()).unwrap();
        field.set_bit(1, 1, None).unwrap();
        let path = field.path().to_path_buf();

        idx.delete_field("kind").unwrap();
        assert!(!path.exists());
        assert!(idx.field("kind").is_none());
        assert!(matches!(
            idx.delete_field("kind"),
            Err(CoreError::FieldNotFound(_))
        ));
    }

    #[test]
    fn max_shard_combines_local_and_remote() {
        let dir = TempDir::new().unwrap();
        let idx = open_index(&dir);
        let field = idx.create_field("kind", FieldOptions::default()).unwrap();
        field.set_bit(0, 2 * crate::SHARD_WIDTH, None).unwrap();
        assert_eq!(idx.max_shard(), 2);

        idx.set_remote_max_shard("node-b", 5);
        idx.set_remote_max_shard("node-c", 4);
        assert_eq!(idx.max_shard(), 5);

        // Observations never regress.
        idx.set_remote_max_shard("node-b", 1);
        assert_eq!(idx.max_shard(), 5);
    }
}
