//! Attribute stores for columns (per index) and rows (per field).
//!
//! Durability of attribute metadata is delegated to the backing store, so
//! the core only defines the seam plus an in-memory implementation good
//! enough for tests and for deployments that treat attributes as ephemeral.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::CoreError;

pub trait AttrStore: Send + Sync {
    /// Merge `attrs` into the attributes of `id`. Existing keys not named
    /// in `attrs` are preserved; a `null` value deletes the key.
    fn set_attrs(&self, id: u64, attrs: HashMap<String, Value>) -> Result<(), CoreError>;

    /// Attributes of `id`; empty when none were ever set.
    fn attrs(&self, id: u64) -> Result<HashMap<String, Value>, CoreError>;
}

/// In-memory attribute store.
#[derive(Debug, Default)]
pub struct MemAttrStore {
    attrs: DashMap<u64, HashMap<String, Value>>,
}

impl MemAttrStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttrStore for MemAttrStore {
    fn set_attrs(&self, id: u64, attrs: HashMap<String, Value>) -> Result<(), CoreError> {
        let mut entry = self.attrs.entry(id).or_default();
        for (key, value) in attrs {
            if value.is_null() {
                entry.remove(&key);
            } else {
                entry.insert(key, value);
            }
        }
        Ok(())
    }

    fn attrs(&self, id: u64) -> Result<HashMap<String, Value>, CoreError> {
        Ok(self.attrs.get(&id).map(|a| a.clone()).unwrap_or_default())
    }
}
