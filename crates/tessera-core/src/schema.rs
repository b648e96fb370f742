//! Canonical schema description exchanged between nodes.
//!
//! The holder can encode its full schema (every index, its fields with
//! options, every view) and apply a remote schema by creating whatever is
//! missing — never deleting. Encoding is canonical: entries are sorted by
//! name, so byte equality of two encodings implies schema equality.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field::FieldOptions;
use crate::index::IndexOptions;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub indexes: Vec<IndexSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub options: IndexOptions,
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub options: FieldOptions,
    pub views: Vec<String>,
}

impl Schema {
    /// Sort indexes, fields and views by name, establishing the canonical
    /// form that makes encodings comparable.
    pub fn normalize(&mut self) {
        self.indexes.sort_by(|a, b| a.name.cmp(&b.name));
        for index in &mut self.indexes {
            index.fields.sort_by(|a, b| a.name.cmp(&b.name));
            for field in &mut index.fields {
                field.views.sort();
            }
        }
    }

    /// Canonical binary encoding of the (normalized) schema.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let mut normalized = self.clone();
        normalized.normalize();
        Ok(bincode::serialize(&normalized)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema {
            indexes: vec![IndexSchema {
                name: "events".into(),
                options: IndexOptions::default(),
                fields: vec![FieldSchema {
                    name: "kind".into(),
                    options: FieldOptions::default(),
                    views: vec!["standard".into()],
                }],
            }],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let schema = sample();
        let bytes = schema.encode().unwrap();
        assert_eq!(Schema::decode(&bytes).unwrap(), schema);
    }

    #[test]
    fn encoding_is_order_independent() {
        let mut a = sample();
        a.indexes.push(IndexSchema {
            name: "aaa".into(),
            options: IndexOptions::default(),
            fields: Vec::new(),
        });
        let mut b = a.clone();
        b.indexes.reverse();
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }
}
