//! # tessera-core
//!
//! The bitmap data hierarchy of a Tessera node:
//!
//! - [`row::Row`]           — a set of 64-bit column IDs (query currency)
//! - [`fragment::Fragment`] — one shard of one view, the storage unit
//! - [`view::View`]         — fragments grouped under one layout
//! - [`field::Field`]       — views grouped under one typed column
//! - [`index::Index`]       — fields sharing a column-ID space
//! - [`holder::Holder`]     — the process-wide root owning all indexes
//!
//! plus the contracts the hierarchy consumes:
//!
//! - [`broadcast::Broadcaster`] — control-message fan-out (gossip lives elsewhere)
//! - [`translate::TranslateStore`] — string key ↔ 64-bit ID mapping
//! - [`attr::AttrStore`]    — column/row attribute storage
//! - [`stats::StatsClient`] — metrics sink
//!
//! ## Design principles
//!
//! - **Synchronous core**: all hierarchy operations are plain blocking calls;
//!   async orchestration belongs to the server crate.
//! - **Narrow seams**: the broadcaster, translator, attribute store and stats
//!   sink are trait objects injected at construction, never owned upward.
//! - **Deterministic files**: equal logical state serializes to equal bytes,
//!   so fragment digests and schema encodings are comparable across nodes.

pub mod attr;
pub mod broadcast;
pub mod cache;
pub mod error;
pub mod field;
pub mod fragment;
pub mod holder;
pub mod index;
pub mod node;
pub mod row;
pub mod schema;
pub mod stats;
pub mod time;
pub mod translate;
pub mod view;

pub use attr::{AttrStore, MemAttrStore};
pub use broadcast::{Broadcaster, Message, NopBroadcaster};
pub use cache::CachePolicy;
pub use error::CoreError;
pub use field::{Field, FieldOptions, FieldType, RangeOp};
pub use fragment::Fragment;
pub use holder::Holder;
pub use index::{Index, IndexOptions};
pub use node::{ClusterState, Node, NodeEvent, NodeEventType, NodeState, Uri};
pub use row::Row;
pub use schema::{FieldSchema, IndexSchema, Schema};
pub use stats::{NopStats, StatsClient};
pub use time::TimeQuantum;
pub use translate::{TranslateFile, TranslateStore};
pub use view::View;

/// Number of column IDs covered by one shard. Placement, routing and the
/// fragment file layout all assume this is a power of two.
pub const SHARD_WIDTH: u64 = 1 << 20;

/// Standard view name used by `set`, `time`, `mutex` and `bool` fields.
pub const VIEW_STANDARD: &str = "standard";

/// Name prefix marking a bit-sliced (numeric) view. Views with this prefix
/// never keep a row cache.
pub const VIEW_BSI_PREFIX: &str = "bsig_";

/// Validate an index or field name: 1–64 characters of lowercase ASCII
/// letters, digits, underscore or hyphen.
pub fn validate_name(name: &str) -> Result<(), CoreError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_width_is_power_of_two() {
        assert!(SHARD_WIDTH.is_power_of_two());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("events").is_ok());
        assert!(validate_name("user_2024-q1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Upper").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
        assert!(validate_name(&"x".repeat(64)).is_ok());
    }
}
