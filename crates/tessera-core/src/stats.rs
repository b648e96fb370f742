//! Statistics sink consumed by the hierarchy and the cluster.
//!
//! The server provides a real implementation; everything else defaults to
//! [`NopStats`] so components never need to check for a missing sink.

use std::sync::Arc;
use std::time::Duration;

pub trait StatsClient: Send + Sync {
    fn count(&self, name: &str, value: i64);
    fn gauge(&self, name: &str, value: f64);
    fn timing(&self, name: &str, value: Duration);

    /// A client reporting under additional `key:value` tags.
    fn with_tags(&self, tags: &[&str]) -> Arc<dyn StatsClient>;
}

/// Stats sink that swallows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopStats;

impl StatsClient for NopStats {
    fn count(&self, _name: &str, _value: i64) {}

    fn gauge(&self, _name: &str, _value: f64) {}

    fn timing(&self, _name: &str, _value: Duration) {}

    fn with_tags(&self, _tags: &[&str]) -> Arc<dyn StatsClient> {
        Arc::new(NopStats)
    }
}
