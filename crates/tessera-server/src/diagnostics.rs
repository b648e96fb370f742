//! Periodic diagnostics snapshots and process runtime gauges.
//!
//! Two background concerns share the `sysinfo` probe: the diagnostics
//! task logs a structured snapshot of the node (cluster shape, schema
//! size, memory) on its interval, and the runtime-metrics task feeds
//! process gauges into the stats sink.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use sysinfo::System;
use tracing::info;

use tessera_cluster::Cluster;
use tessera_core::{Holder, StatsClient};

pub struct Diagnostics {
    holder: Arc<Holder>,
    cluster: Arc<Cluster>,
    start: Instant,
    sys: Mutex<System>,
}

impl Diagnostics {
    pub fn new(holder: Arc<Holder>, cluster: Arc<Cluster>) -> Self {
        Self {
            holder,
            cluster,
            start: Instant::now(),
            sys: Mutex::new(System::new()),
        }
    }

    fn process_memory(&self) -> u64 {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        match sysinfo::get_current_pid() {
            Ok(pid) => {
                sys.refresh_process(pid);
                sys.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            Err(_) => 0,
        }
    }

    /// Log one diagnostics report.
    pub fn flush(&self) {
        let schema = self.holder.schema();
        let field_count: usize = schema.indexes.iter().map(|i| i.fields.len()).sum();
        let nodes = self.cluster.nodes();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            node_id = self.holder.node_id().unwrap_or(""),
            uptime_secs = self.start.elapsed().as_secs(),
            cluster_state = %self.cluster.state(),
            cluster_nodes = nodes.len(),
            indexes = schema.indexes.len(),
            fields = field_count,
            memory_bytes = self.process_memory(),
            "diagnostics"
        );
    }

    /// Push process gauges into the stats sink.
    pub fn record_runtime(&self, stats: &Arc<dyn StatsClient>) {
        stats.gauge("process_memory_bytes", self.process_memory() as f64);
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();
        stats.gauge("system_used_memory_bytes", sys.used_memory() as f64);
        stats.gauge("system_total_memory_bytes", sys.total_memory() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_cluster::{ClusterOptions, MemoryRemoteClient};
    use tessera_core::{Node, NopBroadcaster, NopStats, Uri};
    use tempfile::TempDir;

    #[test]
    fn flush_and_runtime_probe_do_not_panic() {
        let dir = TempDir::new().unwrap();
        let holder = Arc::new(Holder::new(
            dir.path(),
            Arc::new(NopBroadcaster),
            Arc::new(NopStats),
        ));
        holder.open().unwrap();
        let cluster = Arc::new(Cluster::new(
            Node::new("aa", Uri::new("http", "localhost", 10101)),
            holder.clone(),
            Arc::new(NopBroadcaster),
            Arc::new(MemoryRemoteClient::new()),
            ClusterOptions::default(),
        ));

        let d = Diagnostics::new(holder, cluster);
        d.flush();
        let stats: Arc<dyn StatsClient> = Arc::new(NopStats);
        d.record_runtime(&stats);
    }
}
