//! Atomic operation counters exported in Prometheus text format.
//!
//! Implements the core [`StatsClient`] seam with lock-free maps of named
//! counters, gauges and timing sums; `to_prometheus` renders everything
//! for a scrape endpoint to serve.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use tessera_core::StatsClient;

#[derive(Default)]
struct Timing {
    count: AtomicU64,
    total_us: AtomicU64,
}

pub struct ServerMetrics {
    counters: DashMap<String, AtomicI64>,
    gauges: DashMap<String, AtomicU64>, // f64 bits
    timings: DashMap<String, Timing>,
    start: Instant,
}

impl ServerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            timings: DashMap::new(),
            start: Instant::now(),
        })
    }

    /// A [`StatsClient`] view over this registry.
    pub fn client(self: &Arc<Self>) -> Arc<dyn StatsClient> {
        Arc::new(Tagged {
            metrics: self.clone(),
            tags: String::new(),
        })
    }

    fn add(&self, name: &str, value: i64) {
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(value, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.gauges
            .entry(name.to_string())
            .or_default()
            .store(value.to_bits(), Ordering::Relaxed);
    }

    fn record_timing(&self, name: &str, value: Duration) {
        let t = self.timings.entry(name.to_string()).or_default();
        t.count.fetch_add(1, Ordering::Relaxed);
        t.total_us
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str) -> i64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Render every metric in Prometheus text exposition format, sorted by
    /// name so scrapes are diff-friendly.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE tessera_uptime_seconds gauge\n");
        out.push_str(&format!(
            "tessera_uptime_seconds {}\n",
            self.start.elapsed().as_secs()
        ));

        let mut counters: Vec<(String, i64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in counters {
            out.push_str(&format!("# TYPE tessera_{name}_total counter\n"));
            out.push_str(&format!("tessera_{name}_total {value}\n"));
        }

        let mut gauges: Vec<(String, f64)> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), f64::from_bits(e.value().load(Ordering::Relaxed))))
            .collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in gauges {
            out.push_str(&format!("# TYPE tessera_{name} gauge\n"));
            out.push_str(&format!("tessera_{name} {value}\n"));
        }

        let mut timings: Vec<(String, u64, u64)> = self
            .timings
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().count.load(Ordering::Relaxed),
                    e.value().total_us.load(Ordering::Relaxed),
                )
            })
            .collect();
        timings.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, count, total_us) in timings {
            out.push_str(&format!("# TYPE tessera_{name}_us summary\n"));
            out.push_str(&format!("tessera_{name}_us_count {count}\n"));
            out.push_str(&format!("tessera_{name}_us_sum {total_us}\n"));
        }

        out
    }
}

/// StatsClient view carrying a tag suffix baked into metric names.
struct Tagged {
    metrics: Arc<ServerMetrics>,
    tags: String,
}

impl Tagged {
    fn name(&self, name: &str) -> String {
        if self.tags.is_empty() {
            name.to_string()
        } else {
            format!("{name}_{}", self.tags)
        }
    }
}

impl StatsClient for Tagged {
    fn count(&self, name: &str, value: i64) {
        self.metrics.add(&self.name(name), value);
    }

    fn gauge(&self, name: &str, value: f64) {
        self.metrics.set_gauge(&self.name(name), value);
    }

    fn timing(&self, name: &str, value: Duration) {
        self.metrics.record_timing(&self.name(name), value);
    }

    fn with_tags(&self, tags: &[&str]) -> Arc<dyn StatsClient> {
        let mut combined = self.tags.clone();
        for tag in tags {
            let tag: String = tag
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            if !combined.is_empty() {
                combined.push('_');
            }
            combined.push_str(&tag);
        }
        Arc::new(Tagged {
            metrics: self.metrics.clone(),
            tags: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = ServerMetrics::new();
        let c = m.client();
        c.count("set_bit", 1);
        c.count("set_bit", 2);
        assert_eq!(m.counter("set_bit"), 3);
    }

    #[test]
    fn tags_namespace_the_metric() {
        let m = ServerMetrics::new();
        let c = m.client().with_tags(&["index:events"]);
        c.count("set_bit", 1);
        assert_eq!(m.counter("set_bit_index_events"), 1);
        assert_eq!(m.counter("set_bit"), 0);
    }

    #[test]
    fn prometheus_rendering_contains_all_kinds() {
        let m = ServerMetrics::new();
        let c = m.client();
        c.count("queries", 5);
        c.gauge("heap_bytes", 1234.0);
        c.timing("query", Duration::from_micros(250));

        let text = m.to_prometheus();
        assert!(text.contains("tessera_queries_total 5"));
        assert!(text.contains("tessera_heap_bytes 1234"));
        assert!(text.contains("tessera_query_us_count 1"));
        assert!(text.contains("tessera_query_us_sum 250"));
        assert!(text.contains("tessera_uptime_seconds"));
    }
}
