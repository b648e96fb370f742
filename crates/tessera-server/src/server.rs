//! Server — the per-process assembly of holder, cluster and syncer.
//!
//! The server owns lifecycle and wiring only; data lives in the holder and
//! membership in the cluster. It implements [`MessageHandler`], routing
//! every received control message to the component that interprets it, and
//! injects a [`TransportBroadcaster`] (through the construction-order
//! relay) into the holder and cluster so their schema mutations reach
//! every peer.
//!
//! ## Open sequence
//!
//! 1. wait for the cluster to leave STARTING
//! 2. open the holder (directory scan, NodeID, `opened` latch)
//! 3. report node state READY to the coordinator
//! 4. start the coordinator control loop and the background tasks
//!    (anti-entropy, runtime metrics, diagnostics)

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_cluster::{Cluster, ClusterOptions, HolderSyncer, MemoryRemoteClient, RemoteClient};
use tessera_core::broadcast::NodeStatus;
use tessera_core::{
    Broadcaster, FieldOptions, Holder, IndexOptions, Message, Node, NodeState, RangeOp, Row,
    StatsClient, TranslateFile, TranslateStore, Uri, SHARD_WIDTH,
};

use crate::config::{Config, MetricService};
use crate::diagnostics::Diagnostics;
use crate::error::ServerError;
use crate::metrics::ServerMetrics;
use crate::transport::{
    BroadcastRelay, MemoryTransport, MessageHandler, Transport, TransportBroadcaster,
};

// ─────────────────────────────────────────────
// ServerBuilder
// ─────────────────────────────────────────────

/// Functional-style builder for a [`Server`]; every option has a sane
/// single-node default.
pub struct ServerBuilder {
    data_dir: PathBuf,
    bind: Uri,
    replica_n: usize,
    is_coordinator: bool,
    cluster_disabled: bool,
    cluster_hosts: Vec<Uri>,
    anti_entropy_interval: Duration,
    long_query_time: Duration,
    metric_interval: Duration,
    diagnostics_interval: Duration,
    max_writes_per_request: usize,
    translation_primary: bool,
    metric_service: MetricService,
    resize_timeout: Duration,
    transport: Arc<dyn Transport>,
    remote: Arc<dyn RemoteClient>,
}

impl ServerBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bind: Uri::new("http", "127.0.0.1", 10101),
            replica_n: 1,
            is_coordinator: true,
            cluster_disabled: false,
            cluster_hosts: Vec::new(),
            anti_entropy_interval: Duration::from_secs(600),
            long_query_time: Duration::ZERO,
            metric_interval: Duration::ZERO,
            diagnostics_interval: Duration::ZERO,
            max_writes_per_request: 5000,
            translation_primary: true,
            metric_service: MetricService::Nop,
            resize_timeout: Duration::from_secs(60),
            transport: Arc::new(MemoryTransport::new()),
            remote: Arc::new(MemoryRemoteClient::new()),
        }
    }

    /// Builder preconfigured from the environment-variable surface.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let bind = config.validate()?;
        let mut hosts = Vec::new();
        for host in &config.cluster_hosts {
            hosts.push(Uri::parse(host).map_err(|e| ServerError::Config(e.to_string()))?);
        }
        let mut b = Self::new(config.expanded_data_dir()?);
        b.bind = bind;
        b.replica_n = config.replica_n;
        // With no peers configured, someone must drive the state machine.
        b.is_coordinator = config.coordinator || hosts.is_empty();
        b.cluster_disabled = config.cluster_disabled;
        b.cluster_hosts = hosts;
        b.anti_entropy_interval = Duration::from_secs(config.anti_entropy_interval_secs);
        b.long_query_time = Duration::from_secs(config.long_query_time_secs);
        b.metric_interval = Duration::from_secs(config.metric_poll_interval_secs);
        b.diagnostics_interval = if config.metric_diagnostics {
            Duration::from_secs(3600)
        } else {
            Duration::ZERO
        };
        b.max_writes_per_request = config.max_writes_per_request;
        b.translation_primary = config.translation_primary_url.is_empty();
        b.metric_service = config.metric_service;
        Ok(b)
    }

    pub fn bind(mut self, uri: Uri) -> Self {
        self.bind = uri;
        self
    }

    pub fn replica_n(mut self, n: usize) -> Self {
        self.replica_n = n.max(1);
        self
    }

    pub fn coordinator(mut self, is_coordinator: bool) -> Self {
        self.is_coordinator = is_coordinator;
        self
    }

    pub fn static_hosts(mut self, hosts: Vec<Uri>) -> Self {
        self.cluster_disabled = true;
        self.cluster_hosts = hosts;
        self
    }

    pub fn anti_entropy_interval(mut self, interval: Duration) -> Self {
        self.anti_entropy_interval = interval;
        self
    }

    pub fn long_query_time(mut self, d: Duration) -> Self {
        self.long_query_time = d;
        self
    }

    pub fn max_writes_per_request(mut self, n: usize) -> Self {
        self.max_writes_per_request = n;
        self
    }

    pub fn resize_timeout(mut self, d: Duration) -> Self {
        self.resize_timeout = d;
        self
    }

    pub fn metric_service(mut self, service: MetricService) -> Self {
        self.metric_service = service;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn remote_client(mut self, remote: Arc<dyn RemoteClient>) -> Self {
        self.remote = remote;
        self
    }

    pub fn build(self) -> Result<Arc<Server>, ServerError> {
        let relay = Arc::new(BroadcastRelay::new());
        let metrics = match self.metric_service {
            MetricService::Prometheus => Some(ServerMetrics::new()),
            MetricService::Nop => None,
        };
        let stats: Arc<dyn StatsClient> = match &metrics {
            Some(m) => m.client(),
            None => Arc::new(tessera_core::NopStats),
        };

        let holder = Arc::new(Holder::new(
            &self.data_dir,
            relay.clone() as Arc<dyn Broadcaster>,
            stats.clone(),
        ));
        let node_id = holder.load_node_id()?;
        let mut local = Node::new(&node_id, self.bind.clone());
        local.is_coordinator = self.is_coordinator;

        let cluster = Arc::new(Cluster::new(
            local.clone(),
            holder.clone(),
            relay.clone() as Arc<dyn Broadcaster>,
            self.remote.clone(),
            ClusterOptions {
                replica_n: self.replica_n,
                is_coordinator: self.is_coordinator,
                resize_timeout: self.resize_timeout,
                long_query_time: self.long_query_time,
            },
        ));
        if self.cluster_disabled {
            cluster.set_static(&self.cluster_hosts)?;
        }
        relay.wire(Arc::new(TransportBroadcaster::new(
            self.transport.clone(),
            cluster.clone(),
            local.clone(),
        )));

        let translate = Arc::new(TranslateFile::open(
            self.data_dir.join(".keys"),
            !self.translation_primary,
        )?);

        let syncer = Arc::new(HolderSyncer::new(
            holder.clone(),
            cluster.clone(),
            self.remote.clone(),
            cluster.closing(),
            stats.with_tags(&["component:syncer"]),
        ));

        let (close_tx, _) = watch::channel(false);
        Ok(Arc::new(Server {
            local,
            holder,
            cluster,
            syncer,
            translate,
            stats,
            metrics,
            anti_entropy_interval: self.anti_entropy_interval,
            metric_interval: self.metric_interval,
            diagnostics_interval: self.diagnostics_interval,
            max_writes_per_request: self.max_writes_per_request,
            closing: Arc::new(AtomicBool::new(false)),
            close_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

// ─────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────

pub struct Server {
    local: Node,
    holder: Arc<Holder>,
    cluster: Arc<Cluster>,
    syncer: Arc<HolderSyncer>,
    translate: Arc<TranslateFile>,
    stats: Arc<dyn StatsClient>,
    metrics: Option<Arc<ServerMetrics>>,
    anti_entropy_interval: Duration,
    metric_interval: Duration,
    diagnostics_interval: Duration,
    max_writes_per_request: usize,
    closing: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn holder(&self) -> &Arc<Holder> {
        &self.holder
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn node(&self) -> &Node {
        &self.local
    }

    pub fn translate(&self) -> &Arc<TranslateFile> {
        &self.translate
    }

    pub fn metrics(&self) -> Option<&Arc<ServerMetrics>> {
        self.metrics.as_ref()
    }

    // ── Lifecycle ──────────────────────────────────────

    /// Open the node. Must run inside a tokio runtime; spawns the
    /// coordinator control loop and the background tasks.
    pub fn open(self: &Arc<Self>) -> Result<(), ServerError> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            node_id = %self.local.id,
            uri = %self.local.uri,
            "tessera node starting"
        );

        self.cluster.wait_for_started()?;
        self.holder.open()?;
        self.cluster.set_node_state(NodeState::Ready)?;

        // Coordinator control loop: drains membership events. Started only
        // after the holder has opened so joins queue instead of racing the
        // directory scan.
        {
            let cluster = self.cluster.clone();
            self.push_task(tokio::task::spawn_blocking(move || {
                cluster.listen_for_events();
            }));
        }

        self.spawn_anti_entropy();
        self.spawn_runtime_metrics();
        self.spawn_diagnostics();

        info!("tessera node open");
        Ok(())
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn spawn_anti_entropy(self: &Arc<Self>) {
        if self.anti_entropy_interval.is_zero() {
            info!("anti-entropy disabled");
            return;
        }
        let syncer = self.syncer.clone();
        let stats = self.stats.clone();
        let interval = self.anti_entropy_interval;
        let mut close_rx = self.close_tx.subscribe();
        self.push_task(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "anti-entropy monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is not a sync
            loop {
                tokio::select! {
                    _ = close_rx.changed() => return,
                    _ = ticker.tick() => {}
                }
                stats.count("anti_entropy_tick", 1);
                let started = Instant::now();
                let syncer = syncer.clone();
                match tokio::task::spawn_blocking(move || syncer.sync_holder()).await {
                    Ok(Ok(())) => {
                        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "holder sync complete");
                    }
                    Ok(Err(e)) => warn!(error = %e, "holder sync failed"),
                    Err(e) => warn!(error = %e, "holder sync panicked"),
                }
            }
        }));
    }

    fn spawn_runtime_metrics(self: &Arc<Self>) {
        if self.metric_interval.is_zero() {
            return;
        }
        let diagnostics = Diagnostics::new(self.holder.clone(), self.cluster.clone());
        let stats = self.stats.clone();
        let interval = self.metric_interval;
        let mut close_rx = self.close_tx.subscribe();
        self.push_task(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "runtime metrics started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = close_rx.changed() => return,
                    _ = ticker.tick() => diagnostics.record_runtime(&stats),
                }
            }
        }));
    }

    fn spawn_diagnostics(self: &Arc<Self>) {
        if self.diagnostics_interval.is_zero() {
            info!("diagnostics disabled");
            return;
        }
        let diagnostics = Diagnostics::new(self.holder.clone(), self.cluster.clone());
        let interval = self.diagnostics_interval;
        let mut close_rx = self.close_tx.subscribe();
        self.push_task(tokio::spawn(async move {
            diagnostics.flush();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = close_rx.changed() => return,
                    _ = ticker.tick() => diagnostics.flush(),
                }
            }
        }));
    }

    /// Graceful shutdown: stop the workers, close the cluster, flush and
    /// close the holder and translation log.
    pub async fn close(&self) -> Result<(), ServerError> {
        info!("tessera node shutting down");
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.close_tx.send(true);
        self.cluster.close();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        self.holder.close()?;
        self.translate.close()?;
        info!("tessera node shutdown complete");
        Ok(())
    }

    /// Manually run one anti-entropy pass.
    pub fn sync_data(&self) -> Result<(), ServerError> {
        Ok(self.syncer.sync_holder()?)
    }

    // ── Schema surface ─────────────────────────────────

    pub fn create_index(&self, name: &str) -> Result<(), ServerError> {
        self.holder.create_index(name, IndexOptions::default())?;
        Ok(())
    }

    pub fn delete_index(&self, name: &str) -> Result<(), ServerError> {
        Ok(self.holder.delete_index(name)?)
    }

    pub fn create_field(
        &self,
        index: &str,
        field: &str,
        options: FieldOptions,
    ) -> Result<(), ServerError> {
        let idx = self
            .holder
            .index(index)
            .ok_or_else(|| tessera_core::CoreError::IndexNotFound(index.to_string()))?;
        idx.create_field(field, options)?;
        Ok(())
    }

    pub fn delete_field(&self, index: &str, field: &str) -> Result<(), ServerError> {
        let idx = self
            .holder
            .index(index)
            .ok_or_else(|| tessera_core::CoreError::IndexNotFound(index.to_string()))?;
        Ok(idx.delete_field(field)?)
    }

    // ── Write surface ──────────────────────────────────

    fn writable_field(
        &self,
        index: &str,
        field: &str,
        column: u64,
    ) -> Result<Arc<tessera_core::Field>, ServerError> {
        self.cluster.write_allowed(index, column / SHARD_WIDTH)?;
        self.holder
            .field(index, field)
            .ok_or_else(|| tessera_core::CoreError::FieldNotFound(field.to_string()).into())
    }

    pub fn set_bit(
        &self,
        index: &str,
        field: &str,
        row_id: u64,
        column: u64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<bool, ServerError> {
        let f = self.writable_field(index, field, column)?;
        let changed = f.set_bit(row_id, column, timestamp)?;
        self.stats.count("set_bit", 1);
        Ok(changed)
    }

    pub fn clear_bit(
        &self,
        index: &str,
        field: &str,
        row_id: u64,
        column: u64,
    ) -> Result<bool, ServerError> {
        let f = self.writable_field(index, field, column)?;
        let changed = f.clear_bit(row_id, column)?;
        self.stats.count("clear_bit", 1);
        Ok(changed)
    }

    pub fn set_value(
        &self,
        index: &str,
        field: &str,
        column: u64,
        value: i64,
    ) -> Result<bool, ServerError> {
        let f = self.writable_field(index, field, column)?;
        let changed = f.set_value(column, value)?;
        self.stats.count("set_value", 1);
        Ok(changed)
    }

    /// Apply a batch of `(row, column)` writes, rejecting oversized batches
    /// before touching any state.
    pub fn apply_writes(
        &self,
        index: &str,
        field: &str,
        writes: &[(u64, u64)],
    ) -> Result<usize, ServerError> {
        if writes.len() > self.max_writes_per_request {
            return Err(tessera_core::CoreError::BatchTooLarge {
                got: writes.len(),
                limit: self.max_writes_per_request,
            }
            .into());
        }
        let mut changed = 0;
        for &(row_id, column) in writes {
            if self.set_bit(index, field, row_id, column, None)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Resolve a string column key through the translation store.
    pub fn translate_column(&self, index: &str, key: &str) -> Result<u64, ServerError> {
        Ok(self.translate.translate_column_to_id(index, key)?)
    }

    // ── Read surface ───────────────────────────────────

    fn observe<T>(
        &self,
        op: &'static str,
        f: impl FnOnce() -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        self.stats.timing("query", elapsed);
        let threshold = self.cluster.long_query_time();
        if !threshold.is_zero() && elapsed > threshold {
            warn!(op, elapsed_ms = elapsed.as_millis() as u64, "slow query");
            self.stats.count("slow_query", 1);
        }
        result
    }

    fn readable_field(
        &self,
        index: &str,
        field: &str,
    ) -> Result<Arc<tessera_core::Field>, ServerError> {
        self.holder
            .field(index, field)
            .ok_or_else(|| tessera_core::CoreError::FieldNotFound(field.to_string()).into())
    }

    pub fn row(&self, index: &str, field: &str, row_id: u64) -> Result<Row, ServerError> {
        self.observe("row", || Ok(self.readable_field(index, field)?.row(row_id)))
    }

    pub fn count(&self, index: &str, field: &str, row_id: u64) -> Result<u64, ServerError> {
        self.observe("count", || {
            Ok(self.readable_field(index, field)?.row(row_id).count())
        })
    }

    pub fn top_n(
        &self,
        index: &str,
        field: &str,
        n: usize,
    ) -> Result<Vec<(u64, u64)>, ServerError> {
        self.observe("top_n", || Ok(self.readable_field(index, field)?.top_n(n)))
    }

    pub fn sum(
        &self,
        index: &str,
        field: &str,
        filter: Option<&Row>,
    ) -> Result<(i64, u64), ServerError> {
        self.observe("sum", || Ok(self.readable_field(index, field)?.sum(filter)?))
    }

    pub fn range(
        &self,
        index: &str,
        field: &str,
        op: RangeOp,
        value: i64,
    ) -> Result<Row, ServerError> {
        self.observe("range", || {
            Ok(self.readable_field(index, field)?.range_op(op, value)?)
        })
    }

    // ── Status gossip ──────────────────────────────────

    /// Periodic per-node status: schema plus max shard per index.
    pub fn local_status(&self) -> Message {
        Message::NodeStatus(Box::new(NodeStatus {
            node: self.cluster.local_node(),
            schema: self.holder.schema(),
            max_shards: self.holder.max_shards(),
        }))
    }

    fn handle_remote_status(&self, status: NodeStatus) {
        if self.cluster.state() != tessera_core::ClusterState::Normal {
            return;
        }
        if status.node.id == self.local.id {
            return;
        }
        let holder = self.holder.clone();
        let closing = self.closing.clone();
        // The merge waits for the holder to open; park it off the
        // transport thread.
        std::thread::spawn(move || {
            holder.opened().wait();
            if closing.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = holder.apply_schema(&status.schema) {
                warn!(error = %e, "merging remote schema failed");
                return;
            }
            for (index, max_shard) in &status.max_shards {
                match holder.index(index) {
                    Some(idx) => idx.set_remote_max_shard(&status.node.id, *max_shard),
                    None => warn!(index, "remote status for unknown index"),
                }
            }
        });
    }
}

// ─────────────────────────────────────────────
// Broadcast dispatch
// ─────────────────────────────────────────────

impl MessageHandler for Server {
    fn receive_message(&self, msg: Message) -> Result<(), ServerError> {
        debug!(tag = msg.tag(), "control message received");
        match msg {
            Message::CreateIndex { index, options } => {
                self.holder.create_index_base(&index, options)?;
            }
            Message::DeleteIndex { index } => {
                self.holder.delete_index_base(&index)?;
            }
            Message::CreateField {
                index,
                field,
                options,
            } => {
                let idx = self
                    .holder
                    .index(&index)
                    .ok_or(tessera_core::CoreError::IndexNotFound(index))?;
                idx.create_field_base(&field, options)?;
            }
            Message::DeleteField { index, field } => {
                let idx = self
                    .holder
                    .index(&index)
                    .ok_or(tessera_core::CoreError::IndexNotFound(index))?;
                idx.delete_field_base(&field)?;
            }
            Message::CreateView { index, field, view } => {
                let f = self
                    .holder
                    .field(&index, &field)
                    .ok_or(tessera_core::CoreError::FieldNotFound(field))?;
                f.create_view_base(&view)?;
            }
            Message::DeleteView { index, field, view } => {
                let f = self
                    .holder
                    .field(&index, &field)
                    .ok_or(tessera_core::CoreError::FieldNotFound(field))?;
                f.delete_view_base(&view)?;
            }
            Message::CreateShard {
                index,
                shard,
                origin,
            } => {
                let idx = self
                    .holder
                    .index(&index)
                    .ok_or(tessera_core::CoreError::IndexNotFound(index))?;
                idx.set_remote_max_shard(&origin, shard);
            }
            Message::ClusterStatus(status) => {
                self.cluster.merge_cluster_status(&status)?;
            }
            Message::ResizeInstruction(instr) => {
                self.cluster.follow_resize_instruction(&instr)?;
            }
            Message::ResizeInstructionComplete {
                job, instruction, ..
            } => {
                self.cluster.mark_resize_instruction_complete(job, instruction);
            }
            Message::SetCoordinator { new } => {
                self.cluster.set_coordinator(&new)?;
            }
            Message::UpdateCoordinator { new } => {
                self.cluster.update_coordinator(&new);
            }
            Message::NodeState { node, state } => {
                self.cluster.receive_node_state(&node, state)?;
            }
            Message::RecalculateCaches => {
                self.holder.recalculate_caches();
            }
            Message::NodeEvent(event) => {
                self.cluster.receive_event(event)?;
            }
            Message::NodeStatus(status) => {
                self.handle_remote_status(*status);
            }
        }
        Ok(())
    }
}
