//! Cluster — membership, coordinator role and the resize state machine.
//!
//! Exactly one node per cluster is the coordinator; it alone drives state
//! transitions (`STARTING → NORMAL ⇄ RESIZING`, `DEGRADED` under replica
//! loss) and publishes the authoritative [`ClusterStatus`] everyone else
//! merges. Membership changes arrive as [`NodeEvent`]s on a bounded queue;
//! while a resize is running new events simply wait in the queue, and a
//! full queue fails the newest event with a retry-advisory error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tessera_core::broadcast::{ClusterStatus, ResizeInstruction};
use tessera_core::{
    Broadcaster, ClusterState, Holder, Message, Node, NodeEvent, NodeEventType, NodeState, Uri,
};

use crate::error::ClusterError;
use crate::hasher::{Hasher, JumpHasher};
use crate::remote::RemoteClient;
use crate::resize;

/// How many membership events may wait while a resize is in flight.
const EVENT_QUEUE_DEPTH: usize = 16;

// ─────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────

pub struct ClusterOptions {
    /// Number of replicas per shard, ≥ 1.
    pub replica_n: usize,
    /// This node is the initial coordinator.
    pub is_coordinator: bool,
    /// Per-resize-step timeout before the peer is marked down.
    pub resize_timeout: Duration,
    /// Queries slower than this are logged; zero disables.
    pub long_query_time: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            replica_n: 1,
            is_coordinator: false,
            resize_timeout: Duration::from_secs(60),
            long_query_time: Duration::ZERO,
        }
    }
}

// ─────────────────────────────────────────────
// Cluster
// ─────────────────────────────────────────────

struct ClusterData {
    cluster_id: String,
    nodes: Vec<Node>,
    state: ClusterState,
    coordinator: String,
}

pub struct Cluster {
    local: Node,
    replica_n: usize,
    resize_timeout: Duration,
    long_query_time: Duration,
    hasher: Box<dyn Hasher>,
    holder: Arc<Holder>,
    broadcaster: Arc<dyn Broadcaster>,
    remote: Arc<dyn RemoteClient>,
    inner: RwLock<ClusterData>,
    events_tx: Sender<NodeEvent>,
    events_rx: Receiver<NodeEvent>,
    completions_tx: Sender<(u64, u64)>,
    completions_rx: Receiver<(u64, u64)>,
    next_job: AtomicU64,
    closing: Arc<AtomicBool>,
}

impl Cluster {
    pub fn new(
        local: Node,
        holder: Arc<Holder>,
        broadcaster: Arc<dyn Broadcaster>,
        remote: Arc<dyn RemoteClient>,
        options: ClusterOptions,
    ) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_DEPTH);
        let (completions_tx, completions_rx) = unbounded();

        let mut first = local.clone();
        first.state = NodeState::Starting;
        first.is_coordinator = options.is_coordinator;
        let coordinator = if options.is_coordinator {
            local.id.clone()
        } else {
            String::new()
        };
        let cluster_id = if options.is_coordinator {
            Uuid::new_v4().simple().to_string()
        } else {
            String::new()
        };

        Self {
            local,
            replica_n: options.replica_n.max(1),
            resize_timeout: options.resize_timeout,
            long_query_time: options.long_query_time,
            hasher: Box::new(JumpHasher),
            holder,
            broadcaster,
            remote,
            inner: RwLock::new(ClusterData {
                cluster_id,
                nodes: vec![first],
                state: ClusterState::Starting,
                coordinator,
            }),
            events_tx,
            events_rx,
            completions_tx,
            completions_rx,
            next_job: AtomicU64::new(0),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ClusterData> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ClusterData> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Introspection ──────────────────────────────────

    pub fn state(&self) -> ClusterState {
        self.read().state
    }

    pub fn replica_n(&self) -> usize {
        self.replica_n
    }

    pub fn long_query_time(&self) -> Duration {
        self.long_query_time
    }

    pub fn closing(&self) -> Arc<AtomicBool> {
        self.closing.clone()
    }

    pub fn coordinator_id(&self) -> String {
        self.read().coordinator.clone()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.read().nodes.clone()
    }

    pub fn node_by_id(&self, id: &str) -> Option<Node> {
        self.read().nodes.iter().find(|n| n.id == id).cloned()
    }

    /// This node's entry in the membership list (static clusters may track
    /// it under a URI-derived ID).
    pub fn local_node(&self) -> Node {
        let data = self.read();
        data.nodes
            .iter()
            .find(|n| n.uri == self.local.uri)
            .cloned()
            .unwrap_or_else(|| self.local.clone())
    }

    fn is_local(&self, node: &Node) -> bool {
        node.uri == self.local.uri
    }

    pub fn is_local_coordinator(&self) -> bool {
        let data = self.read();
        data.nodes
            .iter()
            .any(|n| n.uri == self.local.uri && n.id == data.coordinator)
    }

    pub fn status(&self) -> ClusterStatus {
        let data = self.read();
        ClusterStatus {
            cluster_id: data.cluster_id.clone(),
            state: data.state,
            coordinator: data.coordinator.clone(),
            nodes: data.nodes.clone(),
        }
    }

    // ── Placement ──────────────────────────────────────

    /// Owners of `(index, shard)`: primary first, replicas after, stable
    /// for a given live node set on every peer.
    pub fn shard_nodes(&self, index: &str, shard: u64) -> Vec<Node> {
        resize::shard_nodes(
            &self.read().nodes,
            index,
            shard,
            self.replica_n,
            self.hasher.as_ref(),
        )
    }

    /// Whether this node owns `(index, shard)` as primary or replica.
    pub fn owns_shard(&self, index: &str, shard: u64) -> bool {
        self.shard_nodes(index, shard)
            .iter()
            .any(|n| self.is_local(n))
    }

    /// Refuse writes to shards that no longer have a full replica set.
    pub fn write_allowed(&self, index: &str, shard: u64) -> Result<(), ClusterError> {
        let owners = self.shard_nodes(index, shard);
        if owners.len() < self.replica_n {
            return Err(ClusterError::Degraded {
                live: owners.len(),
                required: self.replica_n,
            });
        }
        Ok(())
    }

    // ── Static membership ──────────────────────────────

    /// Fixed membership for `cluster.disabled` deployments: every host is
    /// ready, IDs derive from URIs so all peers agree, and the cluster is
    /// immediately NORMAL.
    pub fn set_static(&self, hosts: &[Uri]) -> Result<(), ClusterError> {
        let mut nodes: Vec<Node> = hosts
            .iter()
            .map(|uri| {
                let mut n = Node::new(&uri.to_string(), uri.clone());
                n.state = NodeState::Ready;
                n
            })
            .collect();
        if !nodes.iter().any(|n| n.uri == self.local.uri) {
            let mut me = Node::new(&self.local.uri.to_string(), self.local.uri.clone());
            me.state = NodeState::Ready;
            nodes.push(me);
        }
        tessera_core::node::sort_nodes(&mut nodes);

        let mut data = self.write();
        data.coordinator = if data.coordinator.is_empty() {
            nodes[0].id.clone()
        } else {
            self.local.uri.to_string()
        };
        for n in &mut nodes {
            n.is_coordinator = n.id == data.coordinator;
        }
        data.nodes = nodes;
        data.state = ClusterState::Normal;
        if data.cluster_id.is_empty() {
            data.cluster_id = "static".to_string();
        }
        info!(nodes = data.nodes.len(), "static cluster configured");
        Ok(())
    }

    // ── Boot ───────────────────────────────────────────

    /// Block until the cluster has left STARTING. The coordinator passes
    /// through immediately (it is the one who will move the state), and so
    /// does a node that knows no coordinator yet — its membership arrives
    /// later as a join event. Everyone else waits for the coordinator's
    /// `ClusterStatus`.
    pub fn wait_for_started(&self) -> Result<(), ClusterError> {
        if self.is_local_coordinator() {
            return Ok(());
        }
        {
            let data = self.read();
            if data.coordinator.is_empty() && data.nodes.len() <= 1 {
                return Ok(());
            }
        }
        loop {
            if self.read().state != ClusterState::Starting {
                return Ok(());
            }
            if self.closing.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Report this node's lifecycle state: applied directly on the
    /// coordinator, forwarded to it from everyone else.
    pub fn set_node_state(&self, state: NodeState) -> Result<(), ClusterError> {
        let local_id = self.local_node().id;
        if self.is_local_coordinator() {
            return self.receive_node_state(&local_id, state);
        }
        let coordinator = {
            let data = self.read();
            let id = data.coordinator.clone();
            data.nodes.iter().find(|n| n.id == id).cloned()
        };
        match coordinator {
            Some(node) => self
                .broadcaster
                .send_to(
                    &node,
                    &Message::NodeState {
                        node: local_id,
                        state,
                    },
                )
                .map_err(ClusterError::Core),
            None => {
                // No coordinator known yet; record locally and let the
                // status gossip catch us up.
                let mut data = self.write();
                if let Some(n) = data.nodes.iter_mut().find(|n| n.id == local_id) {
                    n.state = state;
                }
                Ok(())
            }
        }
    }

    /// Coordinator side of node-state reports.
    pub fn receive_node_state(&self, node_id: &str, state: NodeState) -> Result<(), ClusterError> {
        if !self.is_local_coordinator() {
            return Err(ClusterError::NotCoordinator);
        }
        let ready_to_start = {
            let mut data = self.write();
            match data.nodes.iter_mut().find(|n| n.id == node_id) {
                Some(node) => node.state = state,
                None => return Err(ClusterError::NodeNotFound(node_id.to_string())),
            }
            debug!(node = node_id, state = %state, "node state received");
            data.state == ClusterState::Starting
                && data.nodes.iter().all(|n| n.state == NodeState::Ready)
        };
        if ready_to_start {
            self.set_state_and_broadcast(self.effective_state())?;
        } else {
            self.broadcast_status()?;
        }
        Ok(())
    }

    // ── State transitions ──────────────────────────────

    /// NORMAL, or DEGRADED while fewer live nodes than replicas exist.
    fn effective_state(&self) -> ClusterState {
        let data = self.read();
        let live = data
            .nodes
            .iter()
            .filter(|n| n.state != NodeState::Down)
            .count();
        if live < self.replica_n {
            ClusterState::Degraded
        } else {
            ClusterState::Normal
        }
    }

    fn set_state_and_broadcast(&self, state: ClusterState) -> Result<(), ClusterError> {
        {
            let mut data = self.write();
            if data.state != state {
                info!(from = %data.state, to = %state, "cluster state transition");
            }
            data.state = state;
        }
        self.broadcast_status()
    }

    fn broadcast_status(&self) -> Result<(), ClusterError> {
        let status = self.status();
        self.broadcaster
            .send_sync(&Message::ClusterStatus(status))
            .map_err(ClusterError::Core)
    }

    /// Adopt the coordinator's view. No-op on the coordinator itself.
    pub fn merge_cluster_status(&self, status: &ClusterStatus) -> Result<(), ClusterError> {
        if self.is_local_coordinator() && status.coordinator != self.local.id {
            // Competing coordinator; keep ours, the operator resolves via
            // SetCoordinator.
            warn!(theirs = %status.coordinator, "ignoring status from a competing coordinator");
            return Ok(());
        }
        let mut data = self.write();
        data.cluster_id = status.cluster_id.clone();
        data.coordinator = status.coordinator.clone();
        let mut nodes = status.nodes.clone();
        tessera_core::node::sort_nodes(&mut nodes);
        data.nodes = nodes;
        data.state = status.state;
        Ok(())
    }

    // ── Coordinator handover ───────────────────────────

    /// `SetCoordinator` arrived: if it names this node, adopt the role and
    /// announce it to everyone.
    pub fn set_coordinator(&self, new: &str) -> Result<(), ClusterError> {
        let local_id = self.local_node().id;
        if new != local_id {
            debug!(new, "set-coordinator for another node, ignoring");
            return Ok(());
        }
        {
            let mut data = self.write();
            data.coordinator = local_id.clone();
            for n in &mut data.nodes {
                n.is_coordinator = n.id == local_id;
            }
        }
        self.broadcaster
            .send_sync(&Message::UpdateCoordinator { new: local_id })
            .map_err(ClusterError::Core)?;
        self.broadcast_status()
    }

    /// `UpdateCoordinator` arrived: record the new coordinator.
    pub fn update_coordinator(&self, new: &str) {
        let mut data = self.write();
        data.coordinator = new.to_string();
        for n in &mut data.nodes {
            n.is_coordinator = n.id == new;
        }
    }

    // ── Membership events ──────────────────────────────

    /// Queue a membership event. Fails with a retry-advisory error when the
    /// queue is full (a resize is already grinding through earlier events).
    pub fn receive_event(&self, event: NodeEvent) -> Result<(), ClusterError> {
        match self.events_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ClusterError::EventQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ClusterError::EmptyCluster),
        }
    }

    /// Drain membership events until the close signal. Runs on the
    /// coordinator control task.
    pub fn listen_for_events(&self) {
        while !self.closing.load(Ordering::SeqCst) {
            match self.events_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(event) => {
                    if let Err(e) = self.handle_event(&event) {
                        warn!(event = ?event.event, node = %event.node.id, error = %e, "membership event failed");
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle_event(&self, event: &NodeEvent) -> Result<(), ClusterError> {
        match event.event {
            NodeEventType::Join => {
                if !self.is_local_coordinator() {
                    return Ok(());
                }
                self.handle_join(&event.node)
            }
            NodeEventType::Leave => self.handle_leave(&event.node),
            NodeEventType::Update => {
                if !self.is_local_coordinator() {
                    return Ok(());
                }
                let mut found = false;
                {
                    let mut data = self.write();
                    if let Some(n) = data.nodes.iter_mut().find(|n| n.id == event.node.id) {
                        n.uri = event.node.uri.clone();
                        found = true;
                    }
                }
                if found {
                    self.broadcast_status()?;
                }
                Ok(())
            }
        }
    }

    fn handle_join(&self, node: &Node) -> Result<(), ClusterError> {
        let (known, old_nodes, new_nodes, has_data) = {
            let mut data = self.write();
            if let Some(existing) = data.nodes.iter_mut().find(|n| n.id == node.id) {
                // A known member rejoining after a failure.
                existing.uri = node.uri.clone();
                existing.state = NodeState::Ready;
                (true, Vec::new(), data.nodes.clone(), false)
            } else {
                let old = data.nodes.clone();
                let mut joiner = node.clone();
                joiner.state = NodeState::Ready;
                joiner.is_coordinator = false;
                data.nodes.push(joiner);
                tessera_core::node::sort_nodes(&mut data.nodes);
                let has_data = !self.holder.indexes().is_empty();
                (false, old, data.nodes.clone(), has_data)
            }
        };

        info!(node = %node.id, known, "node joined");
        if known || !has_data {
            return self.set_state_and_broadcast(self.effective_state());
        }
        self.run_resize(old_nodes, new_nodes)
    }

    fn handle_leave(&self, node: &Node) -> Result<(), ClusterError> {
        let was_coordinator = {
            let data = self.read();
            node.id == data.coordinator
        };

        // Everyone participates in replacing a dead coordinator; other
        // leaves only concern the coordinator.
        if !was_coordinator && !self.is_local_coordinator() {
            return Ok(());
        }

        let old_nodes = {
            let mut data = self.write();
            let old = data.nodes.clone();
            match data.nodes.iter_mut().find(|n| n.id == node.id) {
                Some(n) => n.state = NodeState::Down,
                None => return Err(ClusterError::NodeNotFound(node.id.clone())),
            }
            old
        };
        info!(node = %node.id, was_coordinator, "node left");

        if was_coordinator && !self.elect_coordinator()? {
            // Another survivor takes over; nothing more for this node.
            return Ok(());
        }

        let live = {
            let data = self.read();
            data.nodes
                .iter()
                .filter(|n| n.state != NodeState::Down)
                .count()
        };
        if live < self.replica_n {
            // Too few replicas to restore redundancy; refuse writes.
            return self.set_state_and_broadcast(ClusterState::Degraded);
        }

        let new_nodes = self.read().nodes.clone();
        self.run_resize(old_nodes, new_nodes)
    }

    /// The lowest live NodeID succeeds a dead coordinator. Returns whether
    /// this node won the election.
    fn elect_coordinator(&self) -> Result<bool, ClusterError> {
        let local_id = self.local_node().id;
        let winner = {
            let data = self.read();
            data.nodes
                .iter()
                .filter(|n| n.state != NodeState::Down)
                .map(|n| n.id.clone())
                .min()
        };
        let winner = match winner {
            Some(w) => w,
            None => return Err(ClusterError::EmptyCluster),
        };
        if winner != local_id {
            debug!(winner = %winner, "coordinator election lost");
            return Ok(false);
        }
        info!("assuming coordinator role");
        {
            let mut data = self.write();
            data.coordinator = local_id.clone();
            for n in &mut data.nodes {
                n.is_coordinator = n.id == local_id;
            }
        }
        self.broadcaster
            .send_sync(&Message::UpdateCoordinator { new: local_id })
            .map_err(ClusterError::Core)?;
        Ok(true)
    }

    // ── Resize ─────────────────────────────────────────

    fn run_resize(&self, old_nodes: Vec<Node>, new_nodes: Vec<Node>) -> Result<(), ClusterError> {
        let job = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state_and_broadcast(ClusterState::Resizing)?;

        let indexes: Vec<(String, u64)> = self
            .holder
            .indexes()
            .iter()
            .map(|i| (i.name().to_string(), i.max_shard()))
            .collect();
        let coordinator = self.local_node();
        let instructions = resize::diff_instructions(
            job,
            &coordinator,
            &self.holder.schema(),
            &indexes,
            &old_nodes,
            &new_nodes,
            self.replica_n,
            self.hasher.as_ref(),
        );
        info!(job, instructions = instructions.len(), "resize started");

        // Drop completions from an aborted earlier job.
        while self.completions_rx.try_recv().is_ok() {}

        let mut pending: HashMap<u64, ResizeInstruction> = HashMap::new();
        for instr in instructions {
            if self.is_local(&instr.target) {
                // The coordinator gained the shard itself.
                self.follow_resize_instruction(&instr)?;
            } else if let Err(e) = self
                .broadcaster
                .send_to(&instr.target, &Message::ResizeInstruction(Box::new(instr.clone())))
            {
                warn!(target = %instr.target.id, error = %e, "resize instruction undeliverable");
                self.mark_down(&instr.target.id);
                self.set_state_and_broadcast(self.effective_state())?;
                return Err(ClusterError::PeerUnreachable {
                    node: instr.target.id.clone(),
                    detail: e.to_string(),
                });
            }
            pending.insert(instr.instruction, instr);
        }

        while !pending.is_empty() {
            if self.closing.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.completions_rx.recv_timeout(self.resize_timeout) {
                Ok((j, i)) if j == job => {
                    pending.remove(&i);
                }
                Ok(_) => continue, // stale completion from an aborted job
                Err(RecvTimeoutError::Timeout) => {
                    let stuck: Vec<String> =
                        pending.values().map(|i| i.target.id.clone()).collect();
                    for id in &stuck {
                        self.mark_down(id);
                    }
                    warn!(job, stuck = ?stuck, "resize step timed out, marking peers down");
                    self.set_state_and_broadcast(self.effective_state())?;
                    return Err(ClusterError::ResizeTimeout {
                        node: stuck.into_iter().next().unwrap_or_default(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }

        info!(job, "resize complete");
        self.set_state_and_broadcast(self.effective_state())
    }

    fn mark_down(&self, node_id: &str) {
        let mut data = self.write();
        if let Some(n) = data.nodes.iter_mut().find(|n| n.id == node_id) {
            n.state = NodeState::Down;
        }
    }

    /// Gaining-node side: pull every fragment of `(index, shard)` from the
    /// first reachable source, then acknowledge to the coordinator.
    pub fn follow_resize_instruction(
        &self,
        instr: &ResizeInstruction,
    ) -> Result<(), ClusterError> {
        info!(
            job = instr.job,
            index = %instr.index,
            shard = instr.shard,
            "following resize instruction"
        );
        // A freshly joined node may never have seen this schema; create
        // everything the pull is about to touch.
        self.holder.apply_schema(&instr.schema)?;
        if let Some(index) = self.holder.index(&instr.index) {
            for field in index.fields() {
                for view in field.views() {
                    self.pull_fragment(instr, field.name(), &view)?;
                }
            }
        } else {
            warn!(index = %instr.index, "resize instruction for unknown index");
        }

        self.broadcaster
            .send_to(
                &instr.coordinator,
                &Message::ResizeInstructionComplete {
                    job: instr.job,
                    instruction: instr.instruction,
                    node: self.local_node().id,
                },
            )
            .map_err(ClusterError::Core)
    }

    fn pull_fragment(
        &self,
        instr: &ResizeInstruction,
        field: &str,
        view: &Arc<tessera_core::View>,
    ) -> Result<(), ClusterError> {
        let mut last_err: Option<ClusterError> = None;
        for source in &instr.sources {
            if self.is_local(source) {
                return Ok(());
            }
            match self
                .remote
                .fragment_rows(source, &instr.index, field, view.name(), instr.shard)
            {
                Ok(Some(rows)) => {
                    let frag = view.create_fragment_base(instr.shard)?;
                    frag.merge_rows(rows)?;
                    return Ok(());
                }
                Ok(None) => return Ok(()), // source owns the shard but has no data for it
                Err(e) => {
                    warn!(source = %source.id, error = %e, "resize pull failed, trying next replica");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()), // no non-local sources: nothing to pull
        }
    }

    /// A gaining node acknowledged one instruction.
    pub fn mark_resize_instruction_complete(&self, job: u64, instruction: u64) {
        let _ = self.completions_tx.send((job, instruction));
    }

    // ── Shutdown ───────────────────────────────────────

    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::NopRemoteClient;
    use tessera_core::{NopBroadcaster, NopStats};
    use tempfile::TempDir;

    fn make_node(id: &str) -> Node {
        Node::new(id, Uri::new("http", id, 10101))
    }

    fn make_cluster(dir: &TempDir, id: &str, options: ClusterOptions) -> Cluster {
        let holder = Arc::new(Holder::new(
            dir.path(),
            Arc::new(NopBroadcaster),
            Arc::new(NopStats),
        ));
        Cluster::new(
            make_node(id),
            holder,
            Arc::new(NopBroadcaster),
            Arc::new(NopRemoteClient),
            options,
        )
    }

    #[test]
    fn coordinator_starts_alone_and_goes_normal() {
        let dir = TempDir::new().unwrap();
        let c = make_cluster(
            &dir,
            "aa",
            ClusterOptions {
                is_coordinator: true,
                ..Default::default()
            },
        );
        assert!(c.is_local_coordinator());
        assert_eq!(c.state(), ClusterState::Starting);

        c.wait_for_started().unwrap();
        c.set_node_state(NodeState::Ready).unwrap();
        assert_eq!(c.state(), ClusterState::Normal);
    }

    #[test]
    fn placement_is_deterministic_across_instances() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = make_cluster(&dir_a, "aa", ClusterOptions::default());
        let b = make_cluster(&dir_b, "bb", ClusterOptions::default());

        let status = ClusterStatus {
            cluster_id: "c".into(),
            state: ClusterState::Normal,
            coordinator: "aa".into(),
            nodes: {
                let mut nodes = vec![make_node("aa"), make_node("bb"), make_node("cc")];
                for n in &mut nodes {
                    n.state = NodeState::Ready;
                }
                nodes
            },
        };
        a.merge_cluster_status(&status).unwrap();
        b.merge_cluster_status(&status).unwrap();

        for shard in 0..32 {
            assert_eq!(a.shard_nodes("i", shard), b.shard_nodes("i", shard));
        }
    }

    #[test]
    fn write_allowed_depends_on_replica_count() {
        let dir = TempDir::new().unwrap();
        let c = make_cluster(
            &dir,
            "aa",
            ClusterOptions {
                replica_n: 2,
                is_coordinator: true,
                ..Default::default()
            },
        );
        // Single live node, two replicas required.
        assert!(matches!(
            c.write_allowed("i", 0),
            Err(ClusterError::Degraded { live: 1, required: 2 })
        ));

        let status = ClusterStatus {
            cluster_id: "c".into(),
            state: ClusterState::Normal,
            coordinator: "aa".into(),
            nodes: {
                let mut nodes = vec![make_node("aa"), make_node("bb")];
                nodes[0].uri = Uri::new("http", "aa", 10101);
                for n in &mut nodes {
                    n.state = NodeState::Ready;
                }
                nodes
            },
        };
        // Adopt a two-node view (we are not the coordinator in it).
        c.update_coordinator("aa");
        c.merge_cluster_status(&status).unwrap();
        assert!(c.write_allowed("i", 0).is_ok());
    }

    #[test]
    fn event_queue_overflow_is_retry_advisory() {
        let dir = TempDir::new().unwrap();
        let c = make_cluster(&dir, "aa", ClusterOptions::default());
        let event = NodeEvent {
            event: NodeEventType::Join,
            node: make_node("bb"),
        };
        for _ in 0..EVENT_QUEUE_DEPTH {
            c.receive_event(event.clone()).unwrap();
        }
        assert!(matches!(
            c.receive_event(event),
            Err(ClusterError::EventQueueFull)
        ));
    }

    #[test]
    fn join_without_data_adds_the_node_and_goes_normal() {
        let dir = TempDir::new().unwrap();
        let c = make_cluster(
            &dir,
            "aa",
            ClusterOptions {
                is_coordinator: true,
                ..Default::default()
            },
        );
        c.set_node_state(NodeState::Ready).unwrap();

        let mut joiner = make_node("bb");
        joiner.state = NodeState::Ready;
        c.handle_event(&NodeEvent {
            event: NodeEventType::Join,
            node: joiner,
        })
        .unwrap();

        assert_eq!(c.nodes().len(), 2);
        assert_eq!(c.state(), ClusterState::Normal);
    }

    #[test]
    fn losing_a_replica_degrades_the_cluster() {
        let dir = TempDir::new().unwrap();
        let c = make_cluster(
            &dir,
            "aa",
            ClusterOptions {
                replica_n: 2,
                is_coordinator: true,
                ..Default::default()
            },
        );
        c.set_node_state(NodeState::Ready).unwrap();
        let mut joiner = make_node("bb");
        joiner.state = NodeState::Ready;
        c.handle_event(&NodeEvent {
            event: NodeEventType::Join,
            node: joiner.clone(),
        })
        .unwrap();
        assert_eq!(c.state(), ClusterState::Normal);

        c.handle_event(&NodeEvent {
            event: NodeEventType::Leave,
            node: joiner,
        })
        .unwrap();
        assert_eq!(c.state(), ClusterState::Degraded);
        assert!(matches!(
            c.write_allowed("i", 0),
            Err(ClusterError::Degraded { .. })
        ));
    }

    #[test]
    fn lowest_live_id_wins_coordinator_election() {
        let dir = TempDir::new().unwrap();
        let c = make_cluster(&dir, "bb", ClusterOptions::default());

        let mut nodes = vec![make_node("aa"), make_node("bb"), make_node("cc")];
        nodes[1].uri = Uri::new("http", "bb", 10101);
        for n in &mut nodes {
            n.state = NodeState::Ready;
        }
        c.merge_cluster_status(&ClusterStatus {
            cluster_id: "c".into(),
            state: ClusterState::Normal,
            coordinator: "aa".into(),
            nodes,
        })
        .unwrap();

        // Coordinator aa dies; bb is now the lowest live id and takes over.
        c.handle_event(&NodeEvent {
            event: NodeEventType::Leave,
            node: make_node("aa"),
        })
        .unwrap();
        assert_eq!(c.coordinator_id(), "bb");
        assert!(c.is_local_coordinator());
    }

    #[test]
    fn static_membership_is_normal_immediately() {
        let dir = TempDir::new().unwrap();
        let c = make_cluster(&dir, "aa", ClusterOptions::default());
        c.set_static(&[
            Uri::parse("http://aa:10101").unwrap(),
            Uri::parse("http://bb:10101").unwrap(),
        ])
        .unwrap();
        assert_eq!(c.state(), ClusterState::Normal);
        assert_eq!(c.nodes().len(), 2);
        c.wait_for_started().unwrap();
    }
}
