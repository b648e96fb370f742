//! Anti-entropy: background reconciliation between replicas.
//!
//! Broadcasts can be missed (a peer was down, a send raced a crash), so a
//! periodic pass walks every `(index, field, view, shard)` this node owns,
//! compares fragment digests with the peer replicas, and on any mismatch
//! pulls the peer's rows and merges them. The merge is monotonic — bits
//! are gained, never lost — so one round on a quiescent cluster converges
//! every replica to the union.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use tessera_core::{ClusterState, Holder, Node, NodeState, StatsClient};

use crate::cluster::Cluster;
use crate::error::ClusterError;
use crate::remote::RemoteClient;

/// Transient peer errors are retried this many times with a short pause.
const FETCH_RETRIES: usize = 3;
const FETCH_BACKOFF: Duration = Duration::from_millis(100);

pub struct HolderSyncer {
    holder: Arc<Holder>,
    cluster: Arc<Cluster>,
    remote: Arc<dyn RemoteClient>,
    closing: Arc<AtomicBool>,
    stats: Arc<dyn StatsClient>,
}

impl HolderSyncer {
    pub fn new(
        holder: Arc<Holder>,
        cluster: Arc<Cluster>,
        remote: Arc<dyn RemoteClient>,
        closing: Arc<AtomicBool>,
        stats: Arc<dyn StatsClient>,
    ) -> Self {
        Self {
            holder,
            cluster,
            remote,
            closing,
            stats,
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// One full anti-entropy pass over everything this node replicates.
    /// Skipped entirely unless the cluster is NORMAL.
    pub fn sync_holder(&self) -> Result<(), ClusterError> {
        let state = self.cluster.state();
        if state != ClusterState::Normal {
            debug!(state = %state, "skipping anti-entropy outside NORMAL");
            return Ok(());
        }

        let local = self.cluster.local_node();
        for index in self.holder.indexes() {
            let max_shard = index.max_shard();
            for shard in 0..=max_shard {
                if self.is_closing() {
                    return Ok(());
                }
                let owners = self.cluster.shard_nodes(index.name(), shard);
                if !owners.iter().any(|n| n.uri == local.uri) {
                    continue;
                }
                let peers: Vec<Node> = owners
                    .into_iter()
                    .filter(|n| n.uri != local.uri && n.state != NodeState::Down)
                    .collect();
                if peers.is_empty() {
                    continue;
                }
                for field in index.fields() {
                    for view in field.views() {
                        self.sync_fragment(index.name(), field.name(), &view, shard, &peers)?;
                    }
                }
            }
        }
        self.stats.count("anti_entropy_pass", 1);
        Ok(())
    }

    fn sync_fragment(
        &self,
        index: &str,
        field: &str,
        view: &Arc<tessera_core::View>,
        shard: u64,
        peers: &[Node],
    ) -> Result<(), ClusterError> {
        let local_digest = view.fragment(shard).map(|f| f.digest());

        for peer in peers {
            let peer_digest =
                match self.with_retries(|| self.remote.fragment_digest(peer, index, field, view.name(), shard)) {
                    Ok(digest) => digest,
                    Err(e) => {
                        warn!(peer = %peer.id, index, field, shard, error = %e, "digest fetch failed");
                        continue;
                    }
                };

            let differs = match (local_digest, peer_digest) {
                (_, None) => false, // peer has nothing to offer
                (None, Some(_)) => true,
                (Some(local), Some(remote)) => local != remote,
            };
            if !differs {
                continue;
            }

            let rows = match self.with_retries(|| {
                self.remote.fragment_rows(peer, index, field, view.name(), shard)
            }) {
                Ok(Some(rows)) => rows,
                Ok(None) => continue,
                Err(e) => {
                    warn!(peer = %peer.id, index, field, shard, error = %e, "row fetch failed");
                    continue;
                }
            };

            let frag = view.create_fragment_base(shard)?;
            if frag.merge_rows(rows)? {
                debug!(index, field, view = view.name(), shard, peer = %peer.id, "fragment repaired");
                self.stats.count("anti_entropy_repair", 1);
            }
        }
        Ok(())
    }

    fn with_retries<T>(
        &self,
        mut f: impl FnMut() -> Result<T, ClusterError>,
    ) -> Result<T, ClusterError> {
        let mut last = None;
        for attempt in 0..FETCH_RETRIES {
            if self.is_closing() {
                break;
            }
            match f() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last = Some(e);
                    if attempt + 1 < FETCH_RETRIES {
                        std::thread::sleep(FETCH_BACKOFF);
                    }
                }
            }
        }
        Err(last.unwrap_or(ClusterError::EmptyCluster))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
