//! Fragment-fetch seam between cluster peers.
//!
//! Anti-entropy and resize both need to pull fragment state from a remote
//! node. In production that is an HTTP client against the peer's internal
//! API; here the core only defines the trait, plus an in-memory registry
//! implementation that multi-node tests (and `cluster.disabled` static
//! deployments sharing a process) wire holders into directly.

use std::sync::Arc;

use dashmap::DashMap;

use tessera_core::{Holder, Node};

use crate::error::ClusterError;

pub trait RemoteClient: Send + Sync {
    /// Digest of the peer's fragment, `None` when the peer has no such
    /// fragment.
    fn fragment_digest(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
    ) -> Result<Option<u64>, ClusterError>;

    /// Serialized row containers of the peer's fragment, `None` when the
    /// peer has no such fragment.
    fn fragment_rows(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
    ) -> Result<Option<Vec<(u64, Vec<u8>)>>, ClusterError>;
}

/// Remote client that never reaches anything. Single-node default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopRemoteClient;

impl RemoteClient for NopRemoteClient {
    fn fragment_digest(
        &self,
        node: &Node,
        _index: &str,
        _field: &str,
        _view: &str,
        _shard: u64,
    ) -> Result<Option<u64>, ClusterError> {
        Err(ClusterError::PeerUnreachable {
            node: node.id.clone(),
            detail: "no remote client configured".to_string(),
        })
    }

    fn fragment_rows(
        &self,
        node: &Node,
        _index: &str,
        _field: &str,
        _view: &str,
        _shard: u64,
    ) -> Result<Option<Vec<(u64, Vec<u8>)>>, ClusterError> {
        Err(ClusterError::PeerUnreachable {
            node: node.id.clone(),
            detail: "no remote client configured".to_string(),
        })
    }
}

/// In-memory registry of holders keyed by node URI. Reads go straight at
/// the peer's holder, exactly like the HTTP client would.
#[derive(Default)]
pub struct MemoryRemoteClient {
    holders: DashMap<String, Arc<Holder>>,
}

impl MemoryRemoteClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uri: &str, holder: Arc<Holder>) {
        self.holders.insert(uri.to_string(), holder);
    }

    pub fn deregister(&self, uri: &str) {
        self.holders.remove(uri);
    }

    fn holder(&self, node: &Node) -> Result<Arc<Holder>, ClusterError> {
        self.holders
            .get(&node.uri.to_string())
            .map(|h| h.clone())
            .ok_or_else(|| ClusterError::PeerUnreachable {
                node: node.id.clone(),
                detail: "not registered".to_string(),
            })
    }
}

impl RemoteClient for MemoryRemoteClient {
    fn fragment_digest(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
    ) -> Result<Option<u64>, ClusterError> {
        let holder = self.holder(node)?;
        Ok(holder
            .field(index, field)
            .and_then(|f| f.view(view))
            .and_then(|v| v.fragment(shard))
            .map(|frag| frag.digest()))
    }

    fn fragment_rows(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        view: &str,
        shard: u64,
    ) -> Result<Option<Vec<(u64, Vec<u8>)>>, ClusterError> {
        let holder = self.holder(node)?;
        Ok(holder
            .field(index, field)
            .and_then(|f| f.view(view))
            .and_then(|v| v.fragment(shard))
            .map(|frag| frag.export_rows()))
    }
}
