//! Node identity and cluster-state vocabulary.
//!
//! These types are data, not behavior: the cluster state machine lives in
//! the cluster crate, but the control messages defined next door in
//! [`crate::broadcast`] carry nodes and states on the wire, so the
//! vocabulary lives here with them.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ─────────────────────────────────────────────
// Uri
// ─────────────────────────────────────────────

/// Listen address of a node: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Uri {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        }
    }

    /// Parse `"scheme://host:port"`. The scheme defaults to `http` and the
    /// port to `10101` when omitted.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidName(format!("invalid URI '{s}'"));
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("http", s),
        };
        if rest.is_empty() || rest.contains('/') {
            return Err(invalid());
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, 10101),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(scheme, host, port))
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

// ─────────────────────────────────────────────
// Node lifecycle / cluster state
// ─────────────────────────────────────────────

/// Lifecycle state of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Booting; not yet serving.
    Starting,
    /// Open and serving.
    Ready,
    /// Unreachable or administratively removed.
    Down,
    /// Currently receiving or shedding shards.
    Resizing,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Starting => write!(f, "starting"),
            NodeState::Ready => write!(f, "ready"),
            NodeState::Down => write!(f, "down"),
            NodeState::Resizing => write!(f, "resizing"),
        }
    }
}

/// State of the cluster as a whole. Transitions are driven exclusively by
/// the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Starting,
    Normal,
    Resizing,
    /// Fewer live nodes than the replica count; writes are refused.
    Degraded,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Starting => write!(f, "starting"),
            ClusterState::Normal => write!(f, "normal"),
            ClusterState::Resizing => write!(f, "resizing"),
            ClusterState::Degraded => write!(f, "degraded"),
        }
    }
}

// ─────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────

/// Identity and state of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable 32-hex-char identifier, generated on first boot and persisted
    /// under the data directory.
    pub id: String,
    pub uri: Uri,
    pub is_coordinator: bool,
    pub state: NodeState,
}

impl Node {
    pub fn new(id: &str, uri: Uri) -> Self {
        Self {
            id: id.to_string(),
            uri,
            is_coordinator: false,
            state: NodeState::Starting,
        }
    }
}

/// Sort nodes by ID. Placement and coordinator election both assume this
/// canonical ordering, so every peer derives the same list.
pub fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
}

// ─────────────────────────────────────────────
// NodeEvent
// ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEventType {
    Join,
    Leave,
    Update,
}

/// A membership change observed by the transport and fed to the
/// coordinator's event loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub event: NodeEventType,
    pub node: Node,
}
