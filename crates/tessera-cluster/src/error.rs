//! Error types for the cluster layer.

use thiserror::Error;

use tessera_core::{ClusterState, CoreError};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster event queue is full, retry later")]
    EventQueueFull,

    #[error("node '{0}' not found in the cluster")]
    NodeNotFound(String),

    #[error("this node is not the coordinator")]
    NotCoordinator,

    #[error("no live nodes available")]
    EmptyCluster,

    #[error("writes refused: {live} of {required} required replicas live")]
    Degraded { live: usize, required: usize },

    #[error("peer {node} unreachable: {detail}")]
    PeerUnreachable { node: String, detail: String },

    #[error("resize step timed out waiting for {node}")]
    ResizeTimeout { node: String },

    #[error("cluster is {0}, retry once it returns to normal")]
    WrongState(ClusterState),

    #[error(transparent)]
    Core(#[from] CoreError),
}
