//! Server-level error type, uniting the core and cluster taxonomies.

use thiserror::Error;

use tessera_cluster::ClusterError;
use tessera_core::CoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("node '{0}' unreachable")]
    Unreachable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ServerError {
    /// Whether the caller should refresh cluster state and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerError::Cluster(ClusterError::EventQueueFull)
                | ServerError::Cluster(ClusterError::WrongState(_))
                | ServerError::Unreachable(_)
        )
    }
}
