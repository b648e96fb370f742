//! # tessera-cluster
//!
//! Everything a Tessera node needs to be part of a cluster:
//!
//! - [`hasher::Hasher`] / [`hasher::JumpHasher`] — deterministic shard placement
//! - [`cluster::Cluster`] — membership, coordinator role, the resize state machine
//! - [`syncer::HolderSyncer`] — background anti-entropy over replicas
//! - [`remote::RemoteClient`] — fragment fetch seam (HTTP in production,
//!   an in-memory registry in tests)
//!
//! ## Design principles
//!
//! - **Coordinator-driven**: exactly one node transitions cluster state;
//!   everyone else follows the `ClusterStatus` it publishes.
//! - **Deterministic placement**: owners of `(index, shard)` are a pure
//!   function of the live node set, so every peer computes the same list
//!   without coordination.
//! - **Monotonic repair**: anti-entropy and resize pulls only ever add
//!   bits; divergent replicas converge to the union.

pub mod cluster;
pub mod error;
pub mod hasher;
pub mod remote;
pub mod resize;
pub mod syncer;

pub use cluster::{Cluster, ClusterOptions};
pub use error::ClusterError;
pub use hasher::{shard_hash_key, Hasher, JumpHasher};
pub use remote::{MemoryRemoteClient, RemoteClient};
pub use syncer::HolderSyncer;
