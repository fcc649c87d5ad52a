//! RIPPLE Sync - Mutations, Sagas and Workflows
//!
//! Builds on the store and query registry in `ripple-storage`:
//!
//! - [`mutation`]: optimistic writes with snapshot rollback, serialized per key
//! - [`saga`]: ordered multi-step remote operations with reverse compensation
//! - [`remote`]: the remote-service traits and an in-memory backend
//! - [`workflows`]: posts, todos and profiles wired through the cache
//! - [`context`]: the handle that owns one isolated cache

pub mod context;
pub mod mutation;
pub mod remote;
pub mod saga;
pub mod workflows;

pub use context::SyncContext;
pub use mutation::{Mutation, MutationOutcome, MutationPipeline, OptimisticWriter};
pub use remote::{
    ops, AssetRemote, InMemoryRemote, PostRemote, ProfileRemote, Remote, TodoRemote,
};
pub use saga::{Saga, SagaStep};
