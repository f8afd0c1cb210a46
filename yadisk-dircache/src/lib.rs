//! Directory trees of a Yandex Disk account, assembled incrementally from
//! streamed listings, cached with stale-while-revalidate semantics and
//! presented through a virtual alias namespace.

pub mod alias;
pub mod builder;
pub mod bus;
pub mod cache;
pub mod config;
pub mod paths;
pub mod transport;
pub mod tree;
pub mod view;

#[cfg(test)]
mod testing;

pub use alias::{AliasEntry, AliasMapper, PUBLIC_GROUP};
pub use builder::{BuilderConfig, BuilderError, BuilderWorker, Snapshot, SnapshotKind, TreeBuilder};
pub use bus::{CacheId, Invalidation, InvalidationBus};
pub use cache::{CacheConfig, CacheEntry, CacheError, CacheKey, DirectoryCache, LoadEvent, ReadOptions};
pub use config::{ConfigError, Settings};
pub use transport::{DirectoryTransport, EntryStream, TransportError, YadiskTransport};
pub use tree::{EntryPayload, TreeNode};
pub use view::DirectoryView;
