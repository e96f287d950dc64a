pub mod shards;
pub mod store;

pub use shards::{select_shard_for_insert, ShardBase};
pub use store::{FingerprintStore, Match, Song, StoreStats};
