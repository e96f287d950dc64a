pub mod audio;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod matcher;
pub mod peaks;
pub mod pipeline;
pub mod server;
pub mod spectrogram;

pub use config::{HashMethod, Settings};
pub use db::shards::ShardBase;
pub use db::store::{FingerprintStore, Match, Song, StoreStats};
pub use error::{EngineError, Result};
pub use fingerprint::{Fingerprint, FingerprintGenerator};
pub use peaks::{Peak, PeakFinder};
pub use spectrogram::{Spectrogram, SpectrogramData};
