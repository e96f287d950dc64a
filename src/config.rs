use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;

use crate::error::EngineError;

/// Which landmark hash layout(s) to emit. The two layouts occupy disjoint
/// halves of the 32-bit space (bit 31 clear for v1, set for v2), so a store
/// ingested with one method never answers queries made with the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HashMethod {
    V1,
    V2,
    Both,
}

impl HashMethod {
    pub fn includes_v1(self) -> bool {
        matches!(self, HashMethod::V1 | HashMethod::Both)
    }

    pub fn includes_v2(self) -> bool {
        matches!(self, HashMethod::V2 | HashMethod::Both)
    }
}

impl FromStr for HashMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(HashMethod::V1),
            "v2" => Ok(HashMethod::V2),
            "both" => Ok(HashMethod::Both),
            other => Err(EngineError::Config(format!(
                "unknown hash method '{other}' (expected v1, v2 or both)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    Hamming,
    Hann,
}

impl WindowFunction {
    /// Window coefficient at position `i` of an `n`-point window.
    pub fn coefficient(self, i: usize, n: usize) -> f32 {
        if n < 2 {
            return 1.0;
        }
        let x = 2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32;
        match self {
            WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
            WindowFunction::Hann => 0.5 * (1.0 - x.cos()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub sample_rate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self { sample_rate: 44_100 }
    }
}

#[derive(Debug, Clone)]
pub struct StftSettings {
    pub n_fft: usize,
    pub hop_length: usize,
    pub window: WindowFunction,
}

impl Default for StftSettings {
    fn default() -> Self {
        Self {
            n_fft: 2048,
            hop_length: 512,
            window: WindowFunction::Hamming,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeakSettings {
    /// Chebyshev radius of the local-maximum neighborhood.
    pub neighborhood_size: usize,
    /// Absolute floor in dB (relative to the clip maximum); candidates must
    /// exceed this strictly.
    pub threshold_abs_db: f32,
    pub max_peaks_per_frame: usize,
    pub max_peaks_total: usize,
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// Number of log-spaced decimation buckets between `min_frequency` and
    /// `max_frequency`.
    pub freq_bins: usize,
}

impl Default for PeakSettings {
    fn default() -> Self {
        Self {
            neighborhood_size: 5,
            threshold_abs_db: -22.0,
            max_peaks_per_frame: 7,
            max_peaks_total: 5000,
            min_frequency: 20.0,
            max_frequency: 5000.0,
            freq_bins: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintSettings {
    /// Maximum number of targets paired with each anchor.
    pub fan_value: usize,
    pub min_time_delta_ms: f32,
    pub max_time_delta_ms: f32,
    /// Quantization bins for anchor/target frequencies.
    pub freq_bin_count: u32,
    pub hash_method: HashMethod,
}

impl Default for FingerprintSettings {
    fn default() -> Self {
        Self {
            fan_value: 40,
            min_time_delta_ms: 0.0,
            max_time_delta_ms: 200.0,
            freq_bin_count: 32,
            hash_method: HashMethod::Both,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchSettings {
    /// Confidence floor applied by the CLI.
    pub cli_threshold: f32,
    /// Looser floor applied by the HTTP endpoint so the caller can rank weak
    /// candidates itself.
    pub http_threshold: f32,
    /// Stop the cross-shard search as soon as a match reaches this
    /// confidence. `None` disables the short-circuit and always ranks the
    /// full result set.
    pub early_termination: Option<f32>,
    pub max_returned: usize,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            cli_threshold: 0.05,
            http_threshold: 0.001,
            early_termination: Some(0.90),
            max_returned: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardSettings {
    pub max_songs_per_database: i64,
    /// Directory holding the shard files when no explicit base is given.
    pub database_dir: PathBuf,
    /// Base filename; shards materialize as `<base>_<index>.db`.
    pub database_name: String,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            max_songs_per_database: 25,
            database_dir: PathBuf::from("data").join("database"),
            database_name: "fingerprints".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Ingest chunk length in seconds.
    pub chunk_secs: u32,
    /// Worker pool size; `None` picks `min(hardware threads, 4)`.
    pub workers: Option<usize>,
    pub songs_per_db: i64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_secs: 30,
            workers: None,
            songs_per_db: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub frontend_origin: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            frontend_origin: "http://localhost:3000".to_string(),
        }
    }
}

/// Every tunable of the engine, grouped by stage.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub audio: AudioSettings,
    pub stft: StftSettings,
    pub peaks: PeakSettings,
    pub fingerprint: FingerprintSettings,
    pub matching: MatchSettings,
    pub shards: ShardSettings,
    pub pipeline: PipelineSettings,
    pub server: ServerSettings,
}

impl Settings {
    /// Effective worker count for parallel ingest and shard fan-out.
    pub fn worker_count(&self) -> usize {
        match self.pipeline.workers {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(4),
        }
    }

    /// Default shard base path, `<database_dir>/<database_name>`.
    pub fn default_shard_base(&self) -> PathBuf {
        self.shards.database_dir.join(&self.shards.database_name)
    }
}
