use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

use resona::config::HashMethod;
use resona::db::shards::ShardBase;
use resona::{pipeline, server, Settings};

#[derive(Parser)]
#[command(name = "resona", about = "Audio fingerprinting and song identification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fingerprint a song or a directory of songs into the catalog
    Fingerprint {
        /// Audio file, or a directory with --dir
        path: PathBuf,
        /// Song name; defaults to the file stem
        #[arg(long)]
        name: Option<String>,
        /// Shard base path, e.g. data/database/fingerprints
        #[arg(long)]
        db: Option<PathBuf>,
        /// Recursively ingest a directory
        #[arg(long)]
        dir: bool,
        /// Ingest chunk length in seconds
        #[arg(long, default_value_t = 30)]
        chunk_size: u32,
        /// Parallel workers for directory ingest
        #[arg(long)]
        workers: Option<usize>,
        /// Songs per shard in directory ingest
        #[arg(long)]
        songs_per_db: Option<i64>,
        #[arg(long, value_enum)]
        hash_method: Option<HashMethod>,
        /// Write logs to a timestamped file under logs/
        #[arg(short, long)]
        log: bool,
    },
    /// Identify a song from an audio sample
    Identify {
        path: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Seconds of audio to analyze
        #[arg(long, default_value_t = 10.0)]
        duration: f32,
        /// Matching confidence threshold
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, value_enum)]
        hash_method: Option<HashMethod>,
        #[arg(short, long)]
        log: bool,
    },
    /// Show statistics for every shard in the catalog
    Stats {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(short, long)]
        log: bool,
    },
    /// Serve the HTTP identification endpoint
    Serve {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Origin allowed by CORS
        #[arg(long)]
        frontend_origin: Option<String>,
        #[arg(short, long)]
        log: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Fingerprint {
            path,
            name,
            db,
            dir,
            chunk_size,
            workers,
            songs_per_db,
            hash_method,
            log,
        } => {
            setup_logging(log, "fingerprint")?;
            let mut settings = Settings::default();
            settings.pipeline.chunk_secs = chunk_size;
            settings.pipeline.workers = workers;
            if let Some(n) = songs_per_db {
                settings.pipeline.songs_per_db = n;
                settings.shards.max_songs_per_database = n;
            }
            if let Some(method) = hash_method {
                settings.fingerprint.hash_method = method;
            }
            let base = shard_base(&settings, db);

            if dir {
                let summary = pipeline::fingerprint_directory(&path, &base, &settings)?;
                println!(
                    "Ingested {} song(s) into {} shard(s); {} file(s) failed",
                    summary.inserted, summary.shards_written, summary.failed
                );
            } else {
                let song_id = pipeline::fingerprint_file(&path, name.as_deref(), &base, &settings)?;
                println!("Song added with ID: {song_id}");
            }
        }

        Command::Identify {
            path,
            db,
            duration,
            threshold,
            workers,
            hash_method,
            log,
        } => {
            setup_logging(log, "identify")?;
            let mut settings = Settings::default();
            settings.pipeline.workers = workers;
            if let Some(method) = hash_method {
                settings.fingerprint.hash_method = method;
            }
            let threshold = threshold.unwrap_or(settings.matching.cli_threshold);
            let base = shard_base(&settings, db);

            let matches = pipeline::identify_file(&path, &base, &settings, Some(duration), threshold)?;
            match matches.first() {
                Some(top) => {
                    println!("Top Match is:");
                    println!(
                        "Song Name: {}, Confidence: {:.2}%, Offset: {:.2}s, Match Count: {}",
                        top.song_name,
                        top.confidence * 100.0,
                        top.offset,
                        top.match_count
                    );
                }
                None => {
                    info!("No matches found");
                    println!("No matches found");
                }
            }
        }

        Command::Stats { db, log } => {
            setup_logging(log, "stats")?;
            let settings = Settings::default();
            let base = shard_base(&settings, db);

            let reports = pipeline::collect_stats(&base)?;
            if reports.is_empty() {
                println!("No shard databases found");
                return Ok(());
            }

            let mut total_songs = 0;
            let mut total_fps = 0;
            for report in &reports {
                let s = &report.stats;
                println!(
                    "{}: {} songs, {} fingerprints ({} unique hashes, {:.1} fp/song, {:.2} MiB)",
                    report.path.display(),
                    s.songs,
                    s.fingerprints,
                    s.unique_hashes,
                    s.avg_fp_per_song,
                    s.size_bytes as f64 / (1024.0 * 1024.0)
                );
                total_songs += s.songs;
                total_fps += s.fingerprints;
            }
            println!(
                "Total across {} shard(s): {total_songs} songs, {total_fps} fingerprints",
                reports.len()
            );
        }

        Command::Serve {
            db,
            host,
            port,
            frontend_origin,
            log,
        } => {
            setup_logging(log, "serve")?;
            let mut settings = Settings::default();
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            if let Some(origin) = frontend_origin {
                settings.server.frontend_origin = origin;
            }
            let base = shard_base(&settings, db);

            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(server::serve(settings, base))?;
        }
    }

    Ok(())
}

fn shard_base(settings: &Settings, db: Option<PathBuf>) -> ShardBase {
    ShardBase::new(&db.unwrap_or_else(|| settings.default_shard_base()))
}

/// Stderr logging by default; `--log` redirects the stream into a
/// timestamped file under logs/.
fn setup_logging(to_file: bool, command: &str) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(LevelFilter::Info)
        .parse_default_env();

    if to_file {
        fs::create_dir_all("logs")?;
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let file = fs::File::create(format!("logs/{command}_{ts}.log"))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("failed to initialize logging")?;
    Ok(())
}
