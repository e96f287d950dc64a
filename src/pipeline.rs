use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{error, info, warn};
use rayon::prelude::*;

use crate::audio;
use crate::config::Settings;
use crate::db::shards::{select_shard_for_insert, ShardBase};
use crate::db::store::{FingerprintStore, Match, StoreStats};
use crate::error::{EngineError, Result};
use crate::fingerprint::{Fingerprint, FingerprintGenerator};
use crate::matcher;
use crate::peaks::PeakFinder;

/// File extensions picked up by directory ingest.
pub const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "wav", "flac", "m4a", "ogg"];

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestSummary {
    pub inserted: usize,
    pub failed: usize,
    pub shards_written: usize,
}

#[derive(Debug)]
pub struct ShardReport {
    pub path: PathBuf,
    pub stats: StoreStats,
}

/// Fingerprint a PCM clip.
///
/// With `chunk_secs` the clip is processed in consecutive non-overlapping
/// chunks and peak times are shifted by the chunk offset, so anchor times
/// are absolute clip times; queries pass `None` and go through in one
/// piece. A clip that yields no peaks is not an error, just an empty list.
pub fn fingerprints_for_clip(
    pcm: &[f32],
    settings: &Settings,
    chunk_secs: Option<u32>,
) -> Result<Vec<Fingerprint>> {
    let finder = PeakFinder::new(settings);
    let generator = FingerprintGenerator::new(settings);
    let sample_rate = settings.audio.sample_rate as usize;
    let mut fingerprints = Vec::new();

    match chunk_secs {
        Some(secs) if secs > 0 => {
            let chunk_samples = secs as usize * sample_rate;
            let total_chunks = pcm.len().div_ceil(chunk_samples);
            for (i, chunk) in pcm.chunks(chunk_samples).enumerate() {
                info!(
                    "processing chunk {}/{} ({:.2}s)",
                    i + 1,
                    total_chunks,
                    chunk.len() as f32 / sample_rate as f32
                );
                let mut peaks = match finder.process(chunk) {
                    Ok((_, peaks)) => peaks,
                    Err(EngineError::EmptyInput(_)) => continue,
                    Err(e) => return Err(e),
                };

                let chunk_offset = (i as u32 * secs) as f32;
                for peak in &mut peaks {
                    peak.time_s += chunk_offset;
                }
                fingerprints.extend(generator.generate(&peaks));
            }
        }
        _ => match finder.process(pcm) {
            Ok((_, peaks)) => fingerprints.extend(generator.generate(&peaks)),
            Err(EngineError::EmptyInput(_)) => {}
            Err(e) => return Err(e),
        },
    }

    Ok(fingerprints)
}

/// Ingest a single file: decode, fingerprint in chunks, and insert into the
/// least-loaded shard in one transaction.
pub fn fingerprint_file(
    path: &Path,
    song_name: Option<&str>,
    base: &ShardBase,
    settings: &Settings,
) -> Result<i64> {
    if !path.exists() {
        return Err(EngineError::Decode(format!("file not found: {}", path.display())));
    }
    let name = match song_name {
        Some(name) => name.to_string(),
        None => file_stem(path),
    };

    info!("processing song '{name}' from {}", path.display());
    let started = Instant::now();
    let pcm = audio::load_audio(path, settings.audio.sample_rate)?;
    info!(
        "audio loaded in {:.2?} ({:.2}s of samples)",
        started.elapsed(),
        pcm.len() as f32 / settings.audio.sample_rate as f32
    );

    let fingerprints =
        fingerprints_for_clip(&pcm, settings, Some(settings.pipeline.chunk_secs))?;
    info!("generated {} fingerprints", fingerprints.len());

    let shard = select_shard_for_insert(base, settings.shards.max_songs_per_database)?;
    let mut store = FingerprintStore::open(&shard)?;
    store.add_song(&name, &path.to_string_lossy(), &fingerprints)
}

/// Ingest every audio file under `dir`, recursively.
///
/// Files are decoded and fingerprinted on a worker pool; failures are
/// logged and skipped. Successes fill shards in batches of `songs_per_db`,
/// one shard per batch index, so at most two batches of fingerprint
/// buffers are resident at a time.
pub fn fingerprint_directory(
    dir: &Path,
    base: &ShardBase,
    settings: &Settings,
) -> Result<IngestSummary> {
    if !dir.is_dir() {
        return Err(EngineError::Config(format!(
            "not a directory: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    collect_audio_files(dir, &mut files)?;
    files.sort();
    if files.is_empty() {
        warn!("no audio files found in {}", dir.display());
        return Ok(IngestSummary::default());
    }

    let workers = settings.worker_count();
    let songs_per_db = settings.pipeline.songs_per_db.max(1) as usize;
    info!(
        "found {} audio files, processing with {workers} workers",
        files.len()
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| EngineError::Internal(format!("failed to build worker pool: {e}")))?;

    let mut summary = IngestSummary::default();
    let mut pending: Vec<ProcessedSong> = Vec::new();
    let mut next_shard = 1usize;
    let started = Instant::now();

    for batch in files.chunks(songs_per_db) {
        let results: Vec<Option<ProcessedSong>> = pool.install(|| {
            batch
                .par_iter()
                .map(|file| match process_song(file, settings) {
                    Ok(song) => Some(song),
                    Err(e) => {
                        error!("skipping {}: {e}", file.display());
                        None
                    }
                })
                .collect()
        });
        for result in results {
            match result {
                Some(song) => pending.push(song),
                None => summary.failed += 1,
            }
        }

        while pending.len() >= songs_per_db {
            let full: Vec<ProcessedSong> = pending.drain(..songs_per_db).collect();
            summary.inserted += insert_batch(base, next_shard, &full)?;
            summary.shards_written += 1;
            next_shard += 1;
        }
    }

    if !pending.is_empty() {
        summary.inserted += insert_batch(base, next_shard, &pending)?;
        summary.shards_written += 1;
    }

    info!(
        "ingested {}/{} files into {} shard(s) in {:.2?}",
        summary.inserted,
        files.len(),
        summary.shards_written,
        started.elapsed()
    );
    Ok(summary)
}

/// Identify a clip against every discovered shard.
///
/// Returns an empty list when the catalog is empty, the clip yields no
/// fingerprints, or nothing clears the threshold.
pub fn identify_file(
    path: &Path,
    base: &ShardBase,
    settings: &Settings,
    duration: Option<f32>,
    threshold: f32,
) -> Result<Vec<Match>> {
    if !path.exists() {
        return Err(EngineError::Decode(format!("file not found: {}", path.display())));
    }

    let shards = base.discover();
    if shards.is_empty() {
        error!("no shard databases found");
        return Ok(Vec::new());
    }
    info!("searching {} shard(s)", shards.len());

    let mut pcm = audio::load_audio(path, settings.audio.sample_rate)?;
    if let Some(secs) = duration.filter(|&d| d > 0.0) {
        let cap = (secs * settings.audio.sample_rate as f32) as usize;
        if cap < pcm.len() {
            info!("using first {secs:.2}s of audio");
            pcm.truncate(cap);
        }
    }

    let started = Instant::now();
    let fingerprints = fingerprints_for_clip(&pcm, settings, None)?;
    info!(
        "generated {} query fingerprints in {:.2?}",
        fingerprints.len(),
        started.elapsed()
    );
    if fingerprints.is_empty() {
        warn!("query produced no fingerprints");
        return Ok(Vec::new());
    }

    matcher::search_shards(
        &shards,
        &fingerprints,
        threshold,
        settings.worker_count(),
        &settings.matching,
    )
}

/// Per-shard statistics for every discovered shard.
pub fn collect_stats(base: &ShardBase) -> Result<Vec<ShardReport>> {
    let mut reports = Vec::new();
    for path in base.discover() {
        match FingerprintStore::open(&path).and_then(|store| store.stats()) {
            Ok(stats) => reports.push(ShardReport { path, stats }),
            Err(e) => warn!("skipping unreadable shard {}: {e}", path.display()),
        }
    }
    Ok(reports)
}

type ProcessedSong = (PathBuf, String, Vec<Fingerprint>);

fn process_song(path: &Path, settings: &Settings) -> Result<ProcessedSong> {
    let name = file_stem(path);
    info!("processing file: {}", path.display());
    let pcm = audio::load_audio(path, settings.audio.sample_rate)?;
    let fingerprints =
        fingerprints_for_clip(&pcm, settings, Some(settings.pipeline.chunk_secs))?;
    info!("finished '{name}' with {} fingerprints", fingerprints.len());
    Ok((path.to_path_buf(), name, fingerprints))
}

fn insert_batch(base: &ShardBase, shard_index: usize, songs: &[ProcessedSong]) -> Result<usize> {
    let shard = base.shard_path(shard_index);
    info!("writing {} song(s) to {}", songs.len(), shard.display());
    let mut store = FingerprintStore::open(&shard)?;

    let mut inserted = 0;
    for (path, name, fingerprints) in songs {
        match store.add_song(name, &path.to_string_lossy(), fingerprints) {
            Ok(_) => inserted += 1,
            Err(e) => error!("failed to add '{name}' to shard {shard_index}: {e}"),
        }
    }
    Ok(inserted)
}

fn collect_audio_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_audio_files(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| AUDIO_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
