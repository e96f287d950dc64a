use std::cmp::Reverse;
use std::path::PathBuf;

use log::{debug, info, warn};
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::config::MatchSettings;
use crate::db::store::{FingerprintStore, Match};
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;

/// Search every shard in parallel and merge the per-shard results.
///
/// Each worker opens its own connection; a shard that fails to open or
/// query is logged and contributes nothing.
pub fn search_shards(
    shards: &[PathBuf],
    fingerprints: &[Fingerprint],
    threshold: f32,
    workers: usize,
    matching: &MatchSettings,
) -> Result<Vec<Match>> {
    if shards.is_empty() || fingerprints.is_empty() {
        return Ok(Vec::new());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| EngineError::Internal(format!("failed to build worker pool: {e}")))?;

    let all: Vec<Match> = pool.install(|| {
        shards
            .par_iter()
            .flat_map_iter(|path| {
                let started = std::time::Instant::now();
                let matches = FingerprintStore::open(path)
                    .and_then(|mut store| store.find_matches(fingerprints, threshold));
                match matches {
                    Ok(matches) => {
                        debug!(
                            "searched {} in {:.2?}: {} candidate alignments",
                            path.display(),
                            started.elapsed(),
                            matches.len()
                        );
                        matches
                    }
                    Err(e) => {
                        warn!("shard {} failed: {e}", path.display());
                        Vec::new()
                    }
                }
            })
            .collect()
    });

    Ok(merge_matches(all, matching))
}

/// Rank merged shard results. A match at or above the early-termination
/// confidence wins outright; otherwise results are ordered by
/// (confidence desc, song_id asc, offset asc) and capped.
pub fn merge_matches(mut matches: Vec<Match>, matching: &MatchSettings) -> Vec<Match> {
    if matches.is_empty() {
        return matches;
    }

    if let Some(cutoff) = matching.early_termination {
        if let Some(best) = matches
            .iter()
            .max_by_key(|m| OrderedFloat(m.confidence))
            .cloned()
        {
            if best.confidence >= cutoff {
                info!(
                    "high-confidence match ({:.2}%), terminating search early",
                    best.confidence * 100.0
                );
                return vec![best];
            }
        }
    }

    matches.sort_by_key(|m| {
        (
            Reverse(OrderedFloat(m.confidence)),
            m.song_id,
            OrderedFloat(m.offset),
        )
    });
    matches.truncate(matching.max_returned);
    matches
}
