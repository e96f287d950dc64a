use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::db::store::FingerprintStore;
use crate::error::Result;

/// Base path of a shard set. Shards materialize as `<stem>_<index><ext>`
/// next to each other and are discovered back by that pattern.
#[derive(Debug, Clone)]
pub struct ShardBase {
    dir: PathBuf,
    stem: String,
    ext: String,
}

impl ShardBase {
    /// Split `base` into directory, stem and extension. A base without an
    /// extension gets `.db`.
    pub fn new(base: &Path) -> Self {
        let dir = match base.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fingerprints".to_string());
        let ext = base
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_else(|| ".db".to_string());
        Self { dir, stem, ext }
    }

    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{}{}", self.stem, index, self.ext))
    }

    /// All existing shard files, sorted lexicographically by filename.
    /// A missing directory simply means no shards yet.
    pub fn discover(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let prefix = format!("{}_", self.stem);
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| {
                name.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(&self.ext))
                    .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
            })
            .collect();
        names.sort();
        names.into_iter().map(|name| self.dir.join(name)).collect()
    }
}

/// Pick the shard a new song should land in: the one with the fewest songs
/// still under `max_songs`, or a fresh shard when every existing one is
/// full.
pub fn select_shard_for_insert(base: &ShardBase, max_songs: i64) -> Result<PathBuf> {
    let existing = base.discover();
    if existing.is_empty() {
        let path = base.shard_path(1);
        info!("creating new shard: {}", path.display());
        return Ok(path);
    }

    let mut chosen: Option<(PathBuf, i64)> = None;
    for path in &existing {
        let count = match FingerprintStore::open(path).and_then(|s| s.song_count()) {
            Ok(count) => count,
            Err(e) => {
                warn!("skipping unreadable shard {}: {e}", path.display());
                continue;
            }
        };
        if count < max_songs && chosen.as_ref().is_none_or(|(_, best)| count < *best) {
            chosen = Some((path.clone(), count));
        }
    }

    match chosen {
        Some((path, _)) => Ok(path),
        None => {
            let path = base.shard_path(existing.len() + 1);
            info!("all shards full, creating new shard: {}", path.display());
            Ok(path)
        }
    }
}
