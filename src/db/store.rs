use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone)]
pub struct Song {
    pub id: i64,
    pub name: String,
    pub path: String,
}

/// One plausible alignment of the query against a catalogued song.
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub song_id: i64,
    pub song_name: String,
    pub confidence: f32,
    /// Seconds into the catalogued song where the query aligns.
    pub offset: f32,
    pub match_count: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub songs: i64,
    pub fingerprints: i64,
    pub unique_hashes: i64,
    pub avg_fp_per_song: f64,
    pub size_bytes: u64,
}

/// One shard: a self-contained SQLite file holding songs and their hash
/// index. Each worker opens its own store; connections are never shared.
pub struct FingerprintStore {
    conn: Connection,
    path: PathBuf,
    next_song_id: i64,
}

impl FingerprintStore {
    /// Open (or create) the shard at `path` and prepare the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS songs (
                 id INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 path TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS fingerprints (
                 hash INTEGER NOT NULL,
                 song_id INTEGER NOT NULL,
                 time_offset REAL NOT NULL,
                 FOREIGN KEY (song_id) REFERENCES songs(id)
             );
             CREATE INDEX IF NOT EXISTS idx_fingerprints_hash ON fingerprints (hash);
             CREATE INDEX IF NOT EXISTS idx_fingerprints_song_id ON fingerprints (song_id);",
        )?;

        let max_id: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM songs", [], |row| row.get(0))?;
        let next_song_id = max_id.unwrap_or(0) + 1;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            next_song_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a song and all of its fingerprints in one transaction. On any
    /// failure the shard is left exactly as it was.
    pub fn add_song(
        &mut self,
        name: &str,
        song_path: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<i64> {
        let song_id = self.next_song_id;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO songs (id, name, path) VALUES (?1, ?2, ?3)",
            params![song_id, name, song_path],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO fingerprints (hash, song_id, time_offset) VALUES (?1, ?2, ?3)",
            )?;
            for fp in fingerprints {
                stmt.execute(params![fp.hash as i64, song_id, fp.time_offset as f64])?;
            }
        }
        tx.commit()?;

        self.next_song_id += 1;
        info!(
            "added song '{name}' (id {song_id}) with {} fingerprints",
            fingerprints.len()
        );
        Ok(song_id)
    }

    /// Histogram query-to-store time deltas and return per-(song, delta)
    /// alignments whose agreement clears `threshold`.
    ///
    /// The query set is materialized into a temporary table and joined
    /// against the hash index; the top 100 groups by agreement count are
    /// scored as `count / |query|`.
    pub fn find_matches(
        &mut self,
        fingerprints: &[Fingerprint],
        threshold: f32,
    ) -> Result<Vec<Match>> {
        if fingerprints.is_empty() {
            warn!("no fingerprints provided for matching");
            return Ok(Vec::new());
        }

        self.conn.execute_batch(
            "DROP TABLE IF EXISTS temp_query;
             CREATE TEMPORARY TABLE temp_query (
                 hash INTEGER NOT NULL,
                 time_offset REAL NOT NULL
             );",
        )?;
        {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx
                    .prepare("INSERT INTO temp_query (hash, time_offset) VALUES (?1, ?2)")?;
                for fp in fingerprints {
                    stmt.execute(params![fp.hash as i64, fp.time_offset as f64])?;
                }
            }
            tx.commit()?;
        }

        let grouped: Vec<(i64, f64, i64)> = {
            let mut stmt = self.conn.prepare(
                "SELECT
                     f.song_id,
                     ROUND((f.time_offset - q.time_offset) * 10) / 10 AS time_delta,
                     COUNT(*) AS match_count
                 FROM temp_query q
                 JOIN fingerprints f ON q.hash = f.hash
                 GROUP BY f.song_id, time_delta
                 ORDER BY match_count DESC
                 LIMIT 100",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        if grouped.is_empty() {
            return Ok(Vec::new());
        }

        let query_count = fingerprints.len() as f32;
        let scored: Vec<(i64, f64, i64, f32)> = grouped
            .into_iter()
            .filter_map(|(song_id, delta, count)| {
                let confidence = count as f32 / query_count;
                (confidence >= threshold).then_some((song_id, delta, count, confidence))
            })
            .collect();
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        let names = self.song_names(scored.iter().map(|r| r.0))?;
        // Distinct deltas for the same song stay distinct: they are separate
        // plausible alignments.
        Ok(scored
            .into_iter()
            .filter_map(|(song_id, delta, count, confidence)| {
                names.get(&song_id).map(|name| Match {
                    song_id,
                    song_name: name.clone(),
                    confidence,
                    offset: delta as f32,
                    match_count: count,
                })
            })
            .collect())
    }

    fn song_names(&self, ids: impl Iterator<Item = i64>) -> Result<HashMap<i64, String>> {
        let distinct: HashSet<i64> = ids.collect();
        if distinct.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; distinct.len()].join(",");
        let sql = format!("SELECT id, name FROM songs WHERE id IN ({placeholders})");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(distinct.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_song(&self, song_id: i64) -> Result<Option<Song>> {
        use rusqlite::OptionalExtension;
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, path FROM songs WHERE id = ?1",
                params![song_id],
                |row| {
                    Ok(Song {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        path: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn song_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM songs", [], |row| row.get(0))?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let songs = self.song_count()?;
        let fingerprints: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))?;
        let unique_hashes: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT hash) FROM fingerprints",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            songs,
            fingerprints,
            unique_hashes,
            avg_fp_per_song: fingerprints as f64 / songs.max(1) as f64,
            size_bytes: fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        })
    }

    /// Truncate both tables and reset the id counter.
    pub fn clear(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM fingerprints", [])?;
        tx.execute("DELETE FROM songs", [])?;
        tx.commit()?;
        self.next_song_id = 1;
        info!("cleared {}", self.path.display());
        Ok(())
    }

    /// Flush and release the connection.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| crate::error::EngineError::Storage(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(hash: u32, time_offset: f32) -> Fingerprint {
        Fingerprint { hash, time_offset }
    }

    fn temp_store() -> (tempfile::TempDir, FingerprintStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(&dir.path().join("shard_1.db")).unwrap();
        (dir, store)
    }

    fn ramp(n: u32, shift: f32) -> Vec<Fingerprint> {
        (0..n).map(|i| fp(0x1000 + i, shift + i as f32 * 0.1)).collect()
    }

    #[test]
    fn song_ids_are_monotonic_and_survive_reopen() {
        let (dir, mut store) = temp_store();
        assert_eq!(store.add_song("a", "/a", &ramp(5, 0.0)).unwrap(), 1);
        assert_eq!(store.add_song("b", "/b", &ramp(5, 0.0)).unwrap(), 2);
        let path = store.path().to_path_buf();
        store.close().unwrap();

        let mut reopened = FingerprintStore::open(&path).unwrap();
        assert_eq!(reopened.add_song("c", "/c", &ramp(5, 0.0)).unwrap(), 3);
        drop(dir);
    }

    #[test]
    fn stats_track_inserts() {
        let (_dir, mut store) = temp_store();
        store.add_song("a", "/a", &ramp(10, 0.0)).unwrap();
        store.add_song("b", "/b", &ramp(4, 1.0)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.songs, 2);
        assert_eq!(stats.fingerprints, 14);
        assert_eq!(stats.unique_hashes, 10);
        assert!((stats.avg_fp_per_song - 7.0).abs() < f64::EPSILON);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn add_song_rolls_back_on_conflict() {
        let (_dir, mut store) = temp_store();
        store.add_song("a", "/a", &ramp(3, 0.0)).unwrap();

        // A colliding row makes the next insert fail its song INSERT after
        // the transaction has begun; nothing of it may remain visible.
        store
            .conn
            .execute(
                "INSERT INTO songs (id, name, path) VALUES (2, 'squatter', '/s')",
                [],
            )
            .unwrap();
        assert!(store.add_song("b", "/b", &ramp(100, 0.0)).is_err());

        let stats = store.stats().unwrap();
        assert_eq!(stats.songs, 2);
        assert_eq!(stats.fingerprints, 3);
    }

    #[test]
    fn add_song_is_atomic_across_fingerprint_failures() {
        let (_dir, mut store) = temp_store();
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER poison BEFORE INSERT ON fingerprints
                 WHEN NEW.hash = 999 BEGIN SELECT RAISE(ABORT, 'poison hash'); END;",
            )
            .unwrap();

        let mut fps = ramp(5, 0.0);
        fps.push(fp(999, 1.0));
        assert!(store.add_song("doomed", "/d", &fps).is_err());

        // The whole transaction rolled back: no song row, no fingerprints,
        // and the id counter has not advanced.
        let stats = store.stats().unwrap();
        assert_eq!((stats.songs, stats.fingerprints), (0, 0));
        assert_eq!(store.add_song("ok", "/ok", &ramp(2, 0.0)).unwrap(), 1);
    }

    #[test]
    fn self_query_matches_with_full_confidence() {
        let (_dir, mut store) = temp_store();
        let fps = ramp(50, 0.0);
        let id = store.add_song("song", "/song", &fps).unwrap();

        let matches = store.find_matches(&fps, 0.05).unwrap();
        assert!(!matches.is_empty());
        let top = &matches[0];
        assert_eq!(top.song_id, id);
        assert_eq!(top.song_name, "song");
        assert!((top.confidence - 1.0).abs() < 1e-6);
        assert_eq!(top.offset, 0.0);
        assert_eq!(top.match_count, 50);
    }

    #[test]
    fn delta_histogram_recovers_the_shift() {
        let (_dir, mut store) = temp_store();
        // Stored copy sits 12.5 s later than the query times.
        store.add_song("song", "/song", &ramp(40, 12.5)).unwrap();

        let matches = store.find_matches(&ramp(40, 0.0), 0.05).unwrap();
        let top = &matches[0];
        assert!((top.offset - 12.5).abs() <= 0.1 + 1e-6);
        assert!(top.confidence > 0.9);
    }

    #[test]
    fn threshold_filters_weak_alignments() {
        let (_dir, mut store) = temp_store();
        store.add_song("song", "/song", &ramp(10, 0.0)).unwrap();

        // Query shares only two hashes with the store.
        let mut query = ramp(2, 0.0);
        query.extend((0..38).map(|i| fp(0x9000 + i, i as f32)));
        assert!(store.find_matches(&query, 0.5).unwrap().is_empty());
        assert!(!store.find_matches(&query, 0.01).unwrap().is_empty());
    }

    #[test]
    fn empty_query_returns_no_matches() {
        let (_dir, mut store) = temp_store();
        store.add_song("song", "/song", &ramp(5, 0.0)).unwrap();
        assert!(store.find_matches(&[], 0.0).unwrap().is_empty());
    }

    #[test]
    fn clear_resets_the_id_counter() {
        let (_dir, mut store) = temp_store();
        store.add_song("a", "/a", &ramp(5, 0.0)).unwrap();
        store.clear().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!((stats.songs, stats.fingerprints), (0, 0));
        assert_eq!(store.add_song("b", "/b", &ramp(5, 0.0)).unwrap(), 1);
    }

    #[test]
    fn distinct_alignments_stay_distinct() {
        let (_dir, mut store) = temp_store();
        // Same hash stored at two well-separated times: a query hit yields
        // two delta groups for the same song.
        let stored = vec![fp(0xAA, 1.0), fp(0xAA, 21.0)];
        store.add_song("song", "/song", &stored).unwrap();

        let matches = store.find_matches(&[fp(0xAA, 0.0)], 0.0).unwrap();
        assert_eq!(matches.len(), 2);
        let offsets: Vec<f32> = matches.iter().map(|m| m.offset).collect();
        assert!(offsets.contains(&1.0) && offsets.contains(&21.0));
    }
}
