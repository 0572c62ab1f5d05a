use super::models::{CorruptEntry, Job, StoreStats, StoredRow};
use super::{Database, Result};
use crate::compression::CompressionScheme;
use crate::location::{Location, MediaExists};
use crate::waveform::{self, BUCKET_COUNT, MAX_CHANNELS, Waveform};
use rayon::prelude::*;
use rusqlite::{OptionalExtension, params};

impl Database {
    /// Whether a waveform row exists for `location`. Does not validate the row.
    pub fn has_waveform(&self, location: &Location) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT w.file_id FROM files f
                 JOIN waveforms w ON w.file_id = f.id
                 WHERE f.location = ?1 AND f.subsong = ?2",
                params![location.path, location.subsong],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Read and decompress the waveform for `location`.
    ///
    /// Corrupt rows (bad channel map, unknown compression id, blob of the
    /// wrong size) are deleted and reported as a miss. Rows stored with a
    /// scheme other than the current one are re-encoded in place.
    pub fn get_waveform(&self, location: &Location) -> Result<Option<Waveform>> {
        let row = self
            .conn
            .query_row(
                "SELECT f.id, w.channels, w.compression, w.min, w.max, w.rms
                 FROM files f
                 JOIN waveforms w ON w.file_id = f.id
                 WHERE f.location = ?1 AND f.subsong = ?2",
                params![location.path, location.subsong],
                |row| {
                    Ok(StoredRow {
                        file_id: row.get(0)?,
                        channel_map: row.get(1)?,
                        compression: row.get(2)?,
                        min: row.get(3)?,
                        max: row.get(4)?,
                        rms: row.get(5)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        match decode_row(&row) {
            Ok((waveform, scheme)) => {
                if scheme != self.compression {
                    log::debug!(
                        "Re-encoding {} from {} to {}",
                        location,
                        scheme.name(),
                        self.compression.name()
                    );
                    if let Err(e) = self.put_waveform(location, &waveform) {
                        log::warn!("Failed to re-encode {}: {}", location, e);
                    }
                }
                Ok(Some(waveform))
            }
            Err(reason) => {
                log::warn!("Dropping corrupt waveform for {}: {}", location, reason);
                self.conn
                    .execute("DELETE FROM files WHERE id = ?1", params![row.file_id])?;
                Ok(None)
            }
        }
    }

    /// Insert or replace the waveform for `location`, encoded with the
    /// store's current compression scheme.
    pub fn put_waveform(&self, location: &Location, waveform: &Waveform) -> Result<()> {
        let scheme = self.compression;
        let min = scheme.pack(waveform.raw_minimum())?;
        let max = scheme.pack(waveform.raw_maximum())?;
        let rms = scheme.pack(waveform.raw_rms())?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO files (location, subsong) VALUES (?1, ?2)
             ON CONFLICT(location, subsong) DO NOTHING",
            params![location.path, location.subsong],
        )?;
        let file_id: i64 = tx.query_row(
            "SELECT id FROM files WHERE location = ?1 AND subsong = ?2",
            params![location.path, location.subsong],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO waveforms (file_id, channels, compression, min, max, rms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file_id,
                i64::from(waveform.channel_map()),
                scheme.id(),
                min,
                max,
                rms
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete `location` and its waveform. Returns whether anything was removed.
    pub fn remove_waveform(&self, location: &Location) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM files WHERE location = ?1 AND subsong = ?2",
            params![location.path, location.subsong],
        )?;
        Ok(n > 0)
    }

    /// Delete every file row whose media no longer exists. Returns the number removed.
    pub fn remove_dead(&self, media: &dyn MediaExists) -> Result<usize> {
        let files = self.all_files()?;

        let dead: Vec<(i64, Location)> = files
            .into_par_iter()
            .filter(|(_, location)| !media.exists(location))
            .collect();

        if dead.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM files WHERE id = ?1")?;
            for (id, location) in &dead {
                log::debug!("Removing dead entry {}", location);
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(dead.len())
    }

    /// Reclaim free pages. Never required for correctness.
    pub fn compact(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Every location that has a stored waveform.
    pub fn get_all(&self) -> Result<Vec<Location>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.location, f.subsong FROM files f
             JOIN waveforms w ON w.file_id = f.id
             ORDER BY f.id",
        )?;
        let locations = stmt
            .query_map([], |row| Ok(Location::new(row.get::<_, String>(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(locations)
    }

    fn all_files(&self) -> Result<Vec<(i64, Location)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, location, subsong FROM files ORDER BY id")?;
        let files = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, Location::new(row.get::<_, String>(1)?, row.get(2)?)))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Jobs persisted by the last shutdown, in submission order.
    pub fn get_jobs(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare("SELECT location, subsong, user_submitted FROM jobs ORDER BY id")?;
        let jobs = stmt
            .query_map([], |row| {
                Ok(Job {
                    location: Location::new(row.get::<_, String>(0)?, row.get(1)?),
                    user_submitted: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Replace the whole job table with `jobs`.
    pub fn put_jobs(&self, jobs: &[Job]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM jobs", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO jobs (location, subsong, user_submitted) VALUES (?1, ?2, ?3)",
            )?;
            for job in jobs {
                stmt.execute(params![
                    job.location.path,
                    job.location.subsong,
                    job.user_submitted
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear_jobs(&self) -> Result<()> {
        self.conn.execute("DELETE FROM jobs", [])?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |r| r.get(0))?) };

        let mut stmt = self.conn.prepare(
            "SELECT compression, COUNT(*) FROM waveforms GROUP BY compression ORDER BY compression",
        )?;
        let by_compression = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(StoreStats {
            files: count("SELECT COUNT(*) FROM files")?,
            waveforms: count("SELECT COUNT(*) FROM waveforms")?,
            jobs: count("SELECT COUNT(*) FROM jobs")?,
            blob_bytes: count(
                "SELECT COALESCE(SUM(length(min) + length(max) + length(rms)), 0) FROM waveforms",
            )?,
            by_compression,
        })
    }
}

/// Validate and decompress a stored row.
fn decode_row(row: &StoredRow) -> std::result::Result<(Waveform, CompressionScheme), CorruptEntry> {
    let channel_map = u32::try_from(row.channel_map)
        .ok()
        .filter(|&m| m != 0 && m & !waveform::speakers::ALL == 0)
        .ok_or(CorruptEntry::ChannelMap(row.channel_map))?;
    let channels = waveform::channel_count(channel_map);
    if channels > MAX_CHANNELS {
        return Err(CorruptEntry::ChannelMap(row.channel_map));
    }

    let scheme = CompressionScheme::from_id(row.compression)?;
    let samples = channels * BUCKET_COUNT;
    let unpack = |column: &'static str, blob: &[u8]| {
        scheme
            .unpack(blob, samples)
            .map_err(|source| CorruptEntry::Blob { column, source })
    };

    let min = unpack("min", &row.min)?;
    let max = unpack("max", &row.max)?;
    let rms = unpack("rms", &row.rms)?;

    let waveform = Waveform::new(channel_map, min, max, rms, BUCKET_COUNT)
        .map_err(|_| CorruptEntry::ChannelMap(row.channel_map))?;
    Ok((waveform, scheme))
}
