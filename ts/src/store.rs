//! StageStore - SQLite-backed tile state for one pipeline stage

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::StoreError;
use crate::tile::{InProcessRecord, PlaneTileStatus, StatusCounts, TileRecord, TileStatus, ToProcessRecord};
use crate::DEFAULT_BATCH_SIZE;

/// Deterministic database file name for a stage, so a restart reopens the
/// same store.
pub fn database_name_for_stage(stage_id: &str) -> String {
    format!("tilestore-{stage_id}.db")
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

/// Durable per-stage record of tile progress.
///
/// Opening is idempotent: the schema is ensured on every open, so calling
/// it on every scheduler start is safe.
pub struct StageStore {
    conn: Connection,
    batch_size: usize,
    path: PathBuf,
}

impl StageStore {
    /// Open (or create) the store for `stage_id` under `stage_path`.
    pub fn open(stage_path: &Path, stage_id: &str) -> Result<Self, StoreError> {
        Self::open_with_batch_size(stage_path, stage_id, DEFAULT_BATCH_SIZE)
    }

    /// Open with an explicit batch size for chunked writes.
    pub fn open_with_batch_size(stage_path: &Path, stage_id: &str, batch_size: usize) -> Result<Self, StoreError> {
        if batch_size == 0 {
            return Err(StoreError::InvalidBatchSize);
        }

        std::fs::create_dir_all(stage_path)?;
        let path = stage_path.join(database_name_for_stage(stage_id));
        let conn = Connection::open(&path)?;

        let store = Self { conn, batch_size, path };
        store.ensure_schema()?;

        debug!(path = %store.path.display(), "opened stage store");
        Ok(store)
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tile_status (
                relative_path     TEXT PRIMARY KEY,
                tile_name         TEXT NOT NULL,
                prev_stage_status INTEGER NOT NULL,
                this_stage_status INTEGER NOT NULL,
                x INTEGER, y INTEGER, z INTEGER,
                lat_x INTEGER, lat_y INTEGER, lat_z INTEGER,
                cut_offset REAL, z_offset REAL, delta_z REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS in_process (
                relative_path     TEXT PRIMARY KEY,
                tile_name         TEXT NOT NULL,
                worker_id         TEXT NOT NULL,
                worker_last_seen  TEXT NOT NULL,
                task_execution_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS to_process (
                relative_path TEXT PRIMARY KEY,
                tile_name     TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // --- tile_status -------------------------------------------------------

    /// All status records, in relative-path order.
    pub fn list_status(&self) -> Result<Vec<TileRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT relative_path, tile_name, prev_stage_status, this_stage_status,
                    x, y, z, lat_x, lat_y, lat_z, cut_offset, z_offset, delta_z,
                    created_at, updated_at
             FROM tile_status ORDER BY relative_path",
        )?;
        let rows = stmt.query_map([], row_to_tile)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Single status record by tile key.
    pub fn status_for(&self, relative_path: &str) -> Result<Option<TileRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT relative_path, tile_name, prev_stage_status, this_stage_status,
                    x, y, z, lat_x, lat_y, lat_z, cut_offset, z_offset, delta_z,
                    created_at, updated_at
             FROM tile_status WHERE relative_path = ?1",
        )?;
        let record = stmt.query_row(params![relative_path], row_to_tile).optional()?;
        record.transpose()
    }

    /// Insert brand-new status records, chunked to the batch size.
    pub fn insert_status(&mut self, records: &[TileRecord]) -> Result<(), StoreError> {
        for chunk in records.chunks(self.batch_size) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO tile_status
                        (relative_path, tile_name, prev_stage_status, this_stage_status,
                         x, y, z, lat_x, lat_y, lat_z, cut_offset, z_offset, delta_z,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )?;
                for rec in chunk {
                    stmt.execute(params![
                        rec.relative_path,
                        rec.tile_name,
                        rec.prev_stage_status.as_i64(),
                        rec.this_stage_status.as_i64(),
                        rec.x,
                        rec.y,
                        rec.z,
                        rec.lat_x,
                        rec.lat_y,
                        rec.lat_z,
                        rec.cut_offset,
                        rec.z_offset,
                        rec.delta_z,
                        rec.created_at.to_rfc3339(),
                        rec.updated_at.to_rfc3339(),
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Update only `prev_stage_status` (and the updated timestamp) for the
    /// given tile keys. Spatial fields are never re-copied after creation.
    pub fn update_prev_status(&mut self, updates: &[(String, TileStatus)]) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        for chunk in updates.chunks(self.batch_size) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE tile_status SET prev_stage_status = ?2, updated_at = ?3 WHERE relative_path = ?1",
                )?;
                for (relative_path, status) in chunk {
                    stmt.execute(params![relative_path, status.as_i64(), now])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Set `this_stage_status` for one tile.
    pub fn set_this_status(&self, relative_path: &str, status: TileStatus) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tile_status SET this_stage_status = ?2, updated_at = ?3 WHERE relative_path = ?1",
            params![relative_path, status.as_i64(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Flip `this_stage_status` to Queued for the given tile keys, chunked.
    pub fn mark_queued(&mut self, relative_paths: &[String]) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        for chunk in relative_paths.chunks(self.batch_size) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE tile_status SET this_stage_status = ?2, updated_at = ?3 WHERE relative_path = ?1",
                )?;
                for relative_path in chunk {
                    stmt.execute(params![relative_path, TileStatus::Queued.as_i64(), now])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Tiles eligible for the to-process queue: upstream complete, not yet
    /// started here.
    pub fn eligible_for_queue(&self) -> Result<Vec<TileRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT relative_path, tile_name, prev_stage_status, this_stage_status,
                    x, y, z, lat_x, lat_y, lat_z, cut_offset, z_offset, delta_z,
                    created_at, updated_at
             FROM tile_status
             WHERE prev_stage_status = ?1 AND this_stage_status = ?2
             ORDER BY relative_path",
        )?;
        let rows = stmt.query_map(
            params![TileStatus::Complete.as_i64(), TileStatus::Incomplete.as_i64()],
            row_to_tile,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Raw per-status counts from the status table.
    pub fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT this_stage_status, COUNT(relative_path) FROM tile_status GROUP BY this_stage_status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as u64;
            match TileStatus::from_i64(status)? {
                TileStatus::Incomplete => counts.incomplete = count,
                TileStatus::Queued => counts.queued = count,
                TileStatus::Processing => counts.processing = count,
                TileStatus::Complete => counts.complete = count,
                TileStatus::Failed => counts.failed = count,
                TileStatus::Canceled => counts.canceled = count,
            }
        }
        Ok(counts)
    }

    /// Tile status restricted to one z-plane, keyed for the hub's
    /// cross-stage merge.
    pub fn plane_status(&self, plane: i64) -> Result<Vec<PlaneTileStatus>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT relative_path, lat_x, lat_y, this_stage_status
             FROM tile_status
             WHERE lat_z = ?1 AND lat_x IS NOT NULL AND lat_y IS NOT NULL
             ORDER BY relative_path",
        )?;
        let rows = stmt.query_map(params![plane], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut tiles = Vec::new();
        for row in rows {
            let (relative_path, lat_x, lat_y, status) = row?;
            tiles.push(PlaneTileStatus {
                relative_path,
                lat_x,
                lat_y,
                this_stage_status: TileStatus::from_i64(status)?,
            });
        }
        Ok(tiles)
    }

    // --- in_process --------------------------------------------------------

    pub fn list_in_process(&self) -> Result<Vec<InProcessRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT relative_path, tile_name, worker_id, worker_last_seen, task_execution_id,
                    created_at, updated_at
             FROM in_process ORDER BY relative_path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (relative_path, tile_name, worker_id, last_seen, task_execution_id, created_at, updated_at) = row?;
            records.push(InProcessRecord {
                relative_path,
                tile_name,
                worker_id,
                worker_last_seen: parse_timestamp(&last_seen)?,
                task_execution_id,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }
        Ok(records)
    }

    pub fn insert_in_process(&self, record: &InProcessRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO in_process
                (relative_path, tile_name, worker_id, worker_last_seen, task_execution_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.relative_path,
                record.tile_name,
                record.worker_id,
                record.worker_last_seen.to_rfc3339(),
                record.task_execution_id,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Refresh `worker_last_seen` for a still-running remote task.
    pub fn touch_in_process(&self, relative_path: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE in_process SET worker_last_seen = ?2, updated_at = ?2 WHERE relative_path = ?1",
            params![relative_path, now],
        )?;
        Ok(())
    }

    pub fn delete_in_process(&self, relative_path: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM in_process WHERE relative_path = ?1", params![relative_path])?;
        Ok(())
    }

    pub fn count_in_process(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(relative_path) FROM in_process", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // --- to_process --------------------------------------------------------

    /// Queued backlog in insertion (rowid) order - dispatch drains in this
    /// order.
    pub fn list_to_process(&self) -> Result<Vec<ToProcessRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT relative_path, tile_name, created_at, updated_at FROM to_process ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (relative_path, tile_name, created_at, updated_at) = row?;
            records.push(ToProcessRecord {
                relative_path,
                tile_name,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }
        Ok(records)
    }

    pub fn insert_to_process(&mut self, records: &[ToProcessRecord]) -> Result<(), StoreError> {
        for chunk in records.chunks(self.batch_size) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO to_process (relative_path, tile_name, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for rec in chunk {
                    stmt.execute(params![
                        rec.relative_path,
                        rec.tile_name,
                        rec.created_at.to_rfc3339(),
                        rec.updated_at.to_rfc3339(),
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    pub fn delete_to_process(&self, relative_path: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM to_process WHERE relative_path = ?1", params![relative_path])?;
        Ok(())
    }

    pub fn count_to_process(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(relative_path) FROM to_process", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

type TileRow = Result<TileRecord, StoreError>;

fn row_to_tile(row: &rusqlite::Row<'_>) -> rusqlite::Result<TileRow> {
    let prev: i64 = row.get(2)?;
    let this: i64 = row.get(3)?;
    let created: String = row.get(13)?;
    let updated: String = row.get(14)?;

    Ok(build_tile(row, prev, this, created, updated))
}

fn build_tile(row: &rusqlite::Row<'_>, prev: i64, this: i64, created: String, updated: String) -> TileRow {
    Ok(TileRecord {
        relative_path: row.get(0).map_err(StoreError::from)?,
        tile_name: row.get(1).map_err(StoreError::from)?,
        prev_stage_status: TileStatus::from_i64(prev)?,
        this_stage_status: TileStatus::from_i64(this)?,
        x: row.get(4).map_err(StoreError::from)?,
        y: row.get(5).map_err(StoreError::from)?,
        z: row.get(6).map_err(StoreError::from)?,
        lat_x: row.get(7).map_err(StoreError::from)?,
        lat_y: row.get(8).map_err(StoreError::from)?,
        lat_z: row.get(9).map_err(StoreError::from)?,
        cut_offset: row.get(10).map_err(StoreError::from)?,
        z_offset: row.get(11).map_err(StoreError::from)?,
        delta_z: row.get(12).map_err(StoreError::from)?,
        created_at: parse_timestamp(&created)?,
        updated_at: parse_timestamp(&updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tile(path: &str, prev: TileStatus, this: TileStatus) -> TileRecord {
        let now = Utc::now();
        TileRecord {
            relative_path: path.to_string(),
            tile_name: path.replace('/', "_"),
            prev_stage_status: prev,
            this_stage_status: this,
            x: Some(1),
            y: Some(2),
            z: Some(3),
            lat_x: Some(10),
            lat_y: Some(20),
            lat_z: Some(3),
            cut_offset: Some(0.5),
            z_offset: Some(1.5),
            delta_z: Some(0.25),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_open_is_idempotent() {
        let temp = TempDir::new().unwrap();

        let mut store = StageStore::open(temp.path(), "stage-1").unwrap();
        store
            .insert_status(&[tile("a/1", TileStatus::Complete, TileStatus::Incomplete)])
            .unwrap();
        drop(store);

        // Reopen against the same file; schema bootstrap must not clobber data
        let store = StageStore::open(temp.path(), "stage-1").unwrap();
        assert_eq!(store.list_status().unwrap().len(), 1);
    }

    #[test]
    fn test_database_name_is_deterministic() {
        assert_eq!(database_name_for_stage("abc"), "tilestore-abc.db");

        let temp = TempDir::new().unwrap();
        let store = StageStore::open(temp.path(), "abc").unwrap();
        assert!(store.path().ends_with("tilestore-abc.db"));
    }

    #[test]
    fn test_insert_and_update_prev_status() {
        let temp = TempDir::new().unwrap();
        let mut store = StageStore::open(temp.path(), "s").unwrap();

        store
            .insert_status(&[tile("a/1", TileStatus::Incomplete, TileStatus::Incomplete)])
            .unwrap();
        store
            .update_prev_status(&[("a/1".to_string(), TileStatus::Complete)])
            .unwrap();

        let rec = store.status_for("a/1").unwrap().unwrap();
        assert_eq!(rec.prev_stage_status, TileStatus::Complete);
        assert_eq!(rec.this_stage_status, TileStatus::Incomplete);
        // spatial fields untouched
        assert_eq!(rec.lat_x, Some(10));
    }

    #[test]
    fn test_batched_writes_preserve_all_rows() {
        let temp = TempDir::new().unwrap();
        // Batch size 2 against 5 rows forces chunk boundaries
        let mut store = StageStore::open_with_batch_size(temp.path(), "s", 2).unwrap();

        let records: Vec<_> = (0..5)
            .map(|i| tile(&format!("a/{i}"), TileStatus::Complete, TileStatus::Incomplete))
            .collect();
        store.insert_status(&records).unwrap();

        assert_eq!(store.list_status().unwrap().len(), 5);

        let paths: Vec<String> = records.iter().map(|r| r.relative_path.clone()).collect();
        store.mark_queued(&paths).unwrap();
        assert_eq!(store.status_counts().unwrap().queued, 5);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            StageStore::open_with_batch_size(temp.path(), "s", 0),
            Err(StoreError::InvalidBatchSize)
        ));
    }

    #[test]
    fn test_eligible_for_queue_filter() {
        let temp = TempDir::new().unwrap();
        let mut store = StageStore::open(temp.path(), "s").unwrap();

        store
            .insert_status(&[
                tile("a/1", TileStatus::Complete, TileStatus::Incomplete),
                tile("a/2", TileStatus::Incomplete, TileStatus::Incomplete),
                tile("a/3", TileStatus::Complete, TileStatus::Complete),
                tile("a/4", TileStatus::Complete, TileStatus::Failed),
            ])
            .unwrap();

        let eligible = store.eligible_for_queue().unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].relative_path, "a/1");
    }

    #[test]
    fn test_in_process_lifecycle() {
        let temp = TempDir::new().unwrap();
        let store = StageStore::open(temp.path(), "s").unwrap();
        let now = Utc::now();

        store
            .insert_in_process(&InProcessRecord {
                relative_path: "a/1".to_string(),
                tile_name: "a_1".to_string(),
                worker_id: "w1".to_string(),
                worker_last_seen: now,
                task_execution_id: "exec-1".to_string(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        assert_eq!(store.count_in_process().unwrap(), 1);
        let listed = store.list_in_process().unwrap();
        assert_eq!(listed[0].worker_id, "w1");
        assert_eq!(listed[0].task_execution_id, "exec-1");

        store.touch_in_process("a/1").unwrap();
        store.delete_in_process("a/1").unwrap();
        assert_eq!(store.count_in_process().unwrap(), 0);
    }

    #[test]
    fn test_to_process_insertion_order() {
        let temp = TempDir::new().unwrap();
        let mut store = StageStore::open(temp.path(), "s").unwrap();
        let now = Utc::now();

        // Alphabetically out of order on purpose; dispatch order is insertion order
        for path in ["c/1", "a/1", "b/1"] {
            store
                .insert_to_process(&[ToProcessRecord {
                    relative_path: path.to_string(),
                    tile_name: path.to_string(),
                    created_at: now,
                    updated_at: now,
                }])
                .unwrap();
        }

        let listed = store.list_to_process().unwrap();
        let order: Vec<&str> = listed.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(order, vec!["c/1", "a/1", "b/1"]);

        store.delete_to_process("a/1").unwrap();
        assert_eq!(store.count_to_process().unwrap(), 2);
    }

    #[test]
    fn test_plane_status_filters_on_lat_z() {
        let temp = TempDir::new().unwrap();
        let mut store = StageStore::open(temp.path(), "s").unwrap();

        let mut other_plane = tile("b/1", TileStatus::Complete, TileStatus::Complete);
        other_plane.lat_z = Some(99);

        store
            .insert_status(&[tile("a/1", TileStatus::Complete, TileStatus::Queued), other_plane])
            .unwrap();

        let tiles = store.plane_status(3).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].relative_path, "a/1");
        assert_eq!(tiles[0].lat_x, 10);
        assert_eq!(tiles[0].this_stage_status, TileStatus::Queued);
    }

    #[test]
    fn test_status_counts_group_by() {
        let temp = TempDir::new().unwrap();
        let mut store = StageStore::open(temp.path(), "s").unwrap();

        store
            .insert_status(&[
                tile("a/1", TileStatus::Complete, TileStatus::Incomplete),
                tile("a/2", TileStatus::Complete, TileStatus::Queued),
                tile("a/3", TileStatus::Complete, TileStatus::Queued),
                tile("a/4", TileStatus::Complete, TileStatus::Complete),
                tile("a/5", TileStatus::Complete, TileStatus::Failed),
            ])
            .unwrap();

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.incomplete, 1);
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.complete, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.processing, 0);
    }
}
