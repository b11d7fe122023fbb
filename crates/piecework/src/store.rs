//! Persistent record of produced pieces.
//!
//! One row per slice in `piece_manifests`, keyed by payload cid. Rows move
//! through `pending -> processing -> completed | failed` (or straight from
//! `pending` to `failed`). Deletes are soft: the row stays in the table with
//! `deleted_at` set and is invisible to every query.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS piece_manifests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload_cid TEXT NOT NULL,
    filename TEXT NOT NULL,
    piece_cid TEXT NOT NULL,
    payload_size INTEGER NOT NULL CHECK (payload_size > 0),
    piece_size INTEGER NOT NULL CHECK (piece_size > 0),
    detail TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    deleted_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_payload_cid ON piece_manifests(payload_cid) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_piece_cid ON piece_manifests(piece_cid);
CREATE INDEX IF NOT EXISTS idx_status ON piece_manifests(status);
CREATE INDEX IF NOT EXISTS idx_deleted_at ON piece_manifests(deleted_at);
"#;

const COLUMNS: &str =
    "id, payload_cid, filename, piece_cid, payload_size, piece_size, detail, status, created_at, updated_at";

/// Default rows per transaction in [`MetadataStore::batch_create`].
pub const DEFAULT_BATCH_SIZE: usize = 100;

const MAX_FILENAME_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate payload_cid: {0}")]
    Duplicate(String),

    #[error("piece manifest {0} not found")]
    NotFound(i64),

    #[error("cannot move piece manifest {id} from {from} to {to}")]
    InvalidTransition { id: i64, from: Status, to: Status },

    #[error("unknown status {0:?}")]
    UnknownStatus(String),
}

/// Processing state of a recorded piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Processing)
                | (Status::Pending, Status::Failed)
                | (Status::Processing, Status::Completed)
                | (Status::Processing, Status::Failed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Fields supplied when recording a piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPieceManifest {
    pub payload_cid: String,
    pub filename: String,
    pub piece_cid: String,
    pub payload_size: i64,
    pub piece_size: i64,
    pub detail: String,
    pub status: Status,
}

impl NewPieceManifest {
    fn validate(&self) -> Result<(), StoreError> {
        if self.payload_cid.is_empty() || self.filename.is_empty() || self.piece_cid.is_empty() {
            return Err(StoreError::Validation("required fields missing".to_string()));
        }
        let alphanumeric = |s: &str| s.chars().all(|c| c.is_ascii_alphanumeric());
        if !alphanumeric(&self.payload_cid) || !alphanumeric(&self.piece_cid) {
            return Err(StoreError::Validation("cids must be alphanumeric".to_string()));
        }
        if self.filename.len() > MAX_FILENAME_LEN {
            return Err(StoreError::Validation(format!(
                "filename longer than {MAX_FILENAME_LEN} bytes"
            )));
        }
        if self.payload_size <= 0 || self.piece_size <= 0 {
            return Err(StoreError::Validation("sizes must be positive".to_string()));
        }
        Ok(())
    }
}

/// A stored piece record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceManifest {
    pub id: i64,
    pub payload_cid: String,
    pub filename: String,
    pub piece_cid: String,
    pub payload_size: i64,
    pub piece_size: i64,
    pub detail: String,
    pub status: Status,
    pub created_at: String,
    pub updated_at: String,
}

impl PieceManifest {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(7)?;
        let status: Status = status.parse().map_err(|e: StoreError| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Self {
            id: row.get(0)?,
            payload_cid: row.get(1)?,
            filename: row.get(2)?,
            piece_cid: row.get(3)?,
            payload_size: row.get(4)?,
            piece_size: row.get(5)?,
            detail: row.get(6)?,
            status,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

/// Counts per status plus the overall total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusStats {
    pub by_status: BTreeMap<Status, u64>,
    pub total: u64,
}

/// SQLite-backed store with connection-per-call for concurrent access.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.conn()?.execute_batch(SCHEMA)?;
        Ok(store)
    }

    /// A fresh database in the temp directory, unique per call.
    pub fn in_memory() -> Result<Self, StoreError> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let db_name = format!("piecework_{}_{}.db", std::process::id(), unique_id);
        let path = std::env::temp_dir().join(db_name);
        // Left over from an earlier process with the same pid
        let _ = std::fs::remove_file(&path);
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        Ok(conn)
    }

    fn insert(conn: &Connection, manifest: &NewPieceManifest) -> Result<i64, StoreError> {
        manifest.validate()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM piece_manifests WHERE payload_cid = ?1 AND deleted_at IS NULL)",
            params![manifest.payload_cid],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::Duplicate(manifest.payload_cid.clone()));
        }
        conn.execute(
            "INSERT INTO piece_manifests (payload_cid, filename, piece_cid, payload_size, piece_size, detail, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                manifest.payload_cid,
                manifest.filename,
                manifest.piece_cid,
                manifest.payload_size,
                manifest.piece_size,
                manifest.detail,
                manifest.status.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record a piece after validating it.
    pub fn create(&self, manifest: &NewPieceManifest) -> Result<PieceManifest, StoreError> {
        let conn = self.conn()?;
        let id = Self::insert(&conn, manifest)?;
        self.get(id)?.ok_or(StoreError::NotFound(id))
    }

    pub fn get(&self, id: i64) -> Result<Option<PieceManifest>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {COLUMNS} FROM piece_manifests WHERE id = ?1 AND deleted_at IS NULL");
        Ok(conn.query_row(&sql, params![id], PieceManifest::from_row).optional()?)
    }

    pub fn get_by_payload_cid(&self, payload_cid: &str) -> Result<Option<PieceManifest>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {COLUMNS} FROM piece_manifests WHERE payload_cid = ?1 AND deleted_at IS NULL");
        Ok(conn
            .query_row(&sql, params![payload_cid], PieceManifest::from_row)
            .optional()?)
    }

    /// Every record sharing a piece cid.
    pub fn get_by_piece_cid(&self, piece_cid: &str) -> Result<Vec<PieceManifest>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM piece_manifests WHERE piece_cid = ?1 AND deleted_at IS NULL ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![piece_cid], PieceManifest::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// One page of records, newest first, and the total matching count.
    pub fn list(
        &self,
        offset: u64,
        limit: u64,
        status: Option<Status>,
    ) -> Result<(Vec<PieceManifest>, u64), StoreError> {
        let conn = self.conn()?;
        let status = status.map(|s| s.as_str());
        let filter = "deleted_at IS NULL AND (?1 IS NULL OR status = ?1)";

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM piece_manifests WHERE {filter}"),
            params![status],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {COLUMNS} FROM piece_manifests WHERE {filter} ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![status, limit as i64, offset as i64],
            PieceManifest::from_row,
        )?;
        Ok((rows.collect::<Result<Vec<_>, _>>()?, total as u64))
    }

    /// Move a record to `next`, rejecting transitions outside the lifecycle.
    pub fn update_status(&self, id: i64, next: Status) -> Result<PieceManifest, StoreError> {
        let current = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        if !current.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: next,
            });
        }

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE piece_manifests SET status = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND status = ?3 AND deleted_at IS NULL",
            params![next.as_str(), id, current.status.as_str()],
        )?;
        if changed == 0 {
            // Raced with another writer
            let now = self.get(id)?.ok_or(StoreError::NotFound(id))?;
            return Err(StoreError::InvalidTransition {
                id,
                from: now.status,
                to: next,
            });
        }
        self.get(id)?.ok_or(StoreError::NotFound(id))
    }

    /// Soft delete.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE piece_manifests SET deleted_at = datetime('now') WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Insert many records, `batch_size` per transaction (0 means the
    /// default). A failing record rolls back its whole batch; earlier batches
    /// stay committed.
    pub fn batch_create(&self, manifests: &[NewPieceManifest], batch_size: usize) -> Result<usize, StoreError> {
        let batch_size = if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size };
        let mut conn = self.conn()?;
        let mut inserted = 0;
        for batch in manifests.chunks(batch_size) {
            let tx = conn.transaction()?;
            for manifest in batch {
                Self::insert(&tx, manifest)?;
            }
            tx.commit()?;
            inserted += batch.len();
        }
        Ok(inserted)
    }

    pub fn stats_by_status(&self) -> Result<StatusStats, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM piece_manifests WHERE deleted_at IS NULL GROUP BY status",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = StatusStats::default();
        for row in rows {
            let (status, count) = row?;
            stats.by_status.insert(status.parse()?, count as u64);
            stats.total += count as u64;
        }
        Ok(stats)
    }
}
