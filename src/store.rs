//! SQLite-backed metadata cache keyed by absolute path.
//!
//! Rows are never duplicated: the path is the primary key. Files that vanish
//! are soft-deleted through the `missing` flag and only removed by
//! [`MetadataStore::purge_missing`].

use std::collections::HashMap;
use std::fs;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Local, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::index::Filters;
use crate::matting::MatDescriptor;
use crate::meta::Extracted;
use crate::tags::ImageAttributes;

/// Schema version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Statements that bring a database from version `i` to `i + 1`.
/// Later entries must only add columns or indexes so cached rows survive.
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS image (
        path TEXT PRIMARY KEY NOT NULL,
        size INTEGER NOT NULL,
        mtime_ns INTEGER NOT NULL,
        extractor_version INTEGER NOT NULL,
        missing INTEGER NOT NULL DEFAULT 0,
        captured_at INTEGER,
        attributes TEXT,
        mat TEXT,
        displayed_count INTEGER NOT NULL DEFAULT 0,
        last_displayed INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_image_captured ON image(captured_at);
    CREATE INDEX IF NOT EXISTS idx_image_missing ON image(missing);
"#];

const RECORD_COLUMNS: &str =
    "path, size, mtime_ns, missing, captured_at, attributes, mat, displayed_count, last_displayed";

/// Size and modification time; a cheap proxy for content change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime_ns: i64,
}

impl Fingerprint {
    pub fn from_metadata(md: &fs::Metadata) -> std::io::Result<Self> {
        let mtime_ns = match md.modified()?.duration_since(UNIX_EPOCH) {
            Ok(since) => i64::try_from(since.as_nanos()).unwrap_or(i64::MAX),
            Err(before) => -i64::try_from(before.duration().as_nanos()).unwrap_or(i64::MAX),
        };
        Ok(Self {
            size: md.len(),
            mtime_ns,
        })
    }

    /// Modification time as local wall-clock time.
    pub fn modified_local(&self) -> Option<NaiveDateTime> {
        let secs = self.mtime_ns.div_euclid(1_000_000_000);
        let nanos = self.mtime_ns.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).map(|utc| utc.with_timezone(&Local).naive_local())
    }
}

/// Identity state of a stored row, as the scanner needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredFingerprint {
    pub fingerprint: Fingerprint,
    pub extractor_version: u32,
    pub missing: bool,
}

/// One cached image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub missing: bool,
    /// EXIF capture time, or the file's modification time when absent.
    pub captured_at: Option<NaiveDateTime>,
    pub attributes: ImageAttributes,
    pub mat: Option<MatDescriptor>,
    pub displayed_count: u64,
    pub last_displayed: Option<NaiveDateTime>,
}

impl ImageRecord {
    /// Stand-in record for the "no images" screen.
    pub fn placeholder(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fingerprint: Fingerprint {
                size: 0,
                mtime_ns: 0,
            },
            missing: false,
            captured_at: None,
            attributes: ImageAttributes::default(),
            mat: None,
            displayed_count: 0,
            last_displayed: None,
        }
    }
}

/// Input to [`MetadataStore::upsert_batch`].
#[derive(Debug, Clone)]
pub struct Upsert {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub extracted: Extracted,
    pub extractor_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Thread-safe handle to the cache database. Clones share one connection.
#[derive(Clone)]
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// Open (or create) the cache file, enabling WAL and applying migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::from_connection(conn)?;
        info!(db = %path.display(), rows = store.count()?, "metadata store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::StorePoisoned)
    }

    pub fn upsert(
        &self,
        path: &Path,
        fingerprint: Fingerprint,
        extracted: &Extracted,
        extractor_version: u32,
    ) -> Result<UpsertOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let outcome = upsert_in(&tx, path, fingerprint, extracted, extractor_version)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Apply several upserts in one transaction.
    pub fn upsert_batch(&self, entries: &[Upsert]) -> Result<Vec<UpsertOutcome>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            outcomes.push(upsert_in(
                &tx,
                &entry.path,
                entry.fingerprint,
                &entry.extracted,
                entry.extractor_version,
            )?);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    /// Identity state of every row, read under one lock.
    pub fn fingerprints(&self) -> Result<HashMap<PathBuf, StoredFingerprint>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT path, size, mtime_ns, extractor_version, missing FROM image")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                PathBuf::from(row.get::<_, String>(0)?),
                StoredFingerprint {
                    fingerprint: Fingerprint {
                        size: row.get::<_, i64>(1)? as u64,
                        mtime_ns: row.get(2)?,
                    },
                    extractor_version: row.get(3)?,
                    missing: row.get(4)?,
                },
            ))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (path, stored) = row?;
            out.insert(path, stored);
        }
        Ok(out)
    }

    /// Soft-delete rows; returns how many were newly marked.
    pub fn mark_missing(&self, paths: &[PathBuf]) -> Result<usize> {
        self.set_missing(paths, true)
    }

    /// Clear the missing flag for files that reappeared unchanged.
    pub fn restore(&self, paths: &[PathBuf]) -> Result<usize> {
        self.set_missing(paths, false)
    }

    fn set_missing(&self, paths: &[PathBuf], missing: bool) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE image SET missing = ?2 WHERE path = ?1 AND missing <> ?2")?;
            for path in paths {
                changed += stmt.execute(params![path_text(path)?, missing])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Hard-delete every soft-deleted row.
    pub fn purge_missing(&self) -> Result<usize> {
        let conn = self.lock()?;
        let purged = conn.execute("DELETE FROM image WHERE missing = 1", [])?;
        if purged > 0 {
            info!(purged, "purged missing images from store");
        }
        Ok(purged)
    }

    /// Present rows matching `filters`, ordered by path.
    pub fn query(&self, filters: &Filters) -> Result<Vec<ImageRecord>> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM image WHERE missing = 0");
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(dir) = &filters.subdirectory {
            let dir = path_text(dir)?.trim_end_matches(MAIN_SEPARATOR);
            let upper = char::from_u32(MAIN_SEPARATOR as u32 + 1).unwrap_or(char::MAX);
            sql.push_str(" AND path >= ? AND path < ?");
            args.push(SqlValue::Text(format!("{dir}{MAIN_SEPARATOR}")));
            args.push(SqlValue::Text(format!("{dir}{upper}")));
        }
        if let Some(from) = filters.date_from {
            sql.push_str(" AND captured_at >= ?");
            args.push(SqlValue::Integer(to_epoch(from)));
        }
        if let Some(to) = filters.date_to {
            sql.push_str(" AND captured_at <= ?");
            args.push(SqlValue::Integer(to_epoch(to)));
        }
        sql.push_str(" ORDER BY path");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), read_record)?;
        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            if filters.tags.is_empty() || record.attributes.has_any_keyword(&filters.tags) {
                out.push(record);
            }
        }
        debug!(matched = out.len(), "store query");
        Ok(out)
    }

    pub fn get(&self, path: &Path) -> Result<Option<ImageRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM image WHERE path = ?1"),
                params![path_text(path)?],
                read_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Bump display statistics for a shown image.
    pub fn record_displayed(&self, path: &Path, at: NaiveDateTime) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE image SET displayed_count = displayed_count + 1, last_displayed = ?2 WHERE path = ?1",
            params![path_text(path)?, to_epoch(at)],
        )?;
        Ok(())
    }

    /// Number of present rows.
    pub fn count(&self) -> Result<usize> {
        self.count_where(false)
    }

    pub fn count_missing(&self) -> Result<usize> {
        self.count_where(true)
    }

    fn count_where(&self, missing: bool) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM image WHERE missing = ?1",
            params![missing],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found == SCHEMA_VERSION {
        return Ok(());
    }
    let tx = conn.transaction()?;
    for (step, sql) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        debug!(to = step + 1, "applying store migration");
        tx.execute_batch(sql)?;
    }
    tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
    tx.commit()?;
    Ok(())
}

fn upsert_in(
    tx: &Transaction<'_>,
    path: &Path,
    fingerprint: Fingerprint,
    extracted: &Extracted,
    extractor_version: u32,
) -> Result<UpsertOutcome> {
    let key = path_text(path)?;
    let existing: Option<(i64, i64, u32, bool)> = tx
        .query_row(
            "SELECT size, mtime_ns, extractor_version, missing FROM image WHERE path = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    if let Some((size, mtime_ns, version, missing)) = existing
        && size as u64 == fingerprint.size
        && mtime_ns == fingerprint.mtime_ns
        && version >= extractor_version
        && !missing
    {
        return Ok(UpsertOutcome::Unchanged);
    }

    let captured_at = extracted
        .attributes
        .capture_time()
        .or_else(|| fingerprint.modified_local())
        .map(to_epoch);
    let attributes = serde_json::to_string(&extracted.attributes)?;
    let mat = extracted.mat.map(|m| serde_json::to_string(&m)).transpose()?;
    let size = i64::try_from(fingerprint.size).unwrap_or(i64::MAX);

    if existing.is_some() {
        tx.execute(
            "UPDATE image SET size = ?2, mtime_ns = ?3, extractor_version = ?4, missing = 0,
                captured_at = ?5, attributes = ?6, mat = ?7
             WHERE path = ?1",
            params![key, size, fingerprint.mtime_ns, extractor_version, captured_at, attributes, mat],
        )?;
        Ok(UpsertOutcome::Updated)
    } else {
        tx.execute(
            "INSERT INTO image (path, size, mtime_ns, extractor_version, missing, captured_at, attributes, mat)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
            params![key, size, fingerprint.mtime_ns, extractor_version, captured_at, attributes, mat],
        )?;
        Ok(UpsertOutcome::Inserted)
    }
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    let path = PathBuf::from(row.get::<_, String>(0)?);
    let attributes = match row.get::<_, Option<String>>(5)? {
        Some(json) => serde_json::from_str(&json).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "unreadable cached attributes");
            ImageAttributes::default()
        }),
        None => ImageAttributes::default(),
    };
    let mat = row
        .get::<_, Option<String>>(6)?
        .and_then(|json| serde_json::from_str(&json).ok());
    Ok(ImageRecord {
        fingerprint: Fingerprint {
            size: row.get::<_, i64>(1)? as u64,
            mtime_ns: row.get(2)?,
        },
        missing: row.get(3)?,
        captured_at: row.get::<_, Option<i64>>(4)?.and_then(from_epoch),
        attributes,
        mat,
        displayed_count: row.get::<_, i64>(7)? as u64,
        last_displayed: row.get::<_, Option<i64>>(8)?.and_then(from_epoch),
        path,
    })
}

fn path_text(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::NonUtf8Path(path.to_path_buf()))
}

/// Wall-clock times are stored as seconds of a UTC-labelled naive timestamp.
fn to_epoch(t: NaiveDateTime) -> i64 {
    t.and_utc().timestamp()
}

fn from_epoch(secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0).map(|utc| utc.naive_utc())
}
