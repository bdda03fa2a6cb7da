//! Local store for sonalog.
//!
//! A small key-value store over `SQLite`. Data lives in named buckets, each
//! holding a JSON array of one record type. Callers read a whole bucket,
//! modify it, and write it back; every write replaces the bucket wholesale
//! and is durable when `put` returns.

pub mod migrations;
pub mod schema;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A named storage bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Emergency supply inventory.
    Inventory,
    /// User-added emergency contacts.
    Contacts,
    /// This device's identity.
    Device,
    /// Family sharing settings and the last known location.
    Session,
}

impl Bucket {
    /// Every bucket, in display order.
    pub const ALL: [Bucket; 4] = [
        Bucket::Inventory,
        Bucket::Contacts,
        Bucket::Device,
        Bucket::Session,
    ];

    /// The key under which this bucket is stored.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Inventory => "inventory",
            Self::Contacts => "contacts",
            Self::Device => "device",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A record type that lives in exactly one bucket.
///
/// Every read decodes and validates each record; a record that fails either
/// step makes the whole read fail with [`Error::MalformedInput`].
pub trait BucketRecord: Serialize + DeserializeOwned {
    /// The bucket holding records of this type.
    const BUCKET: Bucket;

    /// Unique key of this record within its bucket, if the bucket is keyed.
    fn key(&self) -> Option<&str> {
        None
    }

    /// Check the record's invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first violated invariant.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Check a batch of records the way [`Storage::put`] does.
///
/// # Errors
///
/// Returns the first validation failure, or [`Error::Validation`] for a
/// duplicated key.
pub fn validate_records<R: BucketRecord>(records: &[R]) -> Result<()> {
    let mut seen = HashSet::new();
    for record in records {
        record.validate()?;
        if let Some(key) = record.key() {
            if !seen.insert(key) {
                return Err(Error::validation(
                    "id",
                    format!("duplicate id '{key}' in bucket '{}'", R::BUCKET),
                ));
            }
        }
    }
    Ok(())
}

/// Persistent bucket store.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
    /// Maximum total payload size in bytes; 0 means unlimited.
    quota_bytes: u64,
}

impl Storage {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening local store at {}", path.display());
        let mut conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // Every put must be on disk before it returns
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        migrations::initialize_schema(&mut conn)?;

        info!("Local store opened at {}", path.display());
        Ok(Self {
            path,
            conn,
            quota_bytes: 0,
        })
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&mut conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
            quota_bytes: 0,
        })
    }

    /// Limit the total payload size; 0 removes the limit.
    #[must_use]
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the configured quota in bytes (0 is unlimited).
    #[must_use]
    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// Read every record in the bucket for `R`.
    ///
    /// An absent bucket reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the stored payload or any record
    /// in it fails to decode or validate, or a database error.
    pub fn get<R: BucketRecord>(&self) -> Result<Vec<R>> {
        let Some(payload) = self.read_payload(R::BUCKET)? else {
            return Ok(Vec::new());
        };
        decode_bucket(R::BUCKET, &payload)
    }

    /// Replace the bucket for `R` with `records`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an invalid record or duplicate key,
    /// [`Error::QuotaExceeded`] if the write would exceed the quota or the
    /// disk is full, or a database error.
    pub fn put<R: BucketRecord>(&self, records: &[R]) -> Result<()> {
        validate_records(records)?;
        let payload = serde_json::to_string(records)?;
        self.write_payload(R::BUCKET, &payload, records.len())
    }

    /// Read the single record of a one-record bucket.
    ///
    /// # Errors
    ///
    /// Same as [`Storage::get`].
    pub fn get_one<R: BucketRecord>(&self) -> Result<Option<R>> {
        Ok(self.get::<R>()?.into_iter().next())
    }

    /// Store `record` as the only record of its bucket.
    ///
    /// # Errors
    ///
    /// Same as [`Storage::put`].
    pub fn put_one<R: BucketRecord>(&self, record: &R) -> Result<()> {
        self.put(std::slice::from_ref(record))
    }

    /// Remove a bucket entirely.
    ///
    /// Returns `true` if the bucket existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear(&self, bucket: Bucket) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM buckets WHERE name = ?1", [bucket.name()])?;
        if affected > 0 {
            info!(bucket = %bucket, "Cleared bucket");
        }
        Ok(affected > 0)
    }

    /// Get per-bucket statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let mut buckets = Vec::with_capacity(Bucket::ALL.len());
        let mut payload_bytes = 0;
        let mut last_updated: Option<DateTime<Utc>> = None;

        for bucket in Bucket::ALL {
            let row: Option<(i64, i64, String)> = self
                .conn
                .query_row(
                    "SELECT record_count, LENGTH(payload), updated_at FROM buckets WHERE name = ?1",
                    [bucket.name()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let records = match row {
                Some((count, bytes, updated_at)) => {
                    payload_bytes += u64::try_from(bytes).unwrap_or(0);
                    if let Ok(ts) = DateTime::parse_from_rfc3339(&updated_at) {
                        let ts = ts.with_timezone(&Utc);
                        last_updated = Some(last_updated.map_or(ts, |prev| prev.max(ts)));
                    }
                    usize::try_from(count).unwrap_or(0)
                }
                None => 0,
            };
            buckets.push(BucketStats { bucket, records });
        }

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            buckets,
            payload_bytes,
            last_updated,
            db_size_bytes,
        })
    }

    fn read_payload(&self, bucket: Bucket) -> Result<Option<String>> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload FROM buckets WHERE name = ?1",
                [bucket.name()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    /// Check that replacing each listed bucket with a payload of the given
    /// size stays within the quota.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExceeded`] if the replacements together would not
    /// fit, or a database error.
    pub fn ensure_fits(&self, replacements: &[(Bucket, u64)]) -> Result<()> {
        if self.quota_bytes == 0 {
            return Ok(());
        }

        let mut stmt = self
            .conn
            .prepare("SELECT name, LENGTH(payload) FROM buckets")?;
        let stored = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut needed: u64 = replacements.iter().map(|(_, bytes)| bytes).sum();
        for row in stored {
            let (name, bytes) = row?;
            if !replacements.iter().any(|(bucket, _)| bucket.name() == name) {
                needed += u64::try_from(bytes).unwrap_or(0);
            }
        }

        if needed > self.quota_bytes {
            warn!(needed, quota = self.quota_bytes, "Write rejected by quota");
            return Err(Error::QuotaExceeded {
                needed,
                quota: self.quota_bytes,
            });
        }
        Ok(())
    }

    fn write_payload(&self, bucket: Bucket, payload: &str, records: usize) -> Result<()> {
        let new_bytes = payload.len() as u64;
        self.ensure_fits(&[(bucket, new_bytes)])?;

        let record_count = i64::try_from(records).unwrap_or(i64::MAX);
        self.conn
            .execute(
                r"
                INSERT INTO buckets (name, payload, record_count, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(name) DO UPDATE SET
                    payload = excluded.payload,
                    record_count = excluded.record_count,
                    updated_at = excluded.updated_at
                ",
                params![bucket.name(), payload, record_count, Utc::now().to_rfc3339()],
            )
            .map_err(|err| map_disk_full(err, new_bytes))?;

        debug!(bucket = %bucket, records, bytes = new_bytes, "Wrote bucket");
        Ok(())
    }
}

/// Decode and validate a stored bucket payload.
fn decode_bucket<R: BucketRecord>(bucket: Bucket, payload: &str) -> Result<Vec<R>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(payload)
        .map_err(|e| Error::malformed(format!("bucket '{bucket}'"), e.to_string()))?;

    let records = values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let record: R = serde_json::from_value(value).map_err(|e| {
                Error::malformed(format!("bucket '{bucket}' record {index}"), e.to_string())
            })?;
            record.validate().map_err(|e| {
                Error::malformed(format!("bucket '{bucket}' record {index}"), e.to_string())
            })?;
            Ok(record)
        })
        .collect::<Result<Vec<R>>>()?;

    validate_records(&records)
        .map_err(|e| Error::malformed(format!("bucket '{bucket}'"), e.to_string()))?;
    Ok(records)
}

fn map_disk_full(err: rusqlite::Error, needed: u64) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::DiskFull => {
            Error::QuotaExceeded { needed, quota: 0 }
        }
        _ => Error::DatabaseQuery(err),
    }
}

/// Record count for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    /// The bucket.
    pub bucket: Bucket,
    /// Number of records stored in it.
    pub records: usize,
}

/// Statistics about the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Record counts, one entry per bucket.
    pub buckets: Vec<BucketStats>,
    /// Total size of all bucket payloads in bytes.
    pub payload_bytes: u64,
    /// When any bucket was last written.
    pub last_updated: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

impl StorageStats {
    /// Record count for a bucket.
    #[must_use]
    pub fn records(&self, bucket: Bucket) -> usize {
        self.buckets
            .iter()
            .find(|b| b.bucket == bucket)
            .map_or(0, |b| b.records)
    }
}
