//! `SQLite` schema definitions for sonalog.
//!
//! Each bucket is one row whose payload is a JSON array of records.

/// SQL statement to create the buckets table.
pub const CREATE_BUCKETS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    record_count INTEGER NOT NULL,
    updated_at TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[CREATE_BUCKETS_TABLE, CREATE_METADATA_TABLE];
