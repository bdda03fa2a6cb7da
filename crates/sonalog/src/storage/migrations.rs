//! Schema versioning for the local store.
//!
//! Migrations are numbered from 1 and applied in order, each inside its own
//! transaction together with the version bump.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::schema::SCHEMA_STATEMENTS;

/// Key used to store the schema version in the metadata table.
const VERSION_KEY: &str = "schema_version";

/// Ordered migrations; entry `i` upgrades the schema to version `i + 1`.
const MIGRATIONS: &[&[&str]] = &[SCHEMA_STATEMENTS];

/// The current schema version.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub const CURRENT_VERSION: i32 = MIGRATIONS.len() as i32;

/// Bring the database schema up to [`CURRENT_VERSION`].
///
/// # Errors
///
/// Returns an error if the stored version is unreadable, newer than this
/// build understands, or a migration fails.
pub fn initialize_schema(conn: &mut Connection) -> Result<()> {
    // The metadata table must exist before the version can be read
    conn.execute(super::schema::CREATE_METADATA_TABLE, [])?;

    let version = get_schema_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        });
    }

    for target in (version + 1)..=CURRENT_VERSION {
        run_migration(conn, target)?;
    }

    if version < CURRENT_VERSION {
        info!(from = version, to = CURRENT_VERSION, "Migrated local store schema");
    }
    Ok(())
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (fresh database).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        None => Ok(0),
        Some(value) => value.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {value}"),
        }),
    }
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        (VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}

/// Apply the migration that produces schema `version`.
fn run_migration(conn: &mut Connection, version: i32) -> Result<()> {
    let statements = usize::try_from(version - 1)
        .ok()
        .and_then(|index| MIGRATIONS.get(index))
        .ok_or_else(|| Error::DatabaseMigration {
            message: format!("unknown migration version: {version}"),
        })?;

    let tx = conn.transaction()?;
    for statement in *statements {
        tx.execute(statement, [])?;
    }
    set_schema_version(&tx, version)?;
    tx.commit()?;

    debug!(version, "Applied migration");
    Ok(())
}
