//! Snapshot export/import and QR payloads.
//!
//! A snapshot carries the inventory and the user-added contacts. Importing
//! replaces each bucket present in the bundle and leaves the others alone.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::contacts::{is_seed, Contact, Contacts};
use crate::error::{Error, Result};
use crate::family::FamilyCode;
use crate::inventory::{Inventory, InventoryItem};
use crate::location::LocationFix;
use crate::storage::{validate_records, Bucket, Storage};

/// Version stamped into exported snapshots.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Family code used in a location payload when no group is joined.
pub const TEMP_FAMILY_CODE: &str = "TEMP";

/// Largest payload a version-40 QR code holds in byte mode at low error
/// correction.
pub const QR_MAX_BYTES: usize = 2953;

/// Everything a household shares with another device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Supply inventory.
    pub emergency_items: Vec<InventoryItem>,
    /// User-added contacts.
    pub emergency_contacts: Vec<Contact>,
    /// When the snapshot was taken.
    pub export_date: DateTime<Utc>,
    /// Version of the exporting program.
    pub app_version: String,
}

/// A snapshot as read back in; any part may be missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBundle {
    /// Replacement inventory, if present.
    #[serde(default)]
    pub emergency_items: Option<Vec<InventoryItem>>,
    /// Replacement contacts, if present.
    #[serde(default)]
    pub emergency_contacts: Option<Vec<Contact>>,
    /// Export timestamp, informational only.
    #[serde(default)]
    pub export_date: Option<String>,
    /// Exporter version, informational only.
    #[serde(default)]
    pub app_version: Option<String>,
}

impl From<Snapshot> for ImportBundle {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            emergency_items: Some(snapshot.emergency_items),
            emergency_contacts: Some(snapshot.emergency_contacts),
            export_date: Some(snapshot.export_date.to_rfc3339()),
            app_version: Some(snapshot.app_version),
        }
    }
}

/// What an import changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Items written, if the inventory was replaced.
    pub items: Option<usize>,
    /// Contacts written, if the contacts were replaced.
    pub contacts: Option<usize>,
}

/// Capture the current inventory and contacts.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] if a stored bucket is corrupt.
pub fn export_snapshot(store: &Storage) -> Result<Snapshot> {
    Ok(Snapshot {
        emergency_items: Inventory::new(store).list()?,
        emergency_contacts: Contacts::new(store).user_contacts()?,
        export_date: Utc::now(),
        app_version: APP_VERSION.to_string(),
    })
}

/// Parse a bundle from JSON text.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] if the text is not a valid bundle.
pub fn parse_bundle(text: &str) -> Result<ImportBundle> {
    serde_json::from_str(text).map_err(|e| Error::malformed("import bundle", e.to_string()))
}

/// Replace each bucket present in `bundle`.
///
/// Every part is validated and the combined size checked against the quota
/// before anything is written, so an invalid or oversized bundle leaves the
/// store untouched. A database failure partway through can still leave the
/// inventory replaced and the contacts not. Built-in contact ids are skipped.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] if any record is invalid,
/// [`Error::QuotaExceeded`] if the bundle does not fit, or a storage error.
pub fn import_snapshot(store: &Storage, bundle: ImportBundle) -> Result<ImportSummary> {
    let contacts = bundle
        .emergency_contacts
        .map(|all| all.into_iter().filter(|c| !is_seed(&c.id)).collect::<Vec<_>>());

    if let Some(items) = &bundle.emergency_items {
        validate_records(items).map_err(|e| Error::malformed("emergencyItems", e.to_string()))?;
    }
    if let Some(contacts) = &contacts {
        validate_records(contacts)
            .map_err(|e| Error::malformed("emergencyContacts", e.to_string()))?;
    }

    let mut replacements = Vec::new();
    if let Some(items) = &bundle.emergency_items {
        replacements.push((Bucket::Inventory, serde_json::to_string(items)?.len() as u64));
    }
    if let Some(contacts) = &contacts {
        replacements.push((Bucket::Contacts, serde_json::to_string(contacts)?.len() as u64));
    }
    store.ensure_fits(&replacements)?;

    let mut summary = ImportSummary::default();
    if let Some(items) = bundle.emergency_items {
        store.put(&items)?;
        summary.items = Some(items.len());
    }
    if let Some(contacts) = contacts {
        Contacts::new(store).replace_all(contacts.clone())?;
        summary.contacts = Some(contacts.len());
    }
    info!(items = ?summary.items, contacts = ?summary.contacts, "Imported snapshot");
    Ok(summary)
}

/// File name for an export taken at `at`.
#[must_use]
pub fn export_file_name(at: DateTime<Utc>) -> String {
    format!("sonalog-data_{}.json", at.format("%Y-%m-%d"))
}

/// Write a pretty-printed snapshot into `dir` and return the file path.
///
/// # Errors
///
/// Returns an I/O error if the directory or file cannot be written.
pub fn export_to_file(store: &Storage, dir: &Path) -> Result<PathBuf> {
    let snapshot = export_snapshot(store)?;
    fs::create_dir_all(dir).map_err(|source| Error::DirectoryCreate {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(export_file_name(snapshot.export_date));
    fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
    info!(path = %path.display(), "Exported snapshot");
    Ok(path)
}

/// Read a bundle file and import it.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read, or anything
/// [`import_snapshot`] returns.
pub fn import_from_file(store: &Storage, path: &Path) -> Result<ImportSummary> {
    let text = fs::read_to_string(path)?;
    import_snapshot(store, parse_bundle(&text)?)
}

/// Compact snapshot JSON for encoding into a QR code.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the payload is too large for a QR code.
pub fn snapshot_qr_payload(store: &Storage) -> Result<String> {
    fit_qr(serde_json::to_string(&export_snapshot(store)?)?)
}

/// A one-off location handed over by QR code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSharePayload {
    /// Always `location_share`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Family group, or `TEMP` outside a group.
    pub family_code: String,
    /// The shared fix.
    pub location: LocationFix,
    /// Who is sharing.
    pub member_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl LocationSharePayload {
    /// Build a payload stamped now.
    #[must_use]
    pub fn new(family_code: Option<&FamilyCode>, member_name: &str, location: LocationFix) -> Self {
        Self {
            kind: "location_share".to_string(),
            family_code: family_code.map_or(TEMP_FAMILY_CODE, FamilyCode::as_str).to_string(),
            location,
            member_name: member_name.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Compact JSON for encoding into a QR code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the payload is too large for a QR code.
    pub fn to_qr_payload(&self) -> Result<String> {
        fit_qr(serde_json::to_string(self)?)
    }
}

fn fit_qr(payload: String) -> Result<String> {
    if payload.len() > QR_MAX_BYTES {
        return Err(Error::validation(
            "payload",
            format!(
                "{} bytes exceeds the {QR_MAX_BYTES}-byte QR limit; export to a file instead",
                payload.len()
            ),
        ));
    }
    Ok(payload)
}
