//! Device identity and family-session settings.
//!
//! Both live in single-record buckets so a CLI invocation can pick up where
//! the previous one left off.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::family::FamilyCode;
use crate::location::{LocationFix, MemberStatus};
use crate::storage::{Bucket, BucketRecord, Storage};

/// Stable identity of this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Identifier sent with presence updates.
    pub device_id: String,
    /// When the identity was minted.
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    fn mint() -> Self {
        Self {
            device_id: format!("device_{}", Uuid::new_v4().simple()),
            created_at: Utc::now(),
        }
    }
}

impl BucketRecord for DeviceIdentity {
    const BUCKET: Bucket = Bucket::Device;

    fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::validation("device_id", "must not be empty"));
        }
        Ok(())
    }
}

/// Load the device identity, minting and storing one on first use.
///
/// # Errors
///
/// Returns a storage error.
pub fn device_identity(store: &Storage) -> Result<DeviceIdentity> {
    if let Some(identity) = store.get_one::<DeviceIdentity>()? {
        return Ok(identity);
    }
    let identity = DeviceIdentity::mint();
    store.put_one(&identity)?;
    info!(device_id = %identity.device_id, "Minted device identity");
    Ok(identity)
}

/// Persisted family-sharing preferences and last known state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Family group to rejoin.
    pub family_code: Option<FamilyCode>,
    /// Name published to the family.
    pub member_name: Option<String>,
    /// Whether sharing is switched on.
    pub realtime_enabled: bool,
    /// Most recently acquired fix.
    pub current_location: Option<LocationFix>,
    /// Self-reported status.
    pub status: MemberStatus,
    /// Message published with the status.
    pub status_message: Option<String>,
}

impl BucketRecord for SessionSettings {
    const BUCKET: Bucket = Bucket::Session;

    fn validate(&self) -> Result<()> {
        if self.realtime_enabled && (self.family_code.is_none() || self.member_name.is_none()) {
            return Err(Error::validation(
                "realtime_enabled",
                "sharing needs a family code and member name",
            ));
        }
        if let Some(fix) = &self.current_location {
            fix.validate()?;
        }
        Ok(())
    }
}

impl SessionSettings {
    /// Load the stored settings, or defaults if none were saved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the stored settings are corrupt.
    pub fn load(store: &Storage) -> Result<Self> {
        Ok(store.get_one()?.unwrap_or_default())
    }

    /// Persist the settings.
    ///
    /// # Errors
    ///
    /// Returns a validation or storage error.
    pub fn save(&self, store: &Storage) -> Result<()> {
        store.put_one(self)?;
        debug!(realtime = self.realtime_enabled, "Saved session settings");
        Ok(())
    }

    /// Switch sharing on for `code` under `member_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty member name.
    pub fn enable_realtime(&mut self, code: FamilyCode, member_name: &str) -> Result<()> {
        let name = member_name.trim();
        if name.is_empty() {
            return Err(Error::validation("member_name", "must not be empty"));
        }
        self.family_code = Some(code);
        self.member_name = Some(name.to_string());
        self.realtime_enabled = true;
        Ok(())
    }

    /// Switch sharing off. The code and name are kept for next time.
    pub fn disable_realtime(&mut self) {
        self.realtime_enabled = false;
    }

    /// Record a new status and message; a blank message clears it.
    pub fn update_status(&mut self, status: MemberStatus, message: Option<&str>) {
        self.status = status;
        self.status_message = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
    }

    /// Remember the latest fix.
    pub fn set_current_location(&mut self, fix: LocationFix) {
        self.current_location = Some(fix);
    }
}
