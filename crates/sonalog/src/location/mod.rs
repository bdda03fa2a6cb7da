//! Location records and one-shot position acquisition.
//!
//! A [`LocationFix`] is what the device measured; a [`LocationRecord`] is what
//! gets published to the family channel, combining a fix with the member's
//! name and status.

pub mod capture;
pub mod geocode;
pub mod gpsd;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use capture::{AcquireOptions, DisabledSource, LocationCapture, PositionSource, StaticSource};
pub use geocode::{NominatimGeocoder, ReverseGeocoder};
pub use gpsd::GpsdSource;

/// A member's self-reported safety status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// The member is safe.
    Safe,
    /// The member needs help.
    NeedHelp,
    /// The member is on the way to an evacuation site.
    Evacuating,
    /// No status reported.
    #[default]
    Unknown,
}

impl MemberStatus {
    /// Wire and storage name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::NeedHelp => "need_help",
            Self::Evacuating => "evacuating",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "need_help" | "need-help" => Ok(Self::NeedHelp),
            "evacuating" => Ok(Self::Evacuating),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::validation(
                "status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// A single position measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: f64,
    /// Human-readable address, when reverse geocoding succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Battery charge in percent, when the platform reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    /// When the fix was taken.
    pub captured_at: DateTime<Utc>,
}

impl LocationFix {
    /// Create a fix taken now.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            address: None,
            battery_level: None,
            captured_at: Utc::now(),
        }
    }

    /// Age of the fix relative to `now`; zero for fixes from the future.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.captured_at).to_std().unwrap_or_default()
    }

    /// Check coordinate ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        validate_coordinates(self.latitude, self.longitude, self.accuracy)?;
        validate_battery(self.battery_level)
    }
}

/// A member's published location and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Display name of the member; the key within a family group.
    pub member_name: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: f64,
    /// Human-readable address.
    #[serde(default)]
    pub address: Option<String>,
    /// Safety status.
    #[serde(default)]
    pub status: MemberStatus,
    /// Free-text message.
    #[serde(default)]
    pub message: Option<String>,
    /// Battery charge in percent.
    #[serde(default)]
    pub battery_level: Option<u8>,
    /// Publish time; strictly increasing per member per device.
    pub updated_at: DateTime<Utc>,
}

impl LocationRecord {
    /// Build a record from a fix.
    #[must_use]
    pub fn from_fix(
        member_name: impl Into<String>,
        fix: &LocationFix,
        status: MemberStatus,
        message: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            member_name: member_name.into(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
            address: fix.address.clone(),
            status,
            message,
            battery_level: fix.battery_level,
            updated_at,
        }
    }

    /// Check the record before publishing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty name or out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.member_name.trim().is_empty() {
            return Err(Error::validation("member_name", "must not be empty"));
        }
        validate_coordinates(self.latitude, self.longitude, self.accuracy)?;
        validate_battery(self.battery_level)
    }
}

fn validate_coordinates(latitude: f64, longitude: f64, accuracy: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(Error::validation(
            "latitude",
            format!("{latitude} is outside -90..=90"),
        ));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(Error::validation(
            "longitude",
            format!("{longitude} is outside -180..=180"),
        ));
    }
    if !accuracy.is_finite() || accuracy < 0.0 {
        return Err(Error::validation(
            "accuracy",
            format!("{accuracy} must be a non-negative number of meters"),
        ));
    }
    Ok(())
}

fn validate_battery(level: Option<u8>) -> Result<()> {
    match level {
        Some(level) if level > 100 => Err(Error::validation(
            "battery_level",
            format!("{level} is above 100"),
        )),
        _ => Ok(()),
    }
}
