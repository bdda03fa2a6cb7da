//! `sonalog` - A household disaster-preparedness companion
//!
//! This library keeps an emergency supply inventory with expiry tracking and
//! a list of emergency contacts in a local store, and shares each member's
//! location and safety status with their family over a family channel.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod contacts;
pub mod error;
pub mod family;
pub mod inventory;
pub mod location;
pub mod logging;
pub mod session;
pub mod sharing;
pub mod storage;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use error::{Error, Result};
pub use family::{FamilyChannel, FamilyCode};
pub use location::{LocationFix, LocationRecord, MemberStatus};
pub use logging::init_logging;
pub use storage::{Storage, StorageStats};
