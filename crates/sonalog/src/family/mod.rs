//! Family location sharing.
//!
//! Devices sharing a [`FamilyCode`] publish their latest [`LocationRecord`]
//! to a [`FamilyBackend`] and watch everyone else's through a
//! [`FamilyChannel`].
//!
//! [`LocationRecord`]: crate::location::LocationRecord

pub mod backend;
pub mod channel;
pub mod code;
pub mod rest;
pub mod view;

use std::sync::Arc;

pub use backend::{FamilyBackend, FeedEvent, MemberPresence, MemoryBackend};
pub use channel::{ConnectionState, FamilyChannel, EMERGENCY_PREFIX};
pub use code::FamilyCode;
pub use rest::RestBackend;
pub use view::FamilyView;

use crate::config::{BackendKind, Config};
use crate::error::Result;

/// Mint a fresh family code for a new group.
#[must_use]
pub fn mint_family_code() -> FamilyCode {
    FamilyCode::generate()
}

/// Build the backend selected in the configuration.
///
/// # Errors
///
/// Returns [`crate::Error::ConfigValidation`] if the REST backend is selected
/// without a URL, or an error if its HTTP client cannot be built.
pub fn backend_from_config(config: &Config) -> Result<Arc<dyn FamilyBackend>> {
    Ok(match config.family.backend {
        BackendKind::Rest => Arc::new(RestBackend::from_config(config)?),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    })
}
