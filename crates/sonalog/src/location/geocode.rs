//! Reverse geocoding: coordinates to a human-readable address.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Looks up an address for a coordinate pair.
#[async_trait::async_trait]
pub trait ReverseGeocoder: Send + Sync + std::fmt::Debug {
    /// Return a display name for the position.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or yields no address.
    async fn lookup(&self, latitude: f64, longitude: f64) -> Result<String>;
}

/// Nominatim `/reverse` response; only the display name is used.
#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
}

/// Reverse geocoder for the Nominatim HTTP API.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
    accept_language: String,
}

impl NominatimGeocoder {
    /// Create a geocoder for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, accept_language: &str, timeout: Duration) -> Result<Self> {
        // Nominatim's usage policy requires an identifying user agent
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sonalog/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            accept_language: accept_language.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    async fn lookup(&self, latitude: f64, longitude: f64) -> Result<String> {
        let url = format!("{}/reverse", self.base_url);
        debug!(%url, latitude, longitude, "Reverse geocoding");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("format", "json".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("accept-language", self.accept_language.clone()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::unavailable(format!(
                "geocoder returned HTTP {status}"
            )));
        }

        let body: ReverseResponse = response
            .json()
            .await
            .map_err(|e| Error::malformed("geocoder response", e.to_string()))?;

        body.display_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| Error::unavailable("geocoder returned no address"))
    }
}
