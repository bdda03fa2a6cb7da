//! One-shot location acquisition.
//!
//! [`LocationCapture`] asks a [`PositionSource`] for a fix within a bounded
//! time, reuses a recent enough cached fix, and optionally adds an address
//! from a [`ReverseGeocoder`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use super::geocode::{NominatimGeocoder, ReverseGeocoder};
use super::gpsd::GpsdSource;
use super::LocationFix;
use crate::config::{Config, LocationProvider};
use crate::error::{Error, Result};

/// Options for a single acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Upper bound for the whole acquisition.
    pub timeout: Duration,
    /// Accept a cached fix no older than this.
    pub maximum_age: Duration,
    /// Ask the source for its best fix quality.
    pub high_accuracy: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            maximum_age: Duration::from_secs(300),
            high_accuracy: false,
        }
    }
}

impl AcquireOptions {
    /// Options taken from the location section of the configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.location_timeout(),
            maximum_age: config.location_maximum_age(),
            high_accuracy: config.location.high_accuracy,
        }
    }
}

/// Something that can measure the device position.
#[async_trait::async_trait]
pub trait PositionSource: Send + Sync + std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Take one position measurement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] or [`Error::Unavailable`] when no
    /// fix can be produced.
    async fn current_position(&self, options: &AcquireOptions) -> Result<LocationFix>;
}

/// A source that always reports the configured coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticSource {
    latitude: f64,
    longitude: f64,
    accuracy: f64,
}

impl StaticSource {
    /// Create a static source.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
        }
    }
}

#[async_trait::async_trait]
impl PositionSource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn current_position(&self, _options: &AcquireOptions) -> Result<LocationFix> {
        Ok(LocationFix::new(self.latitude, self.longitude, self.accuracy))
    }
}

/// A source for when location access is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSource;

#[async_trait::async_trait]
impl PositionSource for DisabledSource {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn current_position(&self, _options: &AcquireOptions) -> Result<LocationFix> {
        Err(Error::permission_denied(
            "location access is disabled in the configuration",
        ))
    }
}

/// One-shot acquisition with caching and optional reverse geocoding.
#[derive(Debug)]
pub struct LocationCapture {
    source: Arc<dyn PositionSource>,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
    cached: Mutex<Option<LocationFix>>,
}

impl LocationCapture {
    /// Create a capture over a source, without geocoding.
    #[must_use]
    pub fn new(source: Arc<dyn PositionSource>) -> Self {
        Self {
            source,
            geocoder: None,
            cached: Mutex::new(None),
        }
    }

    /// Add a reverse geocoder.
    #[must_use]
    pub fn with_geocoder(mut self, geocoder: Arc<dyn ReverseGeocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Seed the cache with a previously acquired fix.
    #[must_use]
    pub fn with_cached(self, fix: Option<LocationFix>) -> Self {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = fix;
        self
    }

    /// Build the capture described by the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the static provider lacks
    /// coordinates, or an error if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let location = &config.location;
        let source: Arc<dyn PositionSource> = match location.provider {
            LocationProvider::Gpsd => Arc::new(GpsdSource::new(location.gpsd_address.clone())),
            LocationProvider::Static => {
                let (Some(lat), Some(lon)) = (location.static_latitude, location.static_longitude)
                else {
                    return Err(Error::ConfigValidation {
                        message: "the static location provider needs static_latitude and static_longitude"
                            .to_string(),
                    });
                };
                Arc::new(StaticSource::new(lat, lon, location.static_accuracy))
            }
            LocationProvider::Disabled => Arc::new(DisabledSource),
        };

        let mut capture = Self::new(source);
        if location.reverse_geocode {
            capture = capture.with_geocoder(Arc::new(NominatimGeocoder::new(
                &location.geocoder_url,
                &location.accept_language,
                config.location_timeout(),
            )?));
        }
        Ok(capture)
    }

    /// Name of the underlying position source.
    #[must_use]
    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Acquire one fix.
    ///
    /// Returns the cached fix if it is no older than `maximum_age`; otherwise
    /// asks the source, bounded by `timeout`. Address lookup failures leave
    /// the address empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`], [`Error::Unavailable`] or
    /// [`Error::Timeout`].
    pub async fn acquire(&self, options: &AcquireOptions) -> Result<LocationFix> {
        if let Some(fix) = self.fresh_cached(options.maximum_age) {
            debug!(source = self.source.name(), "Using cached fix");
            return Ok(fix);
        }

        let mut fix = tokio::time::timeout(options.timeout, self.source.current_position(options))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "{} position after {:?}",
                    self.source.name(),
                    options.timeout
                ))
            })??;
        fix.validate()
            .map_err(|e| Error::unavailable(format!("source returned a bad fix: {e}")))?;

        if fix.address.is_none() {
            if let Some(geocoder) = &self.geocoder {
                match geocoder.lookup(fix.latitude, fix.longitude).await {
                    Ok(address) => fix.address = Some(address),
                    Err(e) => debug!(error = %e, "Address lookup failed"),
                }
            }
        }

        info!(
            source = self.source.name(),
            latitude = fix.latitude,
            longitude = fix.longitude,
            accuracy = fix.accuracy,
            "Acquired location"
        );
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(fix.clone());
        Ok(fix)
    }

    fn fresh_cached(&self, maximum_age: Duration) -> Option<LocationFix> {
        let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        cached
            .as_ref()
            .filter(|fix| fix.age(Utc::now()) <= maximum_age)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PositionSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn current_position(&self, _options: &AcquireOptions) -> Result<LocationFix> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LocationFix::new(35.0, 139.0, 5.0))
        }
    }

    #[derive(Debug)]
    struct StalledSource;

    #[async_trait::async_trait]
    impl PositionSource for StalledSource {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn current_position(&self, _options: &AcquireOptions) -> Result<LocationFix> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(Error::unavailable("never"))
        }
    }

    #[derive(Debug)]
    struct FixedGeocoder(Option<&'static str>);

    #[async_trait::async_trait]
    impl ReverseGeocoder for FixedGeocoder {
        async fn lookup(&self, _latitude: f64, _longitude: f64) -> Result<String> {
            self.0
                .map(ToString::to_string)
                .ok_or_else(|| Error::unavailable("no address"))
        }
    }

    #[tokio::test]
    async fn test_static_source() {
        let capture = LocationCapture::new(Arc::new(StaticSource::new(35.68, 139.76, 50.0)));
        let fix = capture.acquire(&AcquireOptions::default()).await.unwrap();
        assert!((fix.latitude - 35.68).abs() < f64::EPSILON);
        assert!((fix.accuracy - 50.0).abs() < f64::EPSILON);
        assert!(fix.address.is_none());
    }

    #[tokio::test]
    async fn test_disabled_source_is_permission_denied() {
        let capture = LocationCapture::new(Arc::new(DisabledSource));
        let err = capture.acquire(&AcquireOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let capture = LocationCapture::new(Arc::new(StalledSource));
        let options = AcquireOptions {
            timeout: Duration::from_millis(50),
            ..AcquireOptions::default()
        };
        let err = capture.acquire(&options).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_location_error());
    }

    #[tokio::test]
    async fn test_cached_fix_is_reused_within_maximum_age() {
        let source = Arc::new(CountingSource::default());
        let capture = LocationCapture::new(source.clone());
        let options = AcquireOptions::default();

        capture.acquire(&options).await.unwrap();
        capture.acquire(&options).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_cached_fix_is_ignored() {
        let source = Arc::new(CountingSource::default());
        let mut stale = LocationFix::new(0.0, 0.0, 0.0);
        stale.captured_at -= chrono::Duration::minutes(10);

        let capture = LocationCapture::new(source.clone()).with_cached(Some(stale));
        let fix = capture.acquire(&AcquireOptions::default()).await.unwrap();
        assert!((fix.latitude - 35.0).abs() < f64::EPSILON);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_geocoder_adds_address() {
        let capture = LocationCapture::new(Arc::new(StaticSource::new(35.0, 139.0, 5.0)))
            .with_geocoder(Arc::new(FixedGeocoder(Some("Tokyo Station"))));
        let fix = capture.acquire(&AcquireOptions::default()).await.unwrap();
        assert_eq!(fix.address.as_deref(), Some("Tokyo Station"));
    }

    #[tokio::test]
    async fn test_geocoder_failure_is_silent() {
        let capture = LocationCapture::new(Arc::new(StaticSource::new(35.0, 139.0, 5.0)))
            .with_geocoder(Arc::new(FixedGeocoder(None)));
        let fix = capture.acquire(&AcquireOptions::default()).await.unwrap();
        assert!(fix.address.is_none());
    }

    #[test]
    fn test_from_config_static() {
        let mut config = Config::default();
        config.location.provider = LocationProvider::Static;
        config.location.static_latitude = Some(35.0);
        config.location.static_longitude = Some(139.0);
        config.location.reverse_geocode = false;

        let capture = LocationCapture::from_config(&config).unwrap();
        assert_eq!(capture.source_name(), "static");
    }

    #[test]
    fn test_from_config_default_is_gpsd() {
        let capture = LocationCapture::from_config(&Config::default()).unwrap();
        assert_eq!(capture.source_name(), "gpsd");
    }

    #[test]
    fn test_options_from_config() {
        let options = AcquireOptions::from_config(&Config::default());
        assert_eq!(options, AcquireOptions::default());
    }
}
