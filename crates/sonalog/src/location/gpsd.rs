//! Position source backed by a local gpsd daemon.
//!
//! Speaks the gpsd JSON protocol: enable watch mode, then read reports line
//! by line until the first TPV report with a usable fix arrives.

use std::io::ErrorKind;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::capture::{AcquireOptions, PositionSource};
use super::LocationFix;
use crate::error::{Error, Result};

/// Command that switches gpsd into JSON watch mode.
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";

/// gpsd fix mode for a 2D fix.
const MODE_2D: u8 = 2;

/// gpsd fix mode for a 3D fix.
const MODE_3D: u8 = 3;

/// A gpsd connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpsdSource {
    address: String,
}

impl GpsdSource {
    /// Create a source for the gpsd daemon at `address` (`host:port`).
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// The configured daemon address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// A failure after connecting: reset, failed write or a garbled stream.
    fn lost(&self, err: &std::io::Error) -> Error {
        Error::unavailable(format!("gpsd at {} stopped responding: {err}", self.address))
    }
}

#[async_trait::async_trait]
impl PositionSource for GpsdSource {
    fn name(&self) -> &'static str {
        "gpsd"
    }

    async fn current_position(&self, options: &AcquireOptions) -> Result<LocationFix> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                Error::permission_denied(format!("gpsd at {}: {e}", self.address))
            } else {
                Error::unavailable(format!("cannot reach gpsd at {}: {e}", self.address))
            }
        })?;
        debug!(address = %self.address, "Connected to gpsd");

        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(WATCH_COMMAND)
            .await
            .map_err(|e| self.lost(&e))?;

        let min_mode = if options.high_accuracy { MODE_3D } else { MODE_2D };
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await.map_err(|e| self.lost(&e))? {
            trace!(%line, "gpsd report");
            if let Some(fix) = parse_tpv(&line, min_mode) {
                return Ok(fix);
            }
        }

        Err(Error::unavailable(format!(
            "gpsd at {} closed the connection before reporting a fix",
            self.address
        )))
    }
}

#[derive(Debug, Deserialize)]
struct TpvReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
}

/// Extract a fix from one gpsd report line.
///
/// Returns `None` for non-TPV reports, unparseable lines and fixes below
/// `min_mode`.
fn parse_tpv(line: &str, min_mode: u8) -> Option<LocationFix> {
    let report: TpvReport = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < min_mode {
        return None;
    }
    let (lat, lon) = (report.lat?, report.lon?);

    let accuracy = report
        .eph
        .or_else(|| match (report.epx, report.epy) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        })
        .unwrap_or(0.0);

    Some(LocationFix::new(lat, lon, accuracy))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    const VERSION: &str = r#"{"class":"VERSION","release":"3.25","proto_major":3,"proto_minor":15}"#;
    const NO_FIX: &str = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":1}"#;
    const FIX_2D: &str =
        r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":2,"lat":35.6812,"lon":139.7671,"epx":12.5,"epy":8.0}"#;
    const FIX_3D: &str =
        r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"lat":35.6813,"lon":139.7672,"eph":4.2}"#;

    async fn fake_gpsd(reports: &'static [&'static str]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let command = lines.next_line().await.unwrap().unwrap();
            assert!(command.starts_with("?WATCH="));
            for report in reports {
                writer.write_all(report.as_bytes()).await.unwrap();
                writer.write_all(b"\n").await.unwrap();
            }
        });

        address
    }

    fn options(high_accuracy: bool) -> AcquireOptions {
        AcquireOptions {
            timeout: Duration::from_secs(5),
            maximum_age: Duration::ZERO,
            high_accuracy,
        }
    }

    #[test]
    fn test_parse_tpv_2d() {
        let fix = parse_tpv(FIX_2D, MODE_2D).unwrap();
        assert!((fix.latitude - 35.6812).abs() < 1e-9);
        assert!((fix.accuracy - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tpv_prefers_eph() {
        let fix = parse_tpv(FIX_3D, MODE_3D).unwrap();
        assert!((fix.accuracy - 4.2).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tpv_skips_other_reports() {
        assert!(parse_tpv(VERSION, MODE_2D).is_none());
        assert!(parse_tpv(NO_FIX, MODE_2D).is_none());
        assert!(parse_tpv("not json", MODE_2D).is_none());
        assert!(parse_tpv(FIX_2D, MODE_3D).is_none());
    }

    #[test]
    fn test_parse_tpv_without_error_estimates() {
        let line = r#"{"class":"TPV","mode":2,"lat":1.0,"lon":2.0}"#;
        let fix = parse_tpv(line, MODE_2D).unwrap();
        assert!(fix.accuracy.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_first_usable_fix_wins() {
        let address = fake_gpsd(&[VERSION, NO_FIX, FIX_2D, FIX_3D]).await;
        let fix = GpsdSource::new(address)
            .current_position(&options(false))
            .await
            .unwrap();
        assert!((fix.latitude - 35.6812).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_high_accuracy_waits_for_3d() {
        let address = fake_gpsd(&[VERSION, FIX_2D, FIX_3D]).await;
        let fix = GpsdSource::new(address)
            .current_position(&options(true))
            .await
            .unwrap();
        assert!((fix.latitude - 35.6813).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_closed_without_fix_is_unavailable() {
        let address = fake_gpsd(&[VERSION, NO_FIX]).await;
        let err = GpsdSource::new(address)
            .current_position(&options(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_unavailable() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = GpsdSource::new(address)
            .current_position(&options(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_garbled_stream_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            lines.next_line().await.unwrap();
            writer
                .write_all(b"{\"class\":\"VERSION\"}\n\xff\xfe garbage\n")
                .await
                .unwrap();
        });

        let err = GpsdSource::new(address)
            .current_position(&options(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
        assert!(err.is_location_error());
    }
}
