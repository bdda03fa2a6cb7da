//! Logging setup for sonalog.
//!
//! Command output goes to stdout; log lines go to stderr so that
//! `--json` output and QR payloads can be piped.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// HTTP stack crates that are noisy below `warn`.
const HTTP_TARGETS: [&str; 4] = ["reqwest", "hyper", "hyper_util", "rustls"];

/// How much to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Info and above.
    #[default]
    Normal,
    /// Debug and above, with log targets.
    Verbose,
    /// Everything, including the HTTP stack.
    Trace,
}

impl Verbosity {
    /// Map `-q` and repeated `-v` flags to a level; `-q` wins.
    #[must_use]
    pub fn from_flags(verbose: u8, quiet: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Trace,
        }
    }

    /// Convert verbosity to tracing level filter.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Filter directives used when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_directives(&self) -> String {
        let mut directives = format!("sonalog={}", self.to_level_filter());
        let http_level = if *self == Self::Trace { "debug" } else { "warn" };
        for target in HTTP_TARGETS {
            directives.push_str(&format!(",{target}={http_level}"));
        }
        directives
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `verbosity`. Later calls are no-ops.
///
/// # Examples
///
/// ```no_run
/// use sonalog::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::from_flags(1, false));
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_directives()));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbosity >= Verbosity::Verbose)
            .with_file(false)
            .with_line_number(false),
    );

    let _ = subscriber.try_init();
}

/// Initialize logging for tests.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(Verbosity::from_flags(3, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(0, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(1, false), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(5, false), Verbosity::Trace);
    }

    #[test]
    fn test_verbosity_to_level() {
        assert_eq!(Verbosity::Quiet.to_level_filter(), Level::ERROR);
        assert_eq!(Verbosity::Normal.to_level_filter(), Level::INFO);
        assert_eq!(Verbosity::Verbose.to_level_filter(), Level::DEBUG);
        assert_eq!(Verbosity::Trace.to_level_filter(), Level::TRACE);
    }

    #[test]
    fn test_http_stack_is_quiet_until_trace() {
        let normal = Verbosity::Normal.default_directives();
        assert!(normal.starts_with("sonalog=INFO"));
        assert!(normal.contains("reqwest=warn"));

        let trace = Verbosity::Trace.default_directives();
        assert!(trace.contains("hyper=debug"));
        assert!(EnvFilter::try_new(trace).is_ok());
    }

    #[test]
    fn test_init_is_idempotent() {
        init_test_logging();
        init_logging(Verbosity::Quiet);
        init_logging(Verbosity::Trace);
    }
}
