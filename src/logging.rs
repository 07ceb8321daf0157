//! Tracing subscriber setup.
//!
//! Set `NANO_BATCH_LOG_FORMAT=json` for JSON lines, anything else for
//! human-readable output. `RUST_LOG` overrides the level passed to [`init`].

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "NANO_BATCH_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable (default).
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parse a format name, case-insensitively. Unknown names mean Pretty.
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    /// Read the format from [`LOG_FORMAT_ENV`].
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }
}

/// Install the global subscriber with `level` as the default filter.
///
/// Calling it again (or after another subscriber was installed) is a no-op.
pub fn init(level: &str) {
    init_with_format(level, LogFormat::from_env());
}

/// Install the global subscriber with an explicit format.
pub fn init_with_format(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // An existing global subscriber wins.
    let _ = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_names(true)
                    .with_target(true),
            )
            .try_init(),
    };
}
