//! Tracing subscriber setup
//!
//! The library crates only emit `tracing` events; binaries embedding them
//! call [`init_tracing`] once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing_subscriber::util::TryInitError;

const DEFAULT_FILTER: &str = "info,keylatch=debug";

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit one JSON object per event instead of human-readable lines
    pub json: bool,
    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create config from environment variables
    ///
    /// Reads:
    /// - KEYLATCH_LOG: filter directives (default: "info,keylatch=debug")
    /// - KEYLATCH_LOG_FORMAT: "json" for structured output
    pub fn from_env() -> Self {
        let filter = std::env::var("KEYLATCH_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
        let json = std::env::var("KEYLATCH_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Self {
            filter,
            json,
            ..Default::default()
        }
    }

    /// Verbose console output
    pub fn development() -> Self {
        Self {
            filter: "debug".to_string(),
            json: false,
            with_target: true,
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `config.filter`. Fails if a global subscriber is
/// already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_current_span(true)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_level(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;

    tracing::debug!(json = config.json, filter = %config.filter, "tracing initialised");
    Ok(())
}
