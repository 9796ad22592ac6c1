//! Tracing initialization
//!
//! Human-readable output on the operator's terminal by default, JSON lines
//! when `KEEL_LOG_FORMAT=json` is set (for CI logs and log shippers).

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log format
pub const LOG_FORMAT_ENV: &str = "KEEL_LOG_FORMAT";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Enable debug output for keel crates (remote command output included)
    pub verbose: bool,
    /// Emit JSON lines instead of the compact terminal format
    pub json: bool,
}

impl TelemetryConfig {
    /// Build the config from the `--verbose` flag and the environment
    pub fn from_env(verbose: bool) -> Self {
        Self {
            verbose,
            json: std::env::var(LOG_FORMAT_ENV)
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    fn default_directives(&self) -> &'static str {
        if self.verbose {
            "info,keel=debug,keel_executor=debug,keel_cluster=debug,kube=info,hyper=warn"
        } else {
            "info,kube=warn,hyper=warn"
        }
    }
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` overrides the default directives when set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}
