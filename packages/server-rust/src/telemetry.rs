//! Logging and metrics setup.
//!
//! Tracing goes through a reloadable `EnvFilter` so the loglevel RPC can
//! swap verbosity at runtime. Metrics are exported over a standalone
//! Prometheus scrape endpoint when one is configured.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, Registry};

// ---------------------------------------------------------------------------
// Log format
// ---------------------------------------------------------------------------

/// Log output format. `RUST_LOG` controls the level either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output for terminals.
    #[default]
    Pretty,
    /// One JSON object per line, for log aggregators.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        })
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Runtime control over the tracing filter, handed to the loglevel RPC.
///
/// Carries nothing in tests, where no global subscriber is installed; `set`
/// still validates the directive so handler behavior stays the same.
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogLevelHandle {
    /// A handle that validates directives but reloads nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Replace the active filter with a new `EnvFilter` directive, e.g.
    /// `"debug"` or `"info,shardhelm_server=trace"`.
    ///
    /// # Errors
    ///
    /// Fails when the directive does not parse or the subscriber is gone.
    pub fn set(&self, directive: &str) -> anyhow::Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|err| anyhow::anyhow!("bad filter directive: {err}"))?;
        if let Some(handle) = &self.inner {
            handle
                .reload(filter)
                .map_err(|err| anyhow::anyhow!("failed to swap log filter: {err}"))?;
            info!(directive, "log level updated");
        }
        Ok(())
    }
}

/// Install the global tracing subscriber and return the reload handle.
///
/// The initial filter comes from `RUST_LOG`, defaulting to `info`.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<LogLevelHandle> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(env_filter);

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|err| anyhow::anyhow!("tracing init failed: {err}"))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|err| anyhow::anyhow!("tracing init failed: {err}"))?;
        }
    }

    Ok(LogLevelHandle {
        inner: Some(handle),
    })
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Install the global metrics recorder with a Prometheus scrape endpoint
/// on `listen`.
///
/// # Errors
///
/// Fails when a recorder is already installed or the listener cannot bind.
pub fn install_metrics(listen: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|err| anyhow::anyhow!("prometheus exporter failed: {err}"))?;
    info!(%listen, "prometheus exporter listening");
    Ok(())
}
