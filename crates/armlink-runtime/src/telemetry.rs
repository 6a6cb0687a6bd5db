//! Logging and trace export setup for armlink processes.
//!
//! Call [`init_tracing`] once, before the control loop starts, and keep the
//! returned guard alive until the process exits.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `ARMLINK_LOG_FORMAT=json` | Newline-delimited JSON logs instead of the compact console format. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector URL (e.g. `http://localhost:4318`). Enables span export. |
//!
//! # Example
//!
//! ```rust,no_run
//! let _guard = armlink_runtime::telemetry::init_tracing("armlink");
//! tracing::info!("ready");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "ARMLINK_LOG_FORMAT";

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Read the format from [`LOG_FORMAT_ENV`]; anything but `json` is
    /// compact.
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// Spans from the control loop (`rt_loop`) and every log event go to the
/// console.  With `OTEL_EXPORTER_OTLP_ENDPOINT` set, spans are exported over
/// OTLP/HTTP as well.
///
/// Calling this twice in one process is a no-op for the second call.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::from_env();
    let provider = build_provider(service_name);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("armlink")));

    let registry = tracing_subscriber::registry().with(env_filter).with(otel_layer);
    let installed = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };
    if let Err(e) = installed {
        eprintln!("[armlink] tracing subscriber already installed: {e}");
    }

    TracerProviderGuard(provider)
}

/// Shuts the OpenTelemetry provider down on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// `true` when spans are being exported.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[armlink] OpenTelemetry provider shutdown error: {e}");
            }
        }
    }
}

/// Build the span exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// Uses the simple (synchronous) span processor: the control loop runs on
/// plain threads, so no Tokio runtime is available to a batch processor.
fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[armlink] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_provider_without_endpoint() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(build_provider("armlink-test").is_none());
    }

    #[test]
    fn empty_guard_drops_cleanly() {
        let guard = TracerProviderGuard(None);
        assert!(!guard.is_exporting());
        drop(guard);
    }

    #[test]
    fn log_format_defaults_to_compact() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var(LOG_FORMAT_ENV, "JSON") };
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
        unsafe { std::env::set_var(LOG_FORMAT_ENV, "pretty") };
        assert_eq!(LogFormat::from_env(), LogFormat::Compact);
        unsafe { std::env::remove_var(LOG_FORMAT_ENV) };
        assert_eq!(LogFormat::from_env(), LogFormat::Compact);
    }
}
