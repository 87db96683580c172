//! Logging utilities for confab services.
//!
//! Provides structured logging with trace IDs for observability.
//!
//! # Noise Filtering
//!
//! By default, noisy library modules (redis, tokio_util) are set to `warn`
//! level to reduce log clutter while keeping business logs at the specified
//! level.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default noisy modules that should be filtered to warn level.
///
/// These modules produce high-volume debug/trace logs that typically
/// don't provide useful business context (connection management,
/// timer wheels, etc.)
pub const NOISY_MODULES: &[&str] = &["redis", "tokio_util"];

/// Build the default EnvFilter with noise suppression.
///
/// Creates a filter that sets noisy library modules to `warn` while
/// keeping the base log level for business logic.
fn build_filter(log_level: &str) -> EnvFilter {
    // Try environment variable first (allows override)
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = String::from(log_level);

    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }

    EnvFilter::new(&directives)
}

/// Initialize logging with the given configuration.
///
/// # Arguments
///
/// * `log_level` - Base log level (trace, debug, info, warn, error)
/// * `log_format` - Output format: "json" for structured JSON, "pretty" for human-readable
///
/// # Noise Filtering
///
/// Noisy modules are automatically set to `warn` level unless overridden
/// via the `RUST_LOG` environment variable.
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = build_filter(log_level);

    let subscriber = tracing_subscriber::registry().with(filter);

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        // Default to pretty format
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        let _ = subscriber.with(fmt_layer).try_init();
    }

    tracing::info!(
        log_level = %log_level,
        log_format = %log_format,
        noise_filtered = NOISY_MODULES.len(),
        "Logging initialized"
    );
}

/// Generate a new trace ID for request tracing.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a new span ID for step tracing.
pub fn generate_span_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

// ============================================================================
// Metrics Collection
// ============================================================================

/// Simple metrics collector for request tracking.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Arc<RwLock<MetricsInner>>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    request_count: u64,
    error_count: u64,
    total_duration_ms: u64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request.
    pub async fn record_request(&self, duration_ms: u64, success: bool) {
        let mut inner = self.inner.write().await;
        inner.request_count += 1;
        inner.total_duration_ms += duration_ms;
        if !success {
            inner.error_count += 1;
        }
    }

    /// Get current metrics summary.
    pub async fn summary(&self) -> MetricsSummary {
        let inner = self.inner.read().await;
        MetricsSummary {
            request_count: inner.request_count,
            error_count: inner.error_count,
            avg_duration_ms: if inner.request_count > 0 {
                inner.total_duration_ms / inner.request_count
            } else {
                0
            },
        }
    }
}

/// Metrics summary for reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noisy_modules_list() {
        assert!(NOISY_MODULES.contains(&"redis"));
        assert!(NOISY_MODULES.contains(&"tokio_util"));
    }

    #[test]
    fn test_generate_trace_id() {
        let id1 = generate_trace_id();
        let id2 = generate_trace_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36); // UUID format
    }

    #[test]
    fn test_generate_span_id() {
        let id = generate_span_id();
        assert_eq!(id.len(), 8); // Short span ID
    }

    #[tokio::test]
    async fn test_metrics_recording() {
        let metrics = Metrics::new();
        metrics.record_request(100, true).await;
        metrics.record_request(200, false).await;

        let summary = metrics.summary().await;
        assert_eq!(summary.request_count, 2);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.avg_duration_ms, 150);
    }
}
