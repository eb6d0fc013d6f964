/*!
 * Structured Tracing
 * Subscriber setup and timed spans for maintenance operations
 *
 * Features:
 * - `RUST_LOG` filtering (default: info)
 * - Compact output for development, JSON lines for log pipelines
 * - Timed spans that flag slow diagnostics
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, span, warn, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Operations slower than this are logged at warn level
pub const SLOW_OPERATION_THRESHOLD: Duration = Duration::from_millis(10);

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceFormat {
    /// Human-readable single lines
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed, which leaves the
/// existing one in place.
pub fn init_tracing(format: TraceFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        TraceFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok(),
        TraceFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok(),
    };

    if installed {
        debug!(?format, "Structured tracing initialized");
    }
    installed
}

/// Timed span around a maintenance or diagnostic operation
pub struct OperationSpan {
    span: tracing::Span,
    start: Instant,
    operation: &'static str,
    id: u64,
}

impl OperationSpan {
    pub fn new(operation: &'static str) -> Self {
        let id = NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed);
        let span = span!(
            Level::DEBUG,
            "memory_operation",
            operation,
            id,
            duration_us = tracing::field::Empty,
            result = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            operation,
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn record_result(&self, success: bool) {
        self.span
            .record("result", if success { "success" } else { "error" });
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for OperationSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_us", duration.as_micros() as u64);
        let _entered = self.span.enter();

        if duration > SLOW_OPERATION_THRESHOLD {
            warn!(
                operation = self.operation,
                id = self.id,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow memory operation"
            );
        } else {
            debug!(
                operation = self.operation,
                id = self.id,
                duration_us = duration.as_micros() as u64,
                "memory operation completed"
            );
        }
    }
}

/// Start a timed span for `operation`
#[inline]
pub fn span_operation(operation: &'static str) -> OperationSpan {
    OperationSpan::new(operation)
}
