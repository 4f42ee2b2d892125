//! Tracing and logging setup, plus the telemetry handle injected into engine components.

/// Install the process-wide subscriber. Later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

/// Per-component telemetry handle.
pub mod telemetry;

pub use telemetry::Telemetry;
pub use tracing::LogFormat;
