//! Explicitly injected telemetry handle.
//!
//! Components receive a `Telemetry` through their constructor instead of
//! reaching for a process-wide tracer.

use std::sync::Arc;

use ::tracing::Span;

#[derive(Debug, Clone)]
pub struct Telemetry {
    service: Arc<str>,
    stack: Arc<str>,
}

impl Telemetry {
    pub fn new(service: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            service: Arc::from(service.into()),
            stack: Arc::from(stack.into()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Span covering one background job spawned for a task.
    pub fn job(&self, task_reference: &str) -> Span {
        ::tracing::info_span!(
            "engine.job",
            service = %self.service,
            stack = %self.stack,
            task = %task_reference,
        )
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new("paybridge", "local")
    }
}
