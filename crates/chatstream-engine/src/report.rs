use crate::fault::UpstreamError;

/// Side channel for upstream error events.
///
/// Upstream errors are observable through the last-error view either way;
/// a reporter additionally receives every classified error event so hosts
/// can forward them to their own telemetry.
pub trait ErrorReporter: Send + Sync {
    /// Called once per classified upstream error event.
    fn report(&self, error: &UpstreamError);
}

/// Default reporter that logs through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &UpstreamError) {
        tracing::error!(recoverable = error.recoverable(), "upstream error: {error}");
    }
}
