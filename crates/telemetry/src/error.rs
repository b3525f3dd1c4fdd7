//! Telemetry Error Module
//!
//! Defines [`TelemetryError`], the error surface of the [`TelemetrySink`](crate::TelemetrySink) boundary.
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TelemetryError {
    #[error("failed to submit telemetry observation: channel closed")]
    SendError,
}
