//! Graceful teardown of both device sessions.
//!
//! The sequencer attempts `disconnect` on both sessions regardless of
//! individual outcomes, collects per-device failures plus an unclassified
//! bucket, and reports them without ever blocking process termination.

use crate::error::DeviceError;
use crate::session::regulator::RegulatorSession;
use crate::session::relay::RelaySession;
use tracing::{info, warn};

/// Collected teardown outcome.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShutdownReport {
    /// True when the confirm gate declined and nothing was touched.
    pub cancelled: bool,
    /// Regulator disconnect failure, if any.
    pub regulator: Option<DeviceError>,
    /// Relay disconnect failure, if any.
    pub relay: Option<DeviceError>,
    /// Failures attributable to neither device.
    pub unclassified: Vec<DeviceError>,
}

impl ShutdownReport {
    /// A report for a declined confirm gate.
    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    /// Whether teardown completed without failures.
    pub fn is_clean(&self) -> bool {
        !self.cancelled
            && self.regulator.is_none()
            && self.relay.is_none()
            && self.unclassified.is_empty()
    }

    /// Aggregates the collected failures into a single error, when any.
    pub fn as_error(&self) -> Option<DeviceError> {
        let mut failures: Vec<DeviceError> = Vec::new();
        failures.extend(self.regulator.clone());
        failures.extend(self.relay.clone());
        failures.extend(self.unclassified.iter().cloned());
        if failures.is_empty() {
            None
        } else {
            Some(DeviceError::ShutdownFailed(failures))
        }
    }
}

/// Closes both sessions, regulator first, collecting failures instead of
/// aborting on them.
pub(crate) async fn run(
    regulator: &mut RegulatorSession,
    relay: &mut RelaySession,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    if let Err(error) = regulator.disconnect().await {
        warn!(error = %error, "regulator failed to disconnect during shutdown");
        report.regulator = Some(error);
    }

    if let Err(error) = relay.disconnect().await {
        warn!(error = %error, "relay failed to disconnect during shutdown");
        report.relay = Some(error);
    }

    if report.is_clean() {
        info!("both sessions closed");
    }
    report
}
