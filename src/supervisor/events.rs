//! Outcome and event types emitted by the fault supervisor.
//!
//! The presentation layer subscribes to [`SupervisorEvent`]s over a
//! broadcast channel; command replies reuse the same outcome types.

use crate::discovery::StartupReport;
use crate::error::{DeviceError, ValidationError};
use crate::session::DeviceKind;
use crate::supervisor::MeasurementSample;
use crate::supervisor::shutdown::ShutdownReport;

/// Result of a power-on request.
#[derive(Clone, Debug, PartialEq)]
pub enum PowerOnOutcome {
    /// Both instruments were assigned the same resource; rejected before
    /// any handle was opened.
    Conflict(String),
    /// Both connects were attempted; per-device results. A single-device
    /// failure never blocks the other device's attempt.
    Attempted {
        /// Relay connect result.
        relay: Result<(), DeviceError>,
        /// Regulator connect result.
        regulator: Result<(), DeviceError>,
    },
}

impl PowerOnOutcome {
    /// Whether both devices connected.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Attempted {
                relay: Ok(()),
                regulator: Ok(()),
            }
        )
    }
}

/// Result of a power-off request; per-device results, each attempted
/// regardless of the other.
#[derive(Clone, Debug, PartialEq)]
pub struct PowerOffOutcome {
    /// Regulator disconnect result.
    pub regulator: Result<(), DeviceError>,
    /// Relay power-down and disconnect result.
    pub relay: Result<(), DeviceError>,
}

impl PowerOffOutcome {
    /// Whether both devices shut down cleanly.
    pub fn is_success(&self) -> bool {
        self.regulator.is_ok() && self.relay.is_ok()
    }
}

/// Result of a setpoint request.
#[derive(Clone, Debug, PartialEq)]
pub enum SetpointOutcome {
    /// The regulator is not connected; nothing was validated or sent.
    NotConnected,
    /// The request was rejected before any hardware access.
    Rejected(ValidationError),
    /// The register write failed; the regulator's error slot holds the
    /// detail.
    WriteFailed(DeviceError),
    /// The setpoint was committed; `target_sccm` is the quantized value
    /// actually commanded.
    Committed {
        /// Normalized numeric target.
        target_sccm: f64,
    },
}

/// A runtime fault observed by the supervisor, classified per device.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceFault {
    /// The resource vanished from the host. Terminal: the session was
    /// forced to disconnected and needs a fresh connect.
    PhysicalDisconnection,
    /// The resource is still visible but the operation failed; the session
    /// stays degraded and the next poll retries.
    CommunicationLost(DeviceError),
    /// The bounded recovery probe failed; the session was closed.
    AcquisitionStalled {
        /// Consecutive polls without a flow reading when recovery was
        /// abandoned.
        missed_polls: u32,
    },
}

/// Everything the supervisor reports to the presentation layer.
#[derive(Clone, Debug)]
pub enum SupervisorEvent {
    /// Startup classification of the saved assignment.
    StartupClassified(StartupReport),
    /// A power-on request completed.
    PowerOn(PowerOnOutcome),
    /// A power-off request completed.
    PowerOff(PowerOffOutcome),
    /// A runtime fault was detected on one device.
    Fault {
        /// Which device faulted.
        device: DeviceKind,
        /// The classified fault.
        fault: DeviceFault,
    },
    /// Flow readings stopped arriving; the single recovery probe is about
    /// to be issued.
    StallWarning {
        /// Consecutive polls without a flow reading.
        missed_polls: u32,
    },
    /// The stall-recovery probe succeeded; normal monitoring resumed.
    RecoverySucceeded {
        /// Flow reading returned by the probe.
        flow_sccm: f64,
    },
    /// A setpoint request completed.
    Setpoint(SetpointOutcome),
    /// A gas selection was committed.
    GasSelected {
        /// Instrument gas table ID.
        gas_id: u16,
    },
    /// A flow sample was appended to the runtime buffer.
    SampleRecorded(MeasurementSample),
    /// Teardown completed.
    Shutdown(ShutdownReport),
}
