//! Custom error types for the engine.
//!
//! This module defines the primary error type, `DeviceError`, shared by both
//! instrument sessions and the runtime supervisor. Using the `thiserror`
//! crate, it provides a centralized and consistent way to represent every
//! failure the hardware path can produce, from a refused connection to a
//! stalled acquisition.
//!
//! ## Propagation policy
//!
//! - **Validation errors** (`Validation`) are raised before any hardware
//!   access and never reach a session's error slot.
//! - **Hardware-path errors** (`ConnectionFailed`, `ReadFailed`,
//!   `WriteFailed`, `CommunicationLost`, `DeviceNotInitialized`) are
//!   normalized at the safe-call boundary, stored in the owning session's
//!   error slot, and returned as a typed `Err` — they never escape the
//!   boundary as an uncaught fault.
//! - **Supervisor faults** (`AcquisitionStalled`, physical disconnection)
//!   surface as state-transition events rather than halting the command
//!   stream; the unaffected device keeps working.
//! - `ShutdownFailed` aggregates teardown failures and never blocks process
//!   exit.

use thiserror::Error;

/// Rejection of a raw setpoint request, caught before any hardware access.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The setpoint text was empty.
    #[error("setpoint text is empty")]
    Empty,

    /// The setpoint text did not parse as a finite number.
    #[error("setpoint '{0}' is not a valid number")]
    Malformed(String),

    /// The parsed value falls outside the instrument's representable range.
    #[error("setpoint {value} sccm outside instrument range {min}..={max} sccm")]
    OutOfRange {
        /// The parsed, rejected value.
        value: f64,
        /// Lower bound of the instrument range.
        min: f64,
        /// Upper bound of the instrument range.
        max: f64,
    },
}

/// All failures an instrument session or the supervisor can report.
///
/// Variants carry the normalized detail string assembled at the safe-call
/// boundary; transport-level context travels inside it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No serial resource matching the request is visible on the host.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Relay and regulator were assigned the same physical resource.
    #[error("relay and regulator share resource '{0}'")]
    SharedResourceConflict(String),

    /// Opening a connection to the device failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation was attempted with no open connection.
    #[error("device not initialized (connection was never established)")]
    DeviceNotInitialized,

    /// The resource is still present but the device stopped responding.
    #[error("communication lost: {0}")]
    CommunicationLost(String),

    /// No flow reading was acquired for too many consecutive polls and the
    /// bounded recovery attempt failed.
    #[error("flow acquisition stalled ({0} consecutive polls without a reading)")]
    AcquisitionStalled(u32),

    /// A setpoint request was rejected before any hardware access.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A register write was refused or timed out.
    #[error("register write failed: {0}")]
    WriteFailed(String),

    /// A register read was refused or timed out.
    #[error("register read failed: {0}")]
    ReadFailed(String),

    /// Teardown completed but one or more sessions failed to close cleanly.
    #[error("shutdown completed with {} failure(s)", .0.len())]
    ShutdownFailed(Vec<DeviceError>),
}
