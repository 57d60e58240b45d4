//! Settings structs consumed by the engine.
//!
//! The core never parses configuration files itself; an external loader
//! hands it already-deserialized structs. Everything here derives `serde`
//! so any loader format works, with defaults matching the instruments'
//! factory settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Saved resource assignment: which serial resource each instrument was
/// last bound to.
///
/// When both names are present and used to open sessions concurrently they
/// must be distinct; identical values are a shared-resource conflict and
/// are rejected before any handle is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    /// Saved resource for the power relay, if any.
    pub relay: Option<String>,
    /// Saved resource for the gas-flow regulator, if any.
    pub regulator: Option<String>,
}

impl PortAssignment {
    /// Returns the shared resource name when both instruments are assigned
    /// to the same one.
    pub fn conflict(&self) -> Option<&str> {
        match (self.relay.as_deref(), self.regulator.as_deref()) {
            (Some(relay), Some(regulator)) if relay == regulator => Some(relay),
            _ => None,
        }
    }
}

/// Parity setting for a serial link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Serial link parameters for one instrument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate (e.g. 9600, 38400).
    pub baud_rate: u32,
    /// Data bits (7 or 8).
    pub data_bits: u8,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
    /// Parity mode.
    pub parity: Parity,
    /// Protocol station address of the instrument.
    pub slave_id: u8,
    /// Per-operation timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            slave_id: 1,
            timeout: Duration::from_millis(50),
        }
    }
}

impl SerialSettings {
    /// Factory settings for the power relay (9600 baud, 8N1, station 16).
    pub fn relay() -> Self {
        Self {
            slave_id: 16,
            ..Self::default()
        }
    }

    /// Factory settings for the gas-flow regulator (38400 baud, 8N1,
    /// station 1).
    pub fn regulator() -> Self {
        Self {
            baud_rate: 38_400,
            ..Self::default()
        }
    }
}

/// Runtime tuning for the fault supervisor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Interval between liveness/flow polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Consecutive polls without a flow reading tolerated before the
    /// single recovery probe is issued.
    pub stall_threshold: u32,
    /// Upper bound of the regulator's representable flow range, in sccm.
    pub max_flow_sccm: f64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            stall_threshold: 2,
            max_flow_sccm: 10_000.0,
            event_capacity: 256,
        }
    }
}
