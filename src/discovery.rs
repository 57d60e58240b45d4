//! Serial resource discovery and startup classification.
//!
//! At startup the saved [`PortAssignment`] is cross-referenced against the
//! resources actually visible on the host and classified into one of four
//! conditions. Classification only inspects the visible list; it never
//! opens a handle. The same [`PortEnumerator`] is re-queried at runtime by
//! the supervisor to distinguish a physically unplugged device from one
//! that is present but unresponsive.

use crate::config::PortAssignment;
use serde::{Deserialize, Serialize};

/// Source of the host's visible serial resource list.
pub trait PortEnumerator: Send + Sync {
    /// Names of the serial resources currently visible on the host.
    fn visible_ports(&self) -> Vec<String>;
}

/// Enumerates the host's real serial resources.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    #[cfg(feature = "instrument_serial")]
    fn visible_ports(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "serial port enumeration failed");
                Vec::new()
            }
        }
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn visible_ports(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Fixed resource list, for tests and headless runs.
#[derive(Clone, Debug, Default)]
pub struct StaticPorts(pub Vec<String>);

impl PortEnumerator for StaticPorts {
    fn visible_ports(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// The four startup conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupClassification {
    /// Both saved resources are visible.
    BothAvailable,
    /// The regulator's saved resource is visible but the relay's is absent
    /// or was never saved.
    RelayUnavailable,
    /// The relay's saved resource is visible but the regulator's is absent
    /// or was never saved.
    RegulatorUnavailable,
    /// Neither saved resource is visible, or the host exposes no serial
    /// resources at all. Fatal for the run: no session is created.
    NoneAvailable,
}

/// Classification of the saved assignment against the visible resources.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    /// Which of the four startup conditions holds.
    pub classification: StartupClassification,
    /// Set when one device is unavailable and the host exposes exactly one
    /// resource: the user must disambiguate which instrument it belongs to
    /// before connecting.
    pub single_resource_ambiguous: bool,
}

impl StartupReport {
    /// Whether runtime commands should be enabled at all.
    pub fn commands_enabled(&self) -> bool {
        self.classification != StartupClassification::NoneAvailable
    }
}

/// Classifies a saved assignment against the visible resource list.
pub fn classify(saved: &PortAssignment, visible: &[String]) -> StartupReport {
    let present = |name: Option<&str>| {
        name.map(|n| visible.iter().any(|v| v == n))
            .unwrap_or(false)
    };
    let relay_present = present(saved.relay.as_deref());
    let regulator_present = present(saved.regulator.as_deref());

    let classification = match (relay_present, regulator_present) {
        (true, true) => StartupClassification::BothAvailable,
        (false, true) => StartupClassification::RelayUnavailable,
        (true, false) => StartupClassification::RegulatorUnavailable,
        (false, false) => StartupClassification::NoneAvailable,
    };

    let one_device_missing = matches!(
        classification,
        StartupClassification::RelayUnavailable | StartupClassification::RegulatorUnavailable
    );

    StartupReport {
        classification,
        single_resource_ambiguous: one_device_missing && visible.len() == 1,
    }
}
