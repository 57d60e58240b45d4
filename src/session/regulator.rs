//! Gas-flow regulator session.
//!
//! Setpoint and measured flow travel as a 32-bit fixed-point value split
//! across two registers, high word first. Setpoint text validation lives
//! here too, so it runs before any hardware access.

use crate::config::SerialSettings;
use crate::error::{DeviceError, ValidationError};
use crate::protocol::{
    decode_fixed, encode_fixed, GFR_REG_FLOW_HIGH, GFR_REG_GAS, GFR_REG_SETPOINT_HIGH,
    GFR_REG_SETPOINT_LOW,
};
use crate::session::{CallPolicy, ConnectionState, DeviceCore, DeviceKind, OpKind};
use crate::transport::{BusFactory, BusHandle};
use anyhow::{anyhow, Context};
use tracing::info;

/// A raw setpoint request as received from the presentation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetpointRequest {
    /// The raw input text.
    pub raw: String,
}

impl SetpointRequest {
    /// Wraps raw input text.
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Validates the request against the instrument range, returning the
    /// numeric setpoint. Runs entirely before any hardware access.
    pub fn validate(&self, max_sccm: f64) -> Result<f64, ValidationError> {
        let text = self.raw.trim();
        if text.is_empty() {
            return Err(ValidationError::Empty);
        }
        let value: f64 = text
            .parse()
            .map_err(|_| ValidationError::Malformed(text.to_string()))?;
        if !value.is_finite() {
            return Err(ValidationError::Malformed(text.to_string()));
        }
        if !(0.0..=max_sccm).contains(&value) {
            return Err(ValidationError::OutOfRange {
                value,
                min: 0.0,
                max: max_sccm,
            });
        }
        Ok(value)
    }
}

/// Session for the gas-flow regulator.
pub struct RegulatorSession {
    core: DeviceCore,
}

impl RegulatorSession {
    /// Creates a disconnected regulator session using the given bus
    /// factory.
    pub fn new(settings: SerialSettings, factory: BusFactory) -> Self {
        Self {
            core: DeviceCore::new(DeviceKind::Regulator, settings, factory),
        }
    }

    /// Opens the regulator's communication handle. Idempotent when already
    /// connected.
    pub async fn connect(&mut self, resource: &str) -> Result<(), DeviceError> {
        self.core.connect(resource).await?;
        info!(resource, "regulator connected");
        Ok(())
    }

    /// Commands a new flow setpoint. `value` must already be validated;
    /// it is quantized to the instrument's fixed-point step and written
    /// high word then low word.
    ///
    /// If the high-word write succeeds and the low-word write fails, the
    /// whole operation reports one failed write and the high word is not
    /// rolled back.
    pub async fn set_flow(&mut self, value: f64) -> Result<(), DeviceError> {
        let (high, low) = encode_fixed(value);
        self.core
            .guarded(
                "set flow",
                OpKind::Write,
                CallPolicy::hardware(),
                move |slot: &mut Option<BusHandle>| {
                    Box::pin(async move {
                        let bus = slot
                            .as_ref()
                            .ok_or_else(|| anyhow!("no open connection"))?
                            .clone();
                        let mut bus = bus.lock().await;
                        bus.write_register(GFR_REG_SETPOINT_HIGH, high)
                            .await
                            .context("setpoint high word")?;
                        bus.write_register(GFR_REG_SETPOINT_LOW, low)
                            .await
                            .context("setpoint low word")?;
                        Ok(())
                    })
                },
            )
            .await
    }

    /// Reads the measured flow in sccm.
    pub async fn get_flow(&mut self) -> Result<f64, DeviceError> {
        self.read_flow("get flow", CallPolicy::hardware()).await
    }

    /// Reads the measured flow without releasing the handle on failure.
    /// Used by the supervisor's poll loop and the stall-recovery probe,
    /// which must leave the session open so the next attempt can retry.
    pub async fn probe_flow(&mut self) -> Result<f64, DeviceError> {
        self.read_flow("poll flow", CallPolicy::probe()).await
    }

    async fn read_flow(
        &mut self,
        op: &'static str,
        policy: CallPolicy,
    ) -> Result<f64, DeviceError> {
        self.core
            .guarded(
                op,
                OpKind::Read,
                policy,
                |slot: &mut Option<BusHandle>| {
                    Box::pin(async move {
                        let bus = slot
                            .as_ref()
                            .ok_or_else(|| anyhow!("no open connection"))?
                            .clone();
                        let mut bus = bus.lock().await;
                        let registers = bus.read_registers(GFR_REG_FLOW_HIGH, 2).await?;
                        if registers.len() != 2 {
                            return Err(anyhow!(
                                "expected 2 flow registers, device returned {}",
                                registers.len()
                            ));
                        }
                        Ok(decode_fixed(registers[0], registers[1]))
                    })
                },
            )
            .await
    }

    /// Selects the calibrated gas by instrument gas table ID.
    pub async fn set_gas(&mut self, gas_id: u16) -> Result<(), DeviceError> {
        self.core
            .guarded(
                "set gas",
                OpKind::Write,
                CallPolicy::hardware(),
                move |slot: &mut Option<BusHandle>| {
                    Box::pin(async move {
                        let bus = slot
                            .as_ref()
                            .ok_or_else(|| anyhow!("no open connection"))?
                            .clone();
                        let mut bus = bus.lock().await;
                        bus.write_register(GFR_REG_GAS, gas_id).await
                    })
                },
            )
            .await
    }

    /// Releases the handle; idempotent when already disconnected.
    pub async fn disconnect(&mut self) -> Result<(), DeviceError> {
        let result = self.core.disconnect().await;
        if result.is_ok() {
            info!("regulator disconnected");
        }
        result
    }

    pub(crate) async fn force_disconnect(&mut self) {
        self.core.force_disconnect().await;
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.core.set_state(state);
    }

    /// Whether the session holds an open handle. Never touches hardware.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// The resource this session is bound to, while connected.
    pub fn resource(&self) -> Option<&str> {
        self.core.resource()
    }

    /// The error recorded by the most recent operation, if it failed.
    pub fn last_error(&self) -> Option<&DeviceError> {
        self.core.last_error()
    }
}
