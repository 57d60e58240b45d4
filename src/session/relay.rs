//! Power relay session.

use crate::config::SerialSettings;
use crate::error::DeviceError;
use crate::protocol::RELAY_REG_POWER;
use crate::session::{CallPolicy, ConnectionState, DeviceCore, DeviceKind, OpKind};
use crate::transport::{BusFactory, BusHandle};
use anyhow::anyhow;
use tracing::info;

/// Session for the power relay: one boolean-coded register.
pub struct RelaySession {
    core: DeviceCore,
}

impl RelaySession {
    /// Creates a disconnected relay session using the given bus factory.
    pub fn new(settings: SerialSettings, factory: BusFactory) -> Self {
        Self {
            core: DeviceCore::new(DeviceKind::Relay, settings, factory),
        }
    }

    /// Opens the relay's communication handle. Idempotent when already
    /// connected.
    pub async fn connect(&mut self, resource: &str) -> Result<(), DeviceError> {
        self.core.connect(resource).await?;
        info!(resource, "relay connected");
        Ok(())
    }

    /// Energizes the relay output.
    pub async fn turn_on(&mut self) -> Result<(), DeviceError> {
        self.write_power("turn relay on", 1).await
    }

    /// Releases the relay output.
    pub async fn turn_off(&mut self) -> Result<(), DeviceError> {
        self.write_power("turn relay off", 0).await
    }

    async fn write_power(&mut self, op: &'static str, value: u16) -> Result<(), DeviceError> {
        self.core
            .guarded(
                op,
                OpKind::Write,
                CallPolicy::hardware(),
                move |slot: &mut Option<BusHandle>| {
                    Box::pin(async move {
                        let bus = slot
                            .as_ref()
                            .ok_or_else(|| anyhow!("no open connection"))?
                            .clone();
                        let mut bus = bus.lock().await;
                        bus.write_register(RELAY_REG_POWER, value).await
                    })
                },
            )
            .await
    }

    /// Releases the handle; idempotent when already disconnected.
    pub async fn disconnect(&mut self) -> Result<(), DeviceError> {
        let result = self.core.disconnect().await;
        if result.is_ok() {
            info!("relay disconnected");
        }
        result
    }

    pub(crate) async fn force_disconnect(&mut self) {
        self.core.force_disconnect().await;
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
