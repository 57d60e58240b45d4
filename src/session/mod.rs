//! Device sessions and the safe-call boundary.
//!
//! Every hardware-bound operation funnels through one guarded entry point,
//! [`DeviceCore::guarded`], which owns the common failure discipline:
//! initialized check, error-slot reset, failure normalization, and
//! cleanup-on-failure. The two concrete sessions ([`relay::RelaySession`]
//! and [`regulator::RegulatorSession`]) wrap a [`DeviceCore`] and add their
//! instrument's operations on top.
//!
//! The boundary is reentrancy-safe by construction: all mutable state it
//! touches — the handle slot and the error slot — belongs to the one
//! session passed in, and the two device types never share either.

pub mod regulator;
pub mod relay;

use crate::config::SerialSettings;
use crate::error::DeviceError;
use crate::transport::{BusFactory, BusHandle};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Connection lifecycle of one device session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No open handle.
    Disconnected,
    /// A handle is being opened.
    Connecting,
    /// Handle open, device responding.
    Connected,
    /// Handle open, but the last poll failed; the next poll retries.
    Degraded,
    /// Handle open, the single stall-recovery probe is in flight.
    Recovering,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// The two managed instrument types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Power relay.
    Relay,
    /// Gas-flow regulator.
    Regulator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::Regulator => f.write_str("regulator"),
        }
    }
}

/// Per-session holder of the most recent operation's error.
///
/// Overwritten, never accumulated: cleared at the start of every guarded
/// attempt and set only on failure of that attempt. Each session owns its
/// own slot; nothing is shared across device types.
#[derive(Debug, Default)]
pub struct ErrorSlot(Option<DeviceError>);

impl ErrorSlot {
    /// Resets the slot to "no error".
    pub fn clear(&mut self) {
        self.0 = None;
    }

    /// Records the outcome of a failed attempt.
    pub fn set(&mut self, error: DeviceError) {
        self.0 = Some(error);
    }

    /// The error of the most recent attempt, if it failed.
    pub fn get(&self) -> Option<&DeviceError> {
        self.0.as_ref()
    }
}

/// Policy flags for one guarded invocation.
#[derive(Clone, Copy, Debug)]
pub struct CallPolicy {
    /// Skip the open-handle precondition; only the connect path sets this.
    pub skip_init_check: bool,
    /// Release the handle when the operation fails. Disabled for
    /// operations that must preserve the handle after a soft failure,
    /// such as the stall-recovery probe.
    pub auto_close: bool,
}

impl CallPolicy {
    /// Default policy for hardware operations on an open session.
    pub const fn hardware() -> Self {
        Self {
            skip_init_check: false,
            auto_close: true,
        }
    }

    /// Policy for the connect path itself.
    pub const fn connect() -> Self {
        Self {
            skip_init_check: true,
            auto_close: true,
        }
    }

    /// Policy for probes that must keep the handle alive on failure.
    pub const fn probe() -> Self {
        Self {
            skip_init_check: false,
            auto_close: false,
        }
    }
}

/// What a guarded operation does to the device, used to normalize its
/// failure into the matching error variant.
#[derive(Clone, Copy, Debug)]
pub enum OpKind {
    /// Opens the communication handle.
    Connect,
    /// Reads registers.
    Read,
    /// Writes registers.
    Write,
    /// Releases the communication handle.
    Close,
}

fn normalize(kind: OpKind, op: &str, source: &anyhow::Error) -> DeviceError {
    let detail = format!("{op}: {source:#}");
    match kind {
        OpKind::Connect => DeviceError::ConnectionFailed(detail),
        OpKind::Read => DeviceError::ReadFailed(detail),
        OpKind::Write => DeviceError::WriteFailed(detail),
        OpKind::Close => DeviceError::CommunicationLost(detail),
    }
}

/// State shared by both session variants: the handle slot, the connection
/// state, the error slot, and the injected bus factory.
pub struct DeviceCore {
    kind: DeviceKind,
    settings: SerialSettings,
    factory: BusFactory,
    resource: Option<String>,
    bus: Option<BusHandle>,
    state: ConnectionState,
    last_error: ErrorSlot,
}

impl DeviceCore {
    pub(crate) fn new(kind: DeviceKind, settings: SerialSettings, factory: BusFactory) -> Self {
        Self {
            kind,
            settings,
            factory,
            resource: None,
            bus: None,
            state: ConnectionState::Disconnected,
            last_error: ErrorSlot::default(),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the session holds an open handle. A session with no handle
    /// is closed regardless of prior state. Pure state read; never touches
    /// hardware.
    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    /// The resource this session is bound to, while connected.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The error recorded by the most recent guarded attempt, if any.
    pub fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.get()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if state != self.state {
            debug!(device = %self.kind, from = %self.state, to = %state, "state transition");
        }
        self.state = state;
    }

    /// The safe-call boundary. Executes `op` under `policy`:
    ///
    /// 1. clears the error slot;
    /// 2. unless `policy.skip_init_check`, refuses with
    ///    [`DeviceError::DeviceNotInitialized`] when no handle is open;
    /// 3. invokes the operation with mutable access to the handle slot;
    /// 4. on success returns the result unchanged;
    /// 5. on failure optionally releases the handle (a secondary failure
    ///    during release is logged and swallowed, never masking the
    ///    primary one), normalizes the failure by `kind`, records it in
    ///    the error slot, and returns it.
    pub(crate) async fn guarded<T, F>(
        &mut self,
        op: &'static str,
        kind: OpKind,
        policy: CallPolicy,
        f: F,
    ) -> Result<T, DeviceError>
    where
        F: for<'a> FnOnce(&'a mut Option<BusHandle>) -> BoxFuture<'a, anyhow::Result<T>> + Send,
        T: Send,
    {
        self.last_error.clear();

        if !policy.skip_init_check && self.bus.is_none() {
            warn!(device = %self.kind, op, "operation refused: no open connection");
            let error = DeviceError::DeviceNotInitialized;
            self.last_error.set(error.clone());
            return Err(error);
        }

        let outcome = f(&mut self.bus).await;
        match outcome {
            Ok(value) => Ok(value),
            Err(source) => {
                warn!(device = %self.kind, op, error = %format!("{source:#}"), "operation failed");
                if policy.auto_close {
                    self.release_handle().await;
                }
                let error = normalize(kind, op, &source);
                self.last_error.set(error.clone());
                Err(error)
            }
        }
    }

    /// Opens a handle through the boundary with the initialized check
    /// skipped. No-op success when already connected.
    pub(crate) async fn connect(&mut self, resource: &str) -> Result<(), DeviceError> {
        if self.bus.is_some() {
            debug!(device = %self.kind, resource, "already connected; connect is a no-op");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let factory = Arc::clone(&self.factory);
        let settings = self.settings.clone();
        let target = resource.to_string();

        let result = self
            .guarded(
                "connect",
                OpKind::Connect,
                CallPolicy::connect(),
                move |slot: &mut Option<BusHandle>| {
                    Box::pin(async move {
                        let handle = (*factory)(target, settings).await?;
                        *slot = Some(handle);
                        Ok(())
                    })
                },
            )
            .await;

        match result {
            Ok(()) => {
                self.resource = Some(resource.to_string());
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(error) => {
                self.set_state(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    /// Releases the handle unconditionally when present; idempotent when
    /// already disconnected.
    pub(crate) async fn disconnect(&mut self) -> Result<(), DeviceError> {
        if self.bus.is_none() {
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        let result = self
            .guarded(
                "disconnect",
                OpKind::Close,
                CallPolicy::hardware(),
                |slot: &mut Option<BusHandle>| {
                    Box::pin(async move {
                        if let Some(bus) = slot.take() {
                            bus.lock().await.close().await?;
                        }
                        Ok(())
                    })
                },
            )
            .await;

        self.resource = None;
        self.set_state(ConnectionState::Disconnected);
        result
    }

    /// Drops the handle without reporting an error, for terminal faults
    /// such as physical disconnection.
    pub(crate) async fn force_disconnect(&mut self) {
        self.release_handle().await;
        self.resource = None;
    }

    async fn release_handle(&mut self) {
        if let Some(bus) = self.bus.take() {
            if let Err(close_error) = bus.lock().await.close().await {
                warn!(
                    device = %self.kind,
                    error = %format!("{close_error:#}"),
                    "handle release failed during cleanup"
                );
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockRegisterBus;
    use anyhow::anyhow;

    async fn connected_core(bus: &MockRegisterBus) -> DeviceCore {
        let mut core = DeviceCore::new(
            DeviceKind::Regulator,
            SerialSettings::regulator(),
            bus.factory(),
        );
        core.connect("P2").await.expect("mock connect");
        core
    }

    #[tokio::test]
    async fn init_check_refuses_without_handle() {
        let bus = MockRegisterBus::new();
        let mut core = DeviceCore::new(
            DeviceKind::Relay,
            SerialSettings::relay(),
            bus.factory(),
        );
        let result: Result<(), _> = core
            .guarded(
                "turn on",
                OpKind::Write,
                CallPolicy::hardware(),
                |_slot: &mut Option<BusHandle>| Box::pin(async { Ok(()) }),
            )
            .await;
        assert_eq!(result, Err(DeviceError::DeviceNotInitialized));
        assert_eq!(core.last_error(), Some(&DeviceError::DeviceNotInitialized));
        // The operation body never ran.
        assert_eq!(bus.writes(), 0);
    }

    #[tokio::test]
    async fn slot_cleared_at_attempt_start_and_set_on_failure() {
        let bus = MockRegisterBus::new();
        let mut core = connected_core(&bus).await;

        let failed: Result<(), _> = core
            .guarded(
                "probe",
                OpKind::Read,
                CallPolicy::probe(),
                |_slot: &mut Option<BusHandle>| Box::pin(async { Err(anyhow!("boom")) }),
            )
            .await;
        assert!(matches!(failed, Err(DeviceError::ReadFailed(_))));
        assert!(core.last_error().is_some());

        let ok: Result<u16, _> = core
            .guarded(
                "probe",
                OpKind::Read,
                CallPolicy::probe(),
                |_slot: &mut Option<BusHandle>| Box::pin(async { Ok(7) }),
            )
            .await;
        assert_eq!(ok, Ok(7));
        // A successful attempt leaves the slot cleared.
        assert!(core.last_error().is_none());
    }

    #[tokio::test]
    async fn auto_close_releases_handle_on_failure() {
        let bus = MockRegisterBus::new();
        let mut core = connected_core(&bus).await;

        let _: Result<(), _> = core
            .guarded(
                "set gas",
                OpKind::Write,
                CallPolicy::hardware(),
                |_slot: &mut Option<BusHandle>| Box::pin(async { Err(anyhow!("refused")) }),
            )
            .await;
        assert!(!core.is_connected());
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert_eq!(bus.closes(), 1);
    }

    #[tokio::test]
    async fn probe_policy_preserves_handle_on_failure() {
        let bus = MockRegisterBus::new();
        let mut core = connected_core(&bus).await;

        let _: Result<(), _> = core
            .guarded(
                "recovery probe",
                OpKind::Read,
                CallPolicy::probe(),
                |_slot: &mut Option<BusHandle>| Box::pin(async { Err(anyhow!("stalled")) }),
            )
            .await;
        assert!(core.is_connected());
        assert_eq!(bus.closes(), 0);
    }

    #[tokio::test]
    async fn secondary_close_failure_never_masks_the_primary() {
        let bus = MockRegisterBus::new();
        let mut core = connected_core(&bus).await;
        bus.fail_close(true);

        let result: Result<(), _> = core
            .guarded(
                "set flow",
                OpKind::Write,
                CallPolicy::hardware(),
                |_slot: &mut Option<BusHandle>| Box::pin(async { Err(anyhow!("write refused")) }),
            )
            .await;
        // The reported failure is the write, not the close.
        match result {
            Err(DeviceError::WriteFailed(detail)) => assert!(detail.contains("write refused")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!core.is_connected());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let bus = MockRegisterBus::new();
        let mut core = connected_core(&bus).await;
        core.connect("P2").await.expect("second connect");
        assert_eq!(core.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn failed_connect_returns_to_disconnected() {
        let mut core = DeviceCore::new(
            DeviceKind::Relay,
            SerialSettings::relay(),
            MockRegisterBus::refusing_factory("no such resource"),
        );
        let result = core.connect("P9").await;
        assert!(matches!(result, Err(DeviceError::ConnectionFailed(_))));
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(!core.is_connected());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let bus = MockRegisterBus::new();
        let mut core = connected_core(&bus).await;
        core.disconnect().await.expect("first disconnect");
        core.disconnect().await.expect("second disconnect");
        assert_eq!(bus.closes(), 1);
        assert_eq!(core.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_disconnect_still_drops_the_handle() {
        let bus = MockRegisterBus::new();
        let mut core = connected_core(&bus).await;
        bus.fail_close(true);

        let result = core.disconnect().await;
        assert!(matches!(result, Err(DeviceError::CommunicationLost(_))));
        assert!(!core.is_connected());
    }
}
