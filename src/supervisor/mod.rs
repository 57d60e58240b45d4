//! Runtime fault supervisor.
//!
//! The supervisor is an actor owning both device sessions. A single
//! command mailbox and a timer-driven poll tick interleave only at select
//! granularity, so every operation against one session is serialized — the
//! underlying register transaction is not reentrant. Events fan out to the
//! presentation layer over a broadcast channel; commands reply over
//! oneshot channels.
//!
//! Faults are classified independently per device and never
//! cross-contaminate:
//!
//! - **physical disconnection** — the resource vanished from the host;
//!   terminal, the session is forced closed;
//! - **communication loss** — the resource is still visible but the
//!   operation failed; the session stays degraded and the next poll
//!   retries;
//! - **acquisition stall** — too many consecutive polls without a flow
//!   reading; exactly one bounded recovery probe is issued with
//!   auto-close disabled.

pub mod events;
pub mod shutdown;

use crate::config::SupervisorSettings;
use crate::discovery::{PortEnumerator, StartupReport};
use crate::error::DeviceError;
use crate::session::regulator::{RegulatorSession, SetpointRequest};
use crate::session::relay::RelaySession;
use crate::session::{ConnectionState, DeviceKind};
use crate::protocol::quantize_setpoint;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use events::{DeviceFault, PowerOffOutcome, PowerOnOutcome, SetpointOutcome, SupervisorEvent};
use serde::{Deserialize, Serialize};
use shutdown::ShutdownReport;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

/// One timestamped flow reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// UTC timestamp of the poll that produced the reading.
    pub timestamp: DateTime<Utc>,
    /// Measured flow in sccm.
    pub flow_sccm: f64,
}

/// Snapshot of the supervisor's state, for the presentation layer and
/// tests.
#[derive(Clone, Debug)]
pub struct SupervisorStatus {
    /// Startup classification consumed at construction.
    pub startup: StartupReport,
    /// Relay connection state.
    pub relay_state: ConnectionState,
    /// Regulator connection state.
    pub regulator_state: ConnectionState,
    /// Relay's most recent operation error, if it failed.
    pub relay_error: Option<DeviceError>,
    /// Regulator's most recent operation error, if it failed.
    pub regulator_error: Option<DeviceError>,
    /// Number of samples held for the run.
    pub sample_count: usize,
}

/// Commands accepted by the supervisor mailbox.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Connect both instruments.
    PowerOn {
        /// Resource for the relay.
        relay: String,
        /// Resource for the regulator.
        regulator: String,
        /// Outcome reply.
        reply: oneshot::Sender<PowerOnOutcome>,
    },
    /// Disconnect both instruments.
    PowerOff {
        /// Outcome reply.
        reply: oneshot::Sender<PowerOffOutcome>,
    },
    /// Validate and forward a setpoint request.
    SetFlow {
        /// Raw setpoint text.
        text: String,
        /// Outcome reply.
        reply: oneshot::Sender<SetpointOutcome>,
    },
    /// Select the calibrated gas.
    SetGas {
        /// Instrument gas table ID.
        gas_id: u16,
        /// Outcome reply.
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    /// Snapshot the runtime sample buffer.
    Samples {
        /// Reply with a copy of the buffer.
        reply: oneshot::Sender<Vec<MeasurementSample>>,
    },
    /// Drop all samples held for the run.
    ClearSamples {
        /// Completion reply.
        reply: oneshot::Sender<()>,
    },
    /// Snapshot supervisor state.
    Status {
        /// State reply.
        reply: oneshot::Sender<SupervisorStatus>,
    },
    /// Tear down both sessions behind a confirm gate.
    RequestShutdown {
        /// False cancels: nothing is touched.
        confirmed: bool,
        /// Teardown report reply.
        reply: oneshot::Sender<ShutdownReport>,
    },
}

/// Cloneable front end to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorHandle {
    /// Subscribes to supervisor events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> SupervisorCommand,
    ) -> anyhow::Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("supervisor is no longer running"))?;
        rx.await
            .map_err(|_| anyhow!("supervisor dropped the reply"))
    }

    /// Connects both instruments.
    pub async fn power_on(
        &self,
        relay: impl Into<String>,
        regulator: impl Into<String>,
    ) -> anyhow::Result<PowerOnOutcome> {
        let (relay, regulator) = (relay.into(), regulator.into());
        self.request(|reply| SupervisorCommand::PowerOn {
            relay,
            regulator,
            reply,
        })
        .await
    }

    /// Disconnects both instruments.
    pub async fn power_off(&self) -> anyhow::Result<PowerOffOutcome> {
        self.request(|reply| SupervisorCommand::PowerOff { reply }).await
    }

    /// Validates and forwards a setpoint request.
    pub async fn set_flow(&self, text: impl Into<String>) -> anyhow::Result<SetpointOutcome> {
        let text = text.into();
        self.request(|reply| SupervisorCommand::SetFlow { text, reply })
            .await
    }

    /// Selects the calibrated gas.
    pub async fn set_gas(&self, gas_id: u16) -> anyhow::Result<()> {
        self.request(|reply| SupervisorCommand::SetGas { gas_id, reply })
            .await?
            .map_err(Into::into)
    }

    /// Snapshot of the samples held for the run.
    pub async fn samples(&self) -> anyhow::Result<Vec<MeasurementSample>> {
        self.request(|reply| SupervisorCommand::Samples { reply }).await
    }

    /// Drops all samples held for the run.
    pub async fn clear_samples(&self) -> anyhow::Result<()> {
        self.request(|reply| SupervisorCommand::ClearSamples { reply })
            .await
    }

    /// Snapshot of the supervisor's state.
    pub async fn status(&self) -> anyhow::Result<SupervisorStatus> {
        self.request(|reply| SupervisorCommand::Status { reply }).await
    }

    /// Requests teardown. `confirmed == false` cancels without touching
    /// either session; `true` tears down both and stops the supervisor.
    pub async fn request_shutdown(&self, confirmed: bool) -> anyhow::Result<ShutdownReport> {
        self.request(|reply| SupervisorCommand::RequestShutdown { confirmed, reply })
            .await
    }
}

/// Actor driving startup, runtime monitoring, recovery, and teardown for
/// both device sessions.
pub struct FaultSupervisor {
    relay: RelaySession,
    regulator: RegulatorSession,
    ports: Arc<dyn PortEnumerator>,
    settings: SupervisorSettings,
    startup: StartupReport,
    samples: Vec<MeasurementSample>,
    missed_polls: u32,
    events: broadcast::Sender<SupervisorEvent>,
    commands: mpsc::Receiver<SupervisorCommand>,
}

impl FaultSupervisor {
    /// Builds a supervisor from a startup classification and two freshly
    /// constructed sessions, returning the actor and its handle.
    pub fn new(
        startup: StartupReport,
        relay: RelaySession,
        regulator: RegulatorSession,
        ports: Arc<dyn PortEnumerator>,
        settings: SupervisorSettings,
    ) -> (Self, SupervisorHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(settings.event_capacity.max(1));
        let handle = SupervisorHandle {
            commands: command_tx,
            events: event_tx.clone(),
        };
        let supervisor = Self {
            relay,
            regulator,
            ports,
            settings,
            startup,
            samples: Vec::new(),
            missed_polls: 0,
            events: event_tx,
            commands: command_rx,
        };
        (supervisor, handle)
    }

    /// Runs the supervisor until shutdown is confirmed or every handle is
    /// dropped.
    pub async fn run(mut self) {
        self.emit(SupervisorEvent::StartupClassified(self.startup.clone()));
        match &self.startup {
            report if !report.commands_enabled() => {
                error!("no serial resources available; runtime commands disabled");
            }
            report if report.single_resource_ambiguous => {
                warn!(
                    classification = ?report.classification,
                    "single resource visible; disambiguate before connecting"
                );
            }
            report => info!(classification = ?report.classification, "startup classified"),
        }

        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        info!("all supervisor handles dropped; stopping");
                        break;
                    }
                },
                _ = poll.tick() => self.poll_once().await,
            }
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine; events are best-effort.
        let _ = self.events.send(event);
    }

    async fn handle_command(&mut self, command: SupervisorCommand) -> ControlFlow<()> {
        match command {
            SupervisorCommand::PowerOn {
                relay,
                regulator,
                reply,
            } => {
                let outcome = self.power_on(relay, regulator).await;
                self.emit(SupervisorEvent::PowerOn(outcome.clone()));
                let _ = reply.send(outcome);
            }
            SupervisorCommand::PowerOff { reply } => {
                let outcome = self.power_off().await;
                self.emit(SupervisorEvent::PowerOff(outcome.clone()));
                let _ = reply.send(outcome);
            }
            SupervisorCommand::SetFlow { text, reply } => {
                let outcome = self.set_flow(&text).await;
                self.emit(SupervisorEvent::Setpoint(outcome.clone()));
                let _ = reply.send(outcome);
            }
            SupervisorCommand::SetGas { gas_id, reply } => {
                let result = self.regulator.set_gas(gas_id).await;
                if result.is_ok() {
                    info!(gas_id, "gas selection committed");
                    self.emit(SupervisorEvent::GasSelected { gas_id });
                }
                let _ = reply.send(result);
            }
            SupervisorCommand::Samples { reply } => {
                let _ = reply.send(self.samples.clone());
            }
            SupervisorCommand::ClearSamples { reply } => {
                self.samples.clear();
                let _ = reply.send(());
            }
            SupervisorCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            SupervisorCommand::RequestShutdown { confirmed, reply } => {
                if !confirmed {
                    info!("shutdown cancelled at the confirm gate");
                    let _ = reply.send(ShutdownReport::cancelled());
                    return ControlFlow::Continue(());
                }
                let report = shutdown::run(&mut self.regulator, &mut self.relay).await;
                self.emit(SupervisorEvent::Shutdown(report.clone()));
                let _ = reply.send(report);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            startup: self.startup.clone(),
            relay_state: self.relay.state(),
            regulator_state: self.regulator.state(),
            relay_error: self.relay.last_error().cloned(),
            regulator_error: self.regulator.last_error().cloned(),
            sample_count: self.samples.len(),
        }
    }

    async fn power_on(&mut self, relay_port: String, regulator_port: String) -> PowerOnOutcome {
        if !self.startup.commands_enabled() {
            let refusal = DeviceError::ResourceUnavailable(
                "no serial resources were available at startup".into(),
            );
            return PowerOnOutcome::Attempted {
                relay: Err(refusal.clone()),
                regulator: Err(refusal),
            };
        }
        if relay_port == regulator_port {
            warn!(resource = %relay_port, "power on rejected: shared resource");
            return PowerOnOutcome::Conflict(relay_port);
        }

        // A failure on one device never blocks the other's attempt.
        let relay = self.relay.connect(&relay_port).await;
        let regulator = self.regulator.connect(&regulator_port).await;
        if regulator.is_ok() {
            self.missed_polls = 0;
        }
        PowerOnOutcome::Attempted { relay, regulator }
    }

    async fn power_off(&mut self) -> PowerOffOutcome {
        let regulator = self.regulator.disconnect().await;
        self.missed_polls = 0;

        // Release the relay output before closing its session; a failed
        // write already closes the handle through the boundary.
        let relay = if self.relay.is_connected() {
            match self.relay.turn_off().await {
                Ok(()) => self.relay.disconnect().await,
                Err(error) => Err(error),
            }
        } else {
            Ok(())
        };

        PowerOffOutcome { regulator, relay }
    }

    async fn set_flow(&mut self, text: &str) -> SetpointOutcome {
        if !self.regulator.is_connected() {
            warn!("setpoint ignored: regulator is not connected");
            return SetpointOutcome::NotConnected;
        }
        let request = SetpointRequest::new(text);
        let value = match request.validate(self.settings.max_flow_sccm) {
            Ok(value) => value,
            Err(rejection) => {
                warn!(%rejection, "setpoint rejected before hardware access");
                return SetpointOutcome::Rejected(rejection);
            }
        };
        match self.regulator.set_flow(value).await {
            Ok(()) => {
                let target_sccm = quantize_setpoint(value);
                info!(target_sccm, "setpoint committed");
                SetpointOutcome::Committed { target_sccm }
            }
            Err(error) => SetpointOutcome::WriteFailed(error),
        }
    }

    async fn poll_once(&mut self) {
        let visible = self.ports.visible_ports();
        self.check_relay_liveness(&visible).await;
        self.poll_regulator(&visible).await;
    }

    async fn check_relay_liveness(&mut self, visible: &[String]) {
        if !self.relay.is_connected() {
            return;
        }
        let gone = self
            .relay
            .resource()
            .map(|r| !visible.iter().any(|v| v == r))
            .unwrap_or(false);
        if gone {
            error!("relay resource vanished from the host");
            self.relay.force_disconnect().await;
            self.emit(SupervisorEvent::Fault {
                device: DeviceKind::Relay,
                fault: DeviceFault::PhysicalDisconnection,
            });
        }
    }

    async fn poll_regulator(&mut self, visible: &[String]) {
        if !self.regulator.is_connected() {
            return;
        }

        match self.regulator.probe_flow().await {
            Ok(flow_sccm) => {
                self.missed_polls = 0;
                if self.regulator.state() != ConnectionState::Connected {
                    info!("regulator communication restored");
                    self.regulator.set_state(ConnectionState::Connected);
                }
                self.record_sample(flow_sccm);
            }
            Err(read_error) => {
                let gone = self
                    .regulator
                    .resource()
                    .map(|r| !visible.iter().any(|v| v == r))
                    .unwrap_or(false);
                if gone {
                    error!("regulator resource vanished from the host");
                    self.regulator.force_disconnect().await;
                    self.missed_polls = 0;
                    self.emit(SupervisorEvent::Fault {
                        device: DeviceKind::Regulator,
                        fault: DeviceFault::PhysicalDisconnection,
                    });
                    return;
                }

                self.missed_polls += 1;
                self.regulator.set_state(ConnectionState::Degraded);
                self.emit(SupervisorEvent::Fault {
                    device: DeviceKind::Regulator,
                    fault: DeviceFault::CommunicationLost(read_error),
                });

                if self.missed_polls > self.settings.stall_threshold {
                    self.attempt_stall_recovery().await;
                }
            }
        }
    }

    /// The single bounded recovery attempt for a stalled acquisition: one
    /// re-read with auto-close disabled, serialized with normal polls by
    /// construction.
    async fn attempt_stall_recovery(&mut self) {
        let missed_polls = self.missed_polls;
        warn!(missed_polls, "flow acquisition stalled; issuing recovery probe");
        self.emit(SupervisorEvent::StallWarning { missed_polls });
        self.regulator.set_state(ConnectionState::Recovering);

        match self.regulator.probe_flow().await {
            Ok(flow_sccm) => {
                info!(flow_sccm, "stall recovery succeeded");
                self.regulator.set_state(ConnectionState::Connected);
                self.missed_polls = 0;
                self.record_sample(flow_sccm);
                self.emit(SupervisorEvent::RecoverySucceeded { flow_sccm });
            }
            Err(probe_error) => {
                error!(
                    error = %probe_error,
                    missed_polls,
                    "stall recovery failed; closing the regulator session"
                );
                self.regulator.force_disconnect().await;
                self.missed_polls = 0;
                self.emit(SupervisorEvent::Fault {
                    device: DeviceKind::Regulator,
                    fault: DeviceFault::AcquisitionStalled { missed_polls },
                });
            }
        }
    }

    fn record_sample(&mut self, flow_sccm: f64) {
        let sample = MeasurementSample {
            timestamp: Utc::now(),
            flow_sccm,
        };
        self.samples.push(sample.clone());
        self.emit(SupervisorEvent::SampleRecorded(sample));
    }
}
