//! End-to-end scenarios against the fault supervisor with mock buses.

use flow_daq::config::{PortAssignment, SerialSettings, SupervisorSettings};
use flow_daq::discovery::{self, PortEnumerator, StartupClassification, StaticPorts};
use flow_daq::error::{DeviceError, ValidationError};
use flow_daq::session::regulator::RegulatorSession;
use flow_daq::session::relay::RelaySession;
use flow_daq::session::{ConnectionState, DeviceKind};
use flow_daq::supervisor::events::{
    DeviceFault, PowerOnOutcome, SetpointOutcome, SupervisorEvent,
};
use flow_daq::supervisor::{FaultSupervisor, SupervisorHandle};
use flow_daq::transport::mock::MockRegisterBus;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Enumerator whose visible list tests can mutate mid-run.
#[derive(Clone, Default)]
struct SharedPorts(Arc<Mutex<Vec<String>>>);

impl SharedPorts {
    fn new(names: &[&str]) -> Self {
        Self(Arc::new(Mutex::new(
            names.iter().map(|n| n.to_string()).collect(),
        )))
    }

    fn remove(&self, name: &str) {
        self.0.lock().unwrap().retain(|p| p != name);
    }

    fn add(&self, name: &str) {
        self.0.lock().unwrap().push(name.to_string());
    }
}

impl PortEnumerator for SharedPorts {
    fn visible_ports(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct Rig {
    handle: SupervisorHandle,
    events: broadcast::Receiver<SupervisorEvent>,
    relay_bus: MockRegisterBus,
    regulator_bus: MockRegisterBus,
    runner: JoinHandle<()>,
}

fn rig_with_ports(ports: Arc<dyn PortEnumerator>, assignment: &PortAssignment) -> Rig {
    let relay_bus = MockRegisterBus::new();
    let regulator_bus = MockRegisterBus::new();

    let relay = RelaySession::new(SerialSettings::relay(), relay_bus.factory());
    let regulator = RegulatorSession::new(SerialSettings::regulator(), regulator_bus.factory());

    let report = discovery::classify(assignment, &ports.visible_ports());
    let settings = SupervisorSettings {
        poll_interval: Duration::from_millis(10),
        ..SupervisorSettings::default()
    };

    let (supervisor, handle) = FaultSupervisor::new(report, relay, regulator, ports, settings);
    let events = handle.subscribe();
    let runner = tokio::spawn(supervisor.run());

    Rig {
        handle,
        events,
        relay_bus,
        regulator_bus,
        runner,
    }
}

fn rig(visible: &[&str], assignment: &PortAssignment) -> Rig {
    rig_with_ports(
        Arc::new(StaticPorts(
            visible.iter().map(|n| n.to_string()).collect(),
        )),
        assignment,
    )
}

fn saved(relay: &str, regulator: &str) -> PortAssignment {
    PortAssignment {
        relay: Some(relay.to_string()),
        regulator: Some(regulator.to_string()),
    }
}

/// Waits for the first event matching the predicate, skipping others
/// (sample traffic in particular).
async fn wait_for<F>(events: &mut broadcast::Receiver<SupervisorEvent>, mut pred: F) -> SupervisorEvent
where
    F: FnMut(&SupervisorEvent) -> bool,
{
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event stream closed while waiting")
                }
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn scenario_a_both_available_and_connectable() {
    let assignment = saved("P1", "P2");
    let mut rig = rig(&["P1", "P2"], &assignment);

    let startup = wait_for(&mut rig.events, |e| {
        matches!(e, SupervisorEvent::StartupClassified(_))
    })
    .await;
    match startup {
        SupervisorEvent::StartupClassified(report) => {
            assert_eq!(report.classification, StartupClassification::BothAvailable);
            assert!(!report.single_resource_ambiguous);
        }
        _ => unreachable!(),
    }

    let outcome = rig.handle.power_on("P1", "P2").await.unwrap();
    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.relay_state, ConnectionState::Connected);
    assert_eq!(status.regulator_state, ConnectionState::Connected);
}

#[tokio::test]
async fn scenario_b_shared_resource_conflict_opens_nothing() {
    let assignment = saved("P1", "P1");
    let rig = rig(&["P1", "P2"], &assignment);

    let outcome = rig.handle.power_on("P1", "P1").await.unwrap();
    assert_eq!(outcome, PowerOnOutcome::Conflict("P1".to_string()));

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.relay_state, ConnectionState::Disconnected);
    assert_eq!(status.regulator_state, ConnectionState::Disconnected);
    // Neither bus saw any traffic.
    assert_eq!(rig.relay_bus.writes() + rig.relay_bus.reads(), 0);
    assert_eq!(rig.regulator_bus.writes() + rig.regulator_bus.reads(), 0);
}

#[tokio::test]
async fn scenario_c_stall_recovery_succeeds() {
    let assignment = saved("P1", "P2");
    let mut rig = rig(&["P1", "P2"], &assignment);

    rig.handle.power_on("P1", "P2").await.unwrap();
    // Three polls fail, then the recovery probe's read succeeds.
    rig.regulator_bus.fail_next_reads(3);

    wait_for(&mut rig.events, |e| {
        matches!(e, SupervisorEvent::StallWarning { .. })
    })
    .await;
    wait_for(&mut rig.events, |e| {
        matches!(e, SupervisorEvent::RecoverySucceeded { .. })
    })
    .await;

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.regulator_state, ConnectionState::Connected);
}

#[tokio::test]
async fn scenario_c_stall_recovery_fails_fatally() {
    let assignment = saved("P1", "P2");
    let mut rig = rig(&["P1", "P2"], &assignment);

    rig.handle.power_on("P1", "P2").await.unwrap();
    rig.regulator_bus.fail_reads(true);

    wait_for(&mut rig.events, |e| {
        matches!(e, SupervisorEvent::StallWarning { .. })
    })
    .await;
    let fault = wait_for(&mut rig.events, |e| {
        matches!(
            e,
            SupervisorEvent::Fault {
                device: DeviceKind::Regulator,
                fault: DeviceFault::AcquisitionStalled { .. },
            }
        )
    })
    .await;
    match fault {
        SupervisorEvent::Fault {
            fault: DeviceFault::AcquisitionStalled { missed_polls },
            ..
        } => assert!(missed_polls > 2),
        _ => unreachable!(),
    }

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.regulator_state, ConnectionState::Disconnected);
    // The relay is untouched by the regulator's fault.
    assert_eq!(status.relay_state, ConnectionState::Connected);
    assert!(status.relay_error.is_none());
}

#[tokio::test]
async fn scenario_d_empty_setpoint_leaves_error_slot_alone() {
    let assignment = saved("P1", "P2");
    let rig = rig(&["P1", "P2"], &assignment);

    rig.handle.power_on("P1", "P2").await.unwrap();
    let writes_before = rig.regulator_bus.writes();

    for text in ["", "   ", "abc", "-5", "999999"] {
        let outcome = rig.handle.set_flow(text).await.unwrap();
        assert!(
            matches!(outcome, SetpointOutcome::Rejected(_)),
            "'{text}' should be rejected, got {outcome:?}"
        );
    }
    assert_eq!(
        rig.handle.set_flow("").await.unwrap(),
        SetpointOutcome::Rejected(ValidationError::Empty)
    );

    // No hardware call was made and the slot reflects no failed attempt.
    assert_eq!(rig.regulator_bus.writes(), writes_before);
    let status = rig.handle.status().await.unwrap();
    assert!(status.regulator_error.is_none());
    assert_eq!(status.regulator_state, ConnectionState::Connected);
}

#[tokio::test]
async fn scenario_e_shutdown_reports_only_the_failing_device() {
    let assignment = saved("P1", "P2");
    let rig = rig(&["P1", "P2"], &assignment);

    rig.handle.power_on("P1", "P2").await.unwrap();
    rig.regulator_bus.fail_close(true);

    let report = rig.handle.request_shutdown(true).await.unwrap();
    assert!(report.regulator.is_some());
    assert!(report.relay.is_none());
    assert!(report.unclassified.is_empty());

    // The supervisor stopped; process exit is not blocked.
    rig.runner.await.unwrap();
    assert!(rig.handle.status().await.is_err());
}

#[tokio::test]
async fn unconfirmed_shutdown_touches_nothing() {
    let assignment = saved("P1", "P2");
    let rig = rig(&["P1", "P2"], &assignment);

    rig.handle.power_on("P1", "P2").await.unwrap();
    let report = rig.handle.request_shutdown(false).await.unwrap();
    assert!(report.cancelled);

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.relay_state, ConnectionState::Connected);
    assert_eq!(status.regulator_state, ConnectionState::Connected);
}

#[tokio::test]
async fn single_device_connect_failure_does_not_block_the_other() {
    let assignment = saved("P1", "P2");
    let ports = Arc::new(StaticPorts(vec!["P1".into(), "P2".into()]));

    let relay = RelaySession::new(
        SerialSettings::relay(),
        MockRegisterBus::refusing_factory("relay port wedged"),
    );
    let regulator_bus = MockRegisterBus::new();
    let regulator = RegulatorSession::new(SerialSettings::regulator(), regulator_bus.factory());

    let report = discovery::classify(&assignment, &ports.visible_ports());
    let (supervisor, handle) = FaultSupervisor::new(
        report,
        relay,
        regulator,
        ports,
        SupervisorSettings {
            poll_interval: Duration::from_millis(10),
            ..SupervisorSettings::default()
        },
    );
    tokio::spawn(supervisor.run());

    let outcome = handle.power_on("P1", "P2").await.unwrap();
    match outcome {
        PowerOnOutcome::Attempted { relay, regulator } => {
            assert!(matches!(relay, Err(DeviceError::ConnectionFailed(_))));
            assert_eq!(regulator, Ok(()));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let status = handle.status().await.unwrap();
    assert_eq!(status.relay_state, ConnectionState::Disconnected);
    assert_eq!(status.regulator_state, ConnectionState::Connected);
}

#[tokio::test]
async fn none_available_disables_power_on() {
    let assignment = saved("P1", "P2");
    let rig = rig(&[], &assignment);

    let outcome = rig.handle.power_on("P1", "P2").await.unwrap();
    match outcome {
        PowerOnOutcome::Attempted { relay, regulator } => {
            assert!(matches!(relay, Err(DeviceError::ResourceUnavailable(_))));
            assert!(matches!(
                regulator,
                Err(DeviceError::ResourceUnavailable(_))
            ));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(rig.relay_bus.writes() + rig.relay_bus.reads(), 0);
    assert_eq!(rig.regulator_bus.writes() + rig.regulator_bus.reads(), 0);
}

#[tokio::test]
async fn physical_disconnection_is_terminal_per_device() {
    let assignment = saved("P1", "P2");
    let ports = SharedPorts::new(&["P1", "P2"]);
    let mut rig = rig_with_ports(Arc::new(ports.clone()), &assignment);

    rig.handle.power_on("P1", "P2").await.unwrap();

    // Unplug the regulator: its reads fail and its resource vanishes.
    rig.regulator_bus.fail_reads(true);
    ports.remove("P2");

    wait_for(&mut rig.events, |e| {
        matches!(
            e,
            SupervisorEvent::Fault {
                device: DeviceKind::Regulator,
                fault: DeviceFault::PhysicalDisconnection,
            }
        )
    })
    .await;

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.regulator_state, ConnectionState::Disconnected);
    assert_eq!(status.relay_state, ConnectionState::Connected);

    // A fresh connect brings the device back once the resource returns.
    ports.add("P2");
    rig.regulator_bus.fail_reads(false);
    let outcome = rig.handle.power_on("P1", "P2").await.unwrap();
    assert!(outcome.is_success());
}

#[tokio::test]
async fn communication_loss_degrades_and_recovers_on_next_poll() {
    let assignment = saved("P1", "P2");
    let mut rig = rig(&["P1", "P2"], &assignment);

    rig.handle.power_on("P1", "P2").await.unwrap();

    // One transient failure: degraded, then restored by the next poll
    // before the stall threshold is reached.
    rig.regulator_bus.fail_next_reads(1);

    wait_for(&mut rig.events, |e| {
        matches!(
            e,
            SupervisorEvent::Fault {
                device: DeviceKind::Regulator,
                fault: DeviceFault::CommunicationLost(_),
            }
        )
    })
    .await;
    wait_for(&mut rig.events, |e| {
        matches!(e, SupervisorEvent::SampleRecorded(_))
    })
    .await;

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.regulator_state, ConnectionState::Connected);
}

#[tokio::test]
async fn samples_accumulate_until_explicitly_cleared() {
    let assignment = saved("P1", "P2");
    let mut rig = rig(&["P1", "P2"], &assignment);

    rig.handle.power_on("P1", "P2").await.unwrap();
    rig.regulator_bus
        .set_register(flow_daq::protocol::GFR_REG_FLOW_HIGH, 0x0001);
    rig.regulator_bus
        .set_register(flow_daq::protocol::GFR_REG_FLOW_LOW, 0x8894);

    wait_for(&mut rig.events, |e| {
        matches!(e, SupervisorEvent::SampleRecorded(sample) if (sample.flow_sccm - 100.5).abs() < 0.001)
    })
    .await;

    let samples = rig.handle.samples().await.unwrap();
    assert!(!samples.is_empty());
    assert!((samples[samples.len() - 1].flow_sccm - 100.5).abs() < 0.001);

    rig.handle.clear_samples().await.unwrap();
    // New samples keep arriving after the clear; only the explicit request
    // empties the buffer, so just confirm the command worked at the time.
    let status = rig.handle.status().await.unwrap();
    assert!(status.sample_count <= rig.handle.samples().await.unwrap().len());
}
