//! Console front end for the flow supervisor.
//!
//! Wires the engine to a minimal line-oriented command loop and prints
//! supervisor events as they arrive. Resource names come from the command
//! line; everything else uses the instruments' factory settings.

use clap::Parser;
use flow_daq::config::{PortAssignment, SerialSettings, SupervisorSettings};
use flow_daq::discovery::{self, PortEnumerator, SystemPorts};
use flow_daq::session::regulator::RegulatorSession;
use flow_daq::session::relay::RelaySession;
use flow_daq::supervisor::events::SupervisorEvent;
use flow_daq::supervisor::{FaultSupervisor, SupervisorHandle};
use flow_daq::transport::serial::serial_bus_factory;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "flow_daq", about = "Gas-flow regulator and relay supervisor")]
struct Args {
    /// Saved serial resource for the power relay.
    #[arg(long)]
    relay: Option<String>,

    /// Saved serial resource for the gas-flow regulator.
    #[arg(long)]
    regulator: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let assignment = PortAssignment {
        relay: args.relay,
        regulator: args.regulator,
    };

    let ports: Arc<dyn PortEnumerator> = Arc::new(SystemPorts);
    let visible = ports.visible_ports();
    info!(?visible, "visible serial resources");
    let report = discovery::classify(&assignment, &visible);

    let factory = serial_bus_factory();
    let relay = RelaySession::new(SerialSettings::relay(), Arc::clone(&factory));
    let regulator = RegulatorSession::new(SerialSettings::regulator(), factory);

    let (supervisor, handle) = FaultSupervisor::new(
        report,
        relay,
        regulator,
        ports,
        SupervisorSettings::default(),
    );

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let runner = tokio::spawn(supervisor.run());
    command_loop(&handle, &assignment).await?;
    // Releasing the last handle stops the supervisor if the loop exited
    // without a confirmed shutdown (e.g. stdin closed).
    drop(handle);
    runner.await?;
    Ok(())
}

fn print_event(event: &SupervisorEvent) {
    match event {
        // Sample traffic is high-rate; keep it off the console.
        SupervisorEvent::SampleRecorded(_) => {}
        other => println!("event: {other:?}"),
    }
}

async fn command_loop(handle: &SupervisorHandle, assignment: &PortAssignment) -> anyhow::Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    print_help();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else { break };
        let mut words = line.split_whitespace();

        match words.next() {
            Some("on") => {
                let relay = words
                    .next()
                    .map(String::from)
                    .or_else(|| assignment.relay.clone());
                let regulator = words
                    .next()
                    .map(String::from)
                    .or_else(|| assignment.regulator.clone());
                match (relay, regulator) {
                    (Some(relay), Some(regulator)) => {
                        let outcome = handle.power_on(relay, regulator).await?;
                        println!("{outcome:?}");
                    }
                    _ => println!("usage: on [<relay-resource> <regulator-resource>]"),
                }
            }
            Some("off") => {
                let outcome = handle.power_off().await?;
                println!("{outcome:?}");
            }
            Some("flow") => {
                let text = words.collect::<Vec<_>>().join(" ");
                let outcome = handle.set_flow(text).await?;
                println!("{outcome:?}");
            }
            Some("gas") => match words.next().map(str::parse::<u16>) {
                Some(Ok(gas_id)) => match handle.set_gas(gas_id).await {
                    Ok(()) => println!("gas {gas_id} selected"),
                    Err(error) => println!("gas selection failed: {error:#}"),
                },
                _ => println!("usage: gas <id>"),
            },
            Some("status") => println!("{:?}", handle.status().await?),
            Some("samples") => {
                let samples = handle.samples().await?;
                println!("{} sample(s)", samples.len());
                for sample in samples.iter().rev().take(5) {
                    println!("  {} {:.3} sccm", sample.timestamp, sample.flow_sccm);
                }
            }
            Some("clear") => {
                handle.clear_samples().await?;
                println!("samples cleared");
            }
            Some("quit") | Some("exit") => {
                print!("really exit? [y/N] ");
                std::io::stdout().flush()?;
                let confirmed = matches!(
                    lines.next_line().await?.as_deref().map(str::trim),
                    Some("y") | Some("Y") | Some("yes")
                );
                let report = handle.request_shutdown(confirmed).await?;
                if report.cancelled {
                    println!("shutdown cancelled");
                    continue;
                }
                if let Some(error) = report.as_error() {
                    // Never blocks exit; report and leave.
                    println!("shutdown finished with failures: {error}");
                }
                break;
            }
            Some("help") => print_help(),
            Some(other) => println!("unknown command '{other}' (try 'help')"),
            None => {}
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        "commands:\n  on [<relay> <regulator>]  connect both instruments\n  off                       disconnect both instruments\n  flow <sccm>               send a flow setpoint\n  gas <id>                  select the calibrated gas\n  status                    show session states\n  samples                   show recent flow samples\n  clear                     drop the sample buffer\n  quit                      confirm and exit"
    );
}
