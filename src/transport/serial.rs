//! Serial register bus over RS-232/RS-485.
//!
//! Wraps the `serialport` crate and provides async I/O by moving the
//! blocking transaction onto Tokio's blocking task executor. Each
//! transaction writes one request frame and reads the delimited response
//! under the per-operation timeout; a timeout is an ordinary failure, not
//! a cancellation.

use crate::config::SerialSettings;
use crate::transport::{BusFactory, BusHandle, RegisterBus};
use async_trait::async_trait;
use std::sync::Arc;

#[cfg(feature = "instrument_serial")]
use crate::protocol::rtu;
#[cfg(feature = "instrument_serial")]
use crate::transport::into_handle;

#[cfg(feature = "instrument_serial")]
use crate::config::Parity;
#[cfg(feature = "instrument_serial")]
use anyhow::{bail, Context};
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::Read;
#[cfg(feature = "instrument_serial")]
use std::time::{Duration, Instant};
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Register bus speaking Modbus RTU over a serial port.
pub struct SerialRegisterBus {
    resource: String,
    slave_id: u8,
    #[cfg(feature = "instrument_serial")]
    timeout: Duration,
    #[cfg(feature = "instrument_serial")]
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

#[cfg(feature = "instrument_serial")]
impl SerialRegisterBus {
    /// Opens the named serial resource with the given link parameters.
    pub async fn open(resource: &str, settings: &SerialSettings) -> anyhow::Result<Self> {
        let builder = serialport::new(resource, settings.baud_rate)
            .data_bits(match settings.data_bits {
                7 => serialport::DataBits::Seven,
                _ => serialport::DataBits::Eight,
            })
            .stop_bits(match settings.stop_bits {
                2 => serialport::StopBits::Two,
                _ => serialport::StopBits::One,
            })
            .parity(match settings.parity {
                Parity::None => serialport::Parity::None,
                Parity::Even => serialport::Parity::Even,
                Parity::Odd => serialport::Parity::Odd,
            })
            // Internal read timeout; the transaction deadline governs overall.
            .timeout(Duration::from_millis(10));

        let resource_owned = resource.to_string();
        let port = tokio::task::spawn_blocking(move || builder.open())
            .await
            .context("serial open task panicked")?
            .with_context(|| format!("failed to open serial resource '{resource_owned}'"))?;

        debug!(resource, baud = settings.baud_rate, "serial resource opened");

        Ok(Self {
            resource: resource.to_string(),
            slave_id: settings.slave_id,
            timeout: settings.timeout,
            port: Arc::new(Mutex::new(port)),
        })
    }

    /// Writes one request frame and reads the response, on the blocking
    /// executor. `expected_len` is the well-formed response length; an
    /// exception response is shorter and returned as-is for the parser to
    /// reject.
    async fn transact(&self, request: Vec<u8>, expected_len: usize) -> anyhow::Result<Vec<u8>> {
        let port = Arc::clone(&self.port);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            use std::io::Write;

            let mut guard = port.blocking_lock();
            guard
                .write_all(&request)
                .context("failed to write request frame")?;
            guard.flush().context("failed to flush serial port")?;

            let mut response = vec![0u8; expected_len];
            let mut filled = 0;
            let mut expected = expected_len;
            let deadline = Instant::now() + timeout;

            while filled < expected {
                if Instant::now() > deadline {
                    bail!("response timeout after {timeout:?}");
                }
                match guard.read(&mut response[filled..expected]) {
                    Ok(0) => bail!("unexpected EOF from serial port"),
                    Ok(n) => {
                        filled += n;
                        // An exception reply replaces the normal frame and
                        // is always five bytes.
                        if filled >= 2
                            && response[1] & 0x80 != 0
                            && expected != rtu::EXCEPTION_FRAME_LEN
                        {
                            expected = rtu::EXCEPTION_FRAME_LEN;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e).context("serial read error"),
                }
            }
            response.truncate(expected);
            Ok(response)
        })
        .await
        .context("serial I/O task panicked")?
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl RegisterBus for SerialRegisterBus {
    async fn read_registers(&mut self, address: u16, count: u16) -> anyhow::Result<Vec<u16>> {
        let request = rtu::read_holding_request(self.slave_id, address, count);
        let response = self.transact(request, rtu::read_response_len(count)).await?;
        let registers = rtu::parse_read_response(&response, self.slave_id, count)?;
        debug!(
            resource = %self.resource,
            address,
            count,
            "read holding registers"
        );
        Ok(registers)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> anyhow::Result<()> {
        let request = rtu::write_single_request(self.slave_id, address, value);
        let response = self.transact(request, rtu::WRITE_RESPONSE_LEN).await?;
        rtu::parse_write_response(&response, self.slave_id, address, value)?;
        debug!(resource = %self.resource, address, value, "wrote register");
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        // Dropping the handle releases the OS resource; nothing buffered
        // survives an RTU transaction, so there is nothing to drain.
        debug!(resource = %self.resource, "serial resource closed");
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl RegisterBus for SerialRegisterBus {
    async fn read_registers(&mut self, _address: u16, _count: u16) -> anyhow::Result<Vec<u16>> {
        let _ = (&self.resource, self.slave_id);
        Err(anyhow::anyhow!(
            "serial support not enabled; rebuild with --features instrument_serial"
        ))
    }

    async fn write_register(&mut self, _address: u16, _value: u16) -> anyhow::Result<()> {
        Err(anyhow::anyhow!(
            "serial support not enabled; rebuild with --features instrument_serial"
        ))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Factory opening [`SerialRegisterBus`] handles for device sessions.
#[cfg(feature = "instrument_serial")]
pub fn serial_bus_factory() -> BusFactory {
    Arc::new(|resource: String, settings: SerialSettings| {
        Box::pin(async move {
            let bus = SerialRegisterBus::open(&resource, &settings).await?;
            let handle: BusHandle = into_handle(bus);
            Ok(handle)
        })
    })
}

/// Without serial support every open attempt fails with a rebuild hint.
#[cfg(not(feature = "instrument_serial"))]
pub fn serial_bus_factory() -> BusFactory {
    Arc::new(|resource: String, _settings: SerialSettings| {
        Box::pin(async move {
            Err::<BusHandle, _>(anyhow::anyhow!(
                "cannot open '{resource}': serial support not enabled; \
                 rebuild with --features instrument_serial"
            ))
        })
    })
}
