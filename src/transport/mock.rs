//! In-memory register bus for tests and hardware-free development.
//!
//! The mock keeps a shared register map behind an `Arc`, so a test can hold
//! a clone of the bus it handed to a session and script failures or inspect
//! registers while the session operates on it.

use crate::config::SerialSettings;
use crate::transport::{into_handle, BusFactory, BusHandle, RegisterBus};
use anyhow::bail;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockState {
    registers: HashMap<u16, u16>,
    fail_reads: bool,
    failing_reads_left: u32,
    fail_writes: bool,
    writes_before_failure: Option<u32>,
    fail_close: bool,
    reads: u32,
    writes: u32,
    closes: u32,
}

/// Scriptable register bus backed by a shared in-memory register map.
#[derive(Clone, Debug, Default)]
pub struct MockRegisterBus {
    state: Arc<Mutex<MockState>>,
}

impl MockRegisterBus {
    /// Creates an empty mock bus; unset registers read as zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // The mock's lock is never held across an await and never poisoned
        // outside a failing test.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Presets a register value.
    pub fn set_register(&self, address: u16, value: u16) {
        self.lock().registers.insert(address, value);
    }

    /// Reads back a register written by the session under test.
    pub fn register(&self, address: u16) -> Option<u16> {
        self.lock().registers.get(&address).copied()
    }

    /// Makes every subsequent read fail.
    pub fn fail_reads(&self, on: bool) {
        self.lock().fail_reads = on;
    }

    /// Fails the next `count` reads, then lets reads succeed again.
    pub fn fail_next_reads(&self, count: u32) {
        self.lock().failing_reads_left = count;
    }

    /// Makes every subsequent write fail.
    pub fn fail_writes(&self, on: bool) {
        self.lock().fail_writes = on;
    }

    /// Lets `count` more writes succeed, then fails the rest.
    pub fn fail_writes_after(&self, count: u32) {
        self.lock().writes_before_failure = Some(count);
    }

    /// Makes `close` fail, for exercising cleanup-failure paths.
    pub fn fail_close(&self, on: bool) {
        self.lock().fail_close = on;
    }

    /// Number of reads attempted against this bus.
    pub fn reads(&self) -> u32 {
        self.lock().reads
    }

    /// Number of writes attempted against this bus.
    pub fn writes(&self) -> u32 {
        self.lock().writes
    }

    /// Number of times the bus was closed.
    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    /// Bus factory handing sessions a clone of this mock, so the test
    /// retains scripting access after the session connects.
    pub fn factory(&self) -> BusFactory {
        let bus = self.clone();
        Arc::new(move |_resource: String, _settings: SerialSettings| {
            let bus = bus.clone();
            Box::pin(async move {
                let handle: BusHandle = into_handle(bus);
                Ok(handle)
            })
        })
    }

    /// Bus factory that refuses every open attempt, for connect-failure
    /// scenarios.
    pub fn refusing_factory(reason: &str) -> BusFactory {
        let reason = reason.to_string();
        Arc::new(move |resource: String, _settings: SerialSettings| {
            let reason = reason.clone();
            Box::pin(async move {
                Err::<BusHandle, _>(anyhow::anyhow!("cannot open '{resource}': {reason}"))
            })
        })
    }
}

#[async_trait]
impl RegisterBus for MockRegisterBus {
    async fn read_registers(&mut self, address: u16, count: u16) -> anyhow::Result<Vec<u16>> {
        let mut state = self.lock();
        state.reads += 1;
        if state.fail_reads {
            bail!("injected read failure at register {address}");
        }
        if state.failing_reads_left > 0 {
            state.failing_reads_left -= 1;
            bail!("injected transient read failure at register {address}");
        }
        Ok((address..address + count)
            .map(|reg| state.registers.get(&reg).copied().unwrap_or(0))
            .collect())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.writes += 1;
        if state.fail_writes {
            bail!("injected write failure at register {address}");
        }
        if let Some(remaining) = state.writes_before_failure {
            if remaining == 0 {
                bail!("injected write failure at register {address}");
            }
            state.writes_before_failure = Some(remaining - 1);
        }
        state.registers.insert(address, value);
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.closes += 1;
        if state.fail_close {
            bail!("injected close failure");
        }
        Ok(())
    }
}
