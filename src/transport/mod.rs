//! Communication contexts for register-protocol instruments.
//!
//! A [`RegisterBus`] is the opaque handle a device session owns while
//! connected: it can read and write holding registers and be closed. The
//! serial implementation lives in [`serial`]; [`mock`] provides a
//! scriptable in-memory bus for tests and hardware-free development.

pub mod mock;
pub mod serial;

use crate::config::SerialSettings;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Register-level access to one instrument.
///
/// Implementations are not reentrant; callers serialize access through the
/// owning session's handle.
#[async_trait]
pub trait RegisterBus: Send {
    /// Reads `count` consecutive holding registers starting at `address`.
    async fn read_registers(&mut self, address: u16, count: u16) -> anyhow::Result<Vec<u16>>;

    /// Writes a single holding register.
    async fn write_register(&mut self, address: u16, value: u16) -> anyhow::Result<()>;

    /// Releases the underlying communication resource.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// An open communication handle, exclusively owned by one device session.
pub type BusHandle = Arc<Mutex<Box<dyn RegisterBus + Send>>>;

/// Factory that opens a bus for a named resource.
///
/// Injected into sessions at construction so tests substitute mock buses
/// for real serial ports.
pub type BusFactory =
    Arc<dyn Fn(String, SerialSettings) -> BoxFuture<'static, anyhow::Result<BusHandle>> + Send + Sync>;

/// Wraps a concrete bus into the shared handle type.
pub fn into_handle<B: RegisterBus + Send + 'static>(bus: B) -> BusHandle {
    Arc::new(Mutex::new(Box::new(bus) as Box<dyn RegisterBus + Send>))
}
