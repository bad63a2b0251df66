//! Device enumeration and lifecycle management
//!
//! The [`DeviceManager`] owns the engine thread and is the entry point for
//! everything else: enumeration, opening devices, hotplug events, shutdown.
//! The transport moves into the engine thread at construction and is never
//! touched from anywhere else.

use async_channel::Receiver;
use tracing::warn;
use transport::{BusAddress, DeviceInfo, HostTransport};

use crate::command::{Command, EngineHandle, HostEvent, create_engine_channels};
use crate::config::HostConfig;
use crate::device::Device;
use crate::driver::{ClassDriver, DriverRegistry};
use crate::error::{Result, UsbError};
use crate::worker::spawn_engine;

/// Owns the engine thread and hands out [`Device`] handles.
#[derive(Debug)]
pub struct DeviceManager {
    engine: EngineHandle,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl DeviceManager {
    /// Spawns the engine thread around `transport`.
    pub fn new(transport: Box<dyn HostTransport>, config: HostConfig) -> Result<Self> {
        let (engine, channels) = create_engine_channels(config.clone());
        let worker = spawn_engine(transport, channels, config)
            .map_err(|e| UsbError::Channel(format!("failed to spawn engine thread: {e}")))?;
        Ok(Self {
            engine,
            worker: Some(worker),
        })
    }

    /// Devices currently attached, freshly enumerated.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.engine.request(|reply| Command::Enumerate { reply })
    }

    /// Opens the device at `address`.
    ///
    /// Fails with [`UsbError::AlreadyOpen`] while another [`Device`] for the
    /// address exists, and [`UsbError::NotFound`] when the address vanished
    /// between enumeration and open.
    pub fn open(&self, address: BusAddress) -> Result<Device> {
        let reply = self
            .engine
            .request(|reply| Command::OpenDevice { address, reply })?;
        Ok(Device::new(self.engine.clone(), reply))
    }

    /// Opens the device and layers the best-matching registered driver over
    /// it. Fails with [`UsbError::NoDriver`] when nothing matches.
    pub fn open_with(
        &self,
        registry: &DriverRegistry,
        address: BusAddress,
    ) -> Result<Box<dyn ClassDriver>> {
        let device = self.open(address)?;
        let factory = registry
            .match_for(device.info())
            .ok_or(UsbError::NoDriver)?;
        factory(device)
    }

    /// Unsolicited engine notifications: hotplug and stream faults. Each
    /// call returns the same underlying queue; events are consumed once.
    pub fn events(&self) -> Receiver<HostEvent> {
        self.engine.events.clone()
    }

    pub fn config(&self) -> &HostConfig {
        &self.engine.config
    }

    /// Stops the engine thread. Open devices are force-closed first; the
    /// call returns once the thread has exited (bounded by the teardown
    /// timeout).
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_worker()
    }

    fn stop_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.engine.send(Command::Shutdown);
        worker
            .join()
            .map_err(|_| UsbError::Channel("engine thread panicked".to_string()))
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Err(error) = self.stop_worker() {
            warn!("engine shutdown on drop failed: {error}");
        }
    }
}
