//! Channel bridge between callers and the engine thread
//!
//! Callers talk to the engine thread through a bounded command channel;
//! per-command replies travel back over oneshot channels, and unsolicited
//! notifications (hotplug, stream faults) over a bounded event channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender, bounded};
use transport::{BusAddress, ControlSetup, DeviceInfo, EndpointDescriptor, InterfaceDescriptor};

use crate::config::HostConfig;
use crate::error::{Result, UsbError};
use crate::signal::TransferSignal;
use crate::stream::{StreamConfig, StreamId, StreamShared};

/// Capacity of the command and event channels
const CHANNEL_DEPTH: usize = 256;

/// What the engine hands back for a successful device open.
#[derive(Debug)]
pub(crate) struct OpenReply {
    pub info: DeviceInfo,
    pub interfaces: Vec<InterfaceDescriptor>,
    pub shared: Arc<crate::device::DeviceShared>,
}

/// What the engine hands back for a successful stream open.
#[derive(Debug)]
pub(crate) struct StreamReply {
    pub id: StreamId,
    pub shared: Arc<StreamShared>,
}

/// Commands from caller threads to the engine thread
#[derive(Debug)]
pub(crate) enum Command {
    /// List devices currently on the bus
    Enumerate {
        reply: tokio::sync::oneshot::Sender<Result<Vec<DeviceInfo>>>,
    },

    /// Open a device for I/O
    OpenDevice {
        address: BusAddress,
        reply: tokio::sync::oneshot::Sender<Result<OpenReply>>,
    },

    /// Close a device, quiescing its transfers and streams first
    CloseDevice {
        address: BusAddress,
        deadline: Instant,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    },

    /// Claim an interface for exclusive use
    ClaimInterface {
        address: BusAddress,
        interface: u8,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    },

    /// Release a claimed interface
    ReleaseInterface {
        address: BusAddress,
        interface: u8,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    },

    /// Submit a one-shot transfer; the outcome arrives through `signal`
    Submit {
        address: BusAddress,
        endpoint: EndpointDescriptor,
        setup: Option<ControlSetup>,
        data: Vec<u8>,
        timeout: Duration,
        signal: Arc<TransferSignal>,
    },

    /// Request cancellation of an in-flight submission
    CancelTransfer { signal: Arc<TransferSignal> },

    /// Open a streaming pipeline on an IN endpoint
    OpenStream {
        address: BusAddress,
        endpoint: EndpointDescriptor,
        config: StreamConfig,
        reply: tokio::sync::oneshot::Sender<Result<StreamReply>>,
    },

    /// Stop a stream, quiescing its transfer pool
    StopStream {
        stream: StreamId,
        deadline: Instant,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    },

    /// Shutdown the engine thread gracefully
    Shutdown,
}

/// Unsolicited notifications from the engine thread
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A device appeared on the bus
    DeviceArrived {
        /// Full device information
        info: DeviceInfo,
    },

    /// A device departed; any open handle to it is now dead
    DeviceLeft {
        /// Address the device occupied
        address: BusAddress,
    },

    /// A stream hit a fatal error and faulted
    StreamFault {
        /// The faulted stream
        stream: StreamId,
        /// The fault carried to consumers
        error: UsbError,
    },
}

/// Caller half of the engine channels.
#[derive(Debug, Clone)]
pub(crate) struct EngineHandle {
    pub commands: Sender<Command>,
    pub events: Receiver<HostEvent>,
    pub config: HostConfig,
}

impl EngineHandle {
    /// Sends a command and blocks for its oneshot reply.
    pub(crate) fn request<T>(
        &self,
        build: impl FnOnce(tokio::sync::oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.commands
            .send_blocking(build(tx))
            .map_err(|_| UsbError::Channel("engine stopped".to_string()))?;
        rx.blocking_recv()
            .map_err(|_| UsbError::Channel("engine stopped".to_string()))?
    }

    /// Sends a command without waiting for any reply.
    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send_blocking(command)
            .map_err(|_| UsbError::Channel("engine stopped".to_string()))
    }
}

/// Engine half of the channels.
pub(crate) struct EngineChannels {
    pub commands: Receiver<Command>,
    pub events: Sender<HostEvent>,
}

/// Create the channel pair between callers and the engine thread
pub(crate) fn create_engine_channels(config: HostConfig) -> (EngineHandle, EngineChannels) {
    let (cmd_tx, cmd_rx) = bounded(CHANNEL_DEPTH);
    let (event_tx, event_rx) = bounded(CHANNEL_DEPTH);

    (
        EngineHandle {
            commands: cmd_tx,
            events: event_rx,
            config,
        },
        EngineChannels {
            commands: cmd_rx,
            events: event_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_through_worker_thread() {
        let (handle, channels) = create_engine_channels(HostConfig::default());

        let worker = std::thread::spawn(move || {
            let Ok(Command::Enumerate { reply }) = channels.commands.recv_blocking() else {
                panic!("expected Enumerate");
            };
            let _ = reply.send(Ok(Vec::new()));
        });

        let devices = handle.request(|reply| Command::Enumerate { reply }).unwrap();
        assert!(devices.is_empty());
        worker.join().unwrap();
    }

    #[test]
    fn request_fails_cleanly_when_engine_gone() {
        let (handle, channels) = create_engine_channels(HostConfig::default());
        drop(channels);
        let err = handle
            .request(|reply| Command::Enumerate { reply })
            .unwrap_err();
        assert!(matches!(err, UsbError::Channel(_)));
    }
}
