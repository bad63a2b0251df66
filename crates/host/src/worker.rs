//! The engine thread
//!
//! One dedicated OS thread owns the transport and all mutable bookkeeping:
//! open devices, in-flight transfers, stream pools, and teardown state
//! machines. The transport is not assumed reentrant, so this thread is its
//! only caller; everything else reaches it through the command channel and
//! blocks on per-transfer signals or oneshot replies.
//!
//! Each loop iteration drains pending commands, polls the transport for
//! completions with a short bounded wait, folds in hotplug events, and
//! advances teardowns. The thread never blocks on anything but that bounded
//! poll.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use transport::{
    BusAddress, Completion, CompletionStatus, ControlSetup, EndpointDescriptor, HostTransport,
    HotplugEvent, Submission, TransferHandle,
};

use crate::command::{Command, EngineChannels, HostEvent, OpenReply, StreamReply};
use crate::config::HostConfig;
use crate::device::DeviceShared;
use crate::error::{Result, UsbError};
use crate::signal::TransferSignal;
use crate::stream::{Payload, Resequencer, StreamConfig, StreamId, StreamShared};

/// Bounded wait per completion poll; commands are checked between polls.
const POLL_WAIT: Duration = Duration::from_millis(5);

/// Spawns the engine thread, handing it the transport for good.
pub(crate) fn spawn_engine(
    transport: Box<dyn HostTransport>,
    channels: EngineChannels,
    config: HostConfig,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-engine".to_string())
        .spawn(move || Engine::new(transport, channels, config).run())
}

/// Routing record for one accepted submission.
enum InFlight {
    OneShot {
        address: BusAddress,
        signal: Arc<TransferSignal>,
    },
    StreamSlot {
        stream: StreamId,
        slot: usize,
        sequence: u64,
    },
}

/// Engine-side record of one open device.
struct OpenDevice {
    shared: Arc<DeviceShared>,
    outstanding: HashSet<TransferHandle>,
    streams: HashSet<StreamId>,
}

/// What a stream slot's completion contributed, parked in the resequencer
/// until its sequence number is next in line.
enum SlotOutcome {
    Payload { data: Vec<u8>, length: usize },
    /// Transient failure, retried; nothing delivered for this sequence
    Retried,
    /// The sequence's data is gone (retries exhausted, or disconnect)
    Lost,
}

struct StreamSlot {
    /// Consecutive transient failures; reset on success or escalation
    failures: u32,
}

/// Engine-side state of one stream: the transfer pool, the resequencer, and
/// the buffer inventory. The consumer-facing delivery queue lives in
/// `shared`.
struct StreamRuntime {
    address: BusAddress,
    endpoint: EndpointDescriptor,
    config: StreamConfig,
    transfer_size: usize,
    shared: Arc<StreamShared>,
    reclaim_tx: async_channel::Sender<Vec<u8>>,
    reclaim_rx: async_channel::Receiver<Vec<u8>>,
    resequencer: Resequencer<SlotOutcome>,
    slots: Vec<StreamSlot>,
    /// Free buffers ready for resubmission
    spare: Vec<Vec<u8>>,
    next_sequence: u64,
    outstanding: usize,
    stopping: bool,
    faulted: bool,
}

impl StreamRuntime {
    /// Releases every in-order item to the delivery queue.
    fn deliver_ready(&mut self) {
        while let Some((sequence, outcome)) = self.resequencer.pop_ready() {
            match outcome {
                SlotOutcome::Payload { data, length } => {
                    let payload = Payload::new(data, length, sequence, self.reclaim_tx.clone());
                    if let Some(recycled) = self.shared.push_payload(payload) {
                        self.spare.push(recycled);
                    }
                }
                SlotOutcome::Retried => {}
                SlotOutcome::Lost => self.shared.note_lost(1),
            }
        }
    }

    /// A buffer for the next submission: consumer-released first, then the
    /// spare pool, then a fresh allocation as a last resort.
    fn next_buffer(&mut self) -> Vec<u8> {
        while let Ok(buffer) = self.reclaim_rx.try_recv() {
            self.spare.push(buffer);
        }
        let mut buffer = self
            .spare
            .pop()
            .unwrap_or_else(|| vec![0u8; self.transfer_size]);
        buffer.resize(self.transfer_size, 0);
        buffer
    }
}

/// What a teardown is waiting to quiesce.
enum TeardownTarget {
    Device(BusAddress),
    Stream(StreamId),
}

struct Teardown {
    target: TeardownTarget,
    deadline: Instant,
    reply: Option<tokio::sync::oneshot::Sender<Result<()>>>,
}

pub(crate) struct Engine {
    transport: Box<dyn HostTransport>,
    channels: EngineChannels,
    config: HostConfig,
    /// Last enumeration result, refreshed by `Enumerate` and hotplug
    known: HashMap<BusAddress, transport::DeviceInfo>,
    devices: HashMap<BusAddress, OpenDevice>,
    in_flight: HashMap<TransferHandle, InFlight>,
    streams: HashMap<StreamId, StreamRuntime>,
    teardowns: Vec<Teardown>,
    next_stream: u64,
    /// Deadline for draining in-flight transfers once shutdown begins
    shutdown: Option<Instant>,
}

impl Engine {
    pub(crate) fn new(
        transport: Box<dyn HostTransport>,
        channels: EngineChannels,
        config: HostConfig,
    ) -> Self {
        Self {
            transport,
            channels,
            config,
            known: HashMap::new(),
            devices: HashMap::new(),
            in_flight: HashMap::new(),
            streams: HashMap::new(),
            teardowns: Vec::new(),
            next_stream: 0,
            shutdown: None,
        }
    }

    pub(crate) fn run(mut self) {
        info!("usb engine started");
        loop {
            self.drain_commands();

            match self.transport.poll_completions(POLL_WAIT) {
                Ok(completions) => {
                    for completion in completions {
                        self.dispatch(completion);
                    }
                }
                Err(error) => {
                    warn!("completion poll failed: {error}");
                    std::thread::sleep(POLL_WAIT);
                }
            }

            for event in self.transport.poll_hotplug() {
                self.handle_hotplug(event);
            }

            self.advance_teardowns();

            if let Some(deadline) = self.shutdown
                && (self.in_flight.is_empty() || Instant::now() >= deadline)
            {
                break;
            }
        }

        // Deadline-forced exit: unblock anyone still waiting. Buffers still
        // inside the transport stay there; the process is going down.
        for (_, entry) in self.in_flight.drain() {
            if let InFlight::OneShot { signal, .. } = entry {
                signal.complete(Err(UsbError::Cancelled), Vec::new());
            }
        }
        for teardown in self.teardowns.drain(..) {
            if let Some(reply) = teardown.reply {
                let _ = reply.send(Err(UsbError::TeardownIncomplete));
            }
        }
        for (_, runtime) in self.streams.drain() {
            runtime.shared.set_stopped();
        }
        for (address, _) in self.devices.drain() {
            if let Err(error) = self.transport.close(address) {
                debug!(%address, "close on shutdown failed: {error}");
            }
        }
        info!("usb engine stopped");
    }

    fn drain_commands(&mut self) {
        loop {
            match self.channels.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(async_channel::TryRecvError::Empty) => break,
                Err(async_channel::TryRecvError::Closed) => {
                    // Every caller handle is gone; nothing can arrive anymore
                    self.begin_shutdown();
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enumerate { reply } => {
                let result = self.transport.enumerate().map_err(UsbError::from);
                if let Ok(devices) = &result {
                    self.known = devices.iter().map(|d| (d.address, d.clone())).collect();
                }
                let _ = reply.send(result);
            }
            Command::OpenDevice { address, reply } => {
                let _ = reply.send(self.open_device(address));
            }
            Command::CloseDevice {
                address,
                deadline,
                reply,
            } => self.begin_device_teardown(address, deadline, Some(reply), true),
            Command::ClaimInterface {
                address,
                interface,
                reply,
            } => {
                let result = self
                    .transport
                    .claim_interface(address, interface)
                    .map_err(UsbError::from);
                let _ = reply.send(result);
            }
            Command::ReleaseInterface {
                address,
                interface,
                reply,
            } => {
                let result = self
                    .transport
                    .release_interface(address, interface)
                    .map_err(UsbError::from);
                let _ = reply.send(result);
            }
            Command::Submit {
                address,
                endpoint,
                setup,
                data,
                timeout,
                signal,
            } => self.submit_one_shot(address, endpoint, setup, data, timeout, signal),
            Command::CancelTransfer { signal } => {
                // No handle means the submission already completed
                if let Some(handle) = signal.handle()
                    && let Err(error) = self.transport.cancel(handle)
                {
                    debug!(?handle, "cancel failed: {error}");
                }
            }
            Command::OpenStream {
                address,
                endpoint,
                config,
                reply,
            } => {
                let _ = reply.send(self.open_stream(address, endpoint, config));
            }
            Command::StopStream {
                stream,
                deadline,
                reply,
            } => {
                if self.streams.contains_key(&stream) {
                    self.begin_stream_stop(stream);
                    self.teardowns.push(Teardown {
                        target: TeardownTarget::Stream(stream),
                        deadline,
                        reply: Some(reply),
                    });
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            Command::Shutdown => {
                info!("engine shutdown requested");
                self.begin_shutdown();
            }
        }
    }

    fn open_device(&mut self, address: BusAddress) -> Result<OpenReply> {
        if self.devices.contains_key(&address) {
            return Err(UsbError::AlreadyOpen);
        }
        if !self.known.contains_key(&address) {
            let devices = self.transport.enumerate()?;
            self.known = devices.iter().map(|d| (d.address, d.clone())).collect();
        }
        let info = self.known.get(&address).cloned().ok_or(UsbError::NotFound)?;
        self.transport.open(address)?;
        let interfaces = match self.transport.interfaces(address) {
            Ok(interfaces) => interfaces,
            Err(error) => {
                let _ = self.transport.close(address);
                return Err(error.into());
            }
        };
        let shared = Arc::new(DeviceShared::new(address));
        self.devices.insert(
            address,
            OpenDevice {
                shared: Arc::clone(&shared),
                outstanding: HashSet::new(),
                streams: HashSet::new(),
            },
        );
        info!(%address, id = %info.id_string(), "device opened");
        Ok(OpenReply {
            info,
            interfaces,
            shared,
        })
    }

    fn submit_one_shot(
        &mut self,
        address: BusAddress,
        endpoint: EndpointDescriptor,
        setup: Option<ControlSetup>,
        data: Vec<u8>,
        timeout: Duration,
        signal: Arc<TransferSignal>,
    ) {
        let Some(device) = self.devices.get_mut(&address) else {
            signal.complete(Err(UsbError::DeviceDisconnected), data);
            return;
        };
        let submission = match setup {
            Some(setup) => Submission::control(setup, data, timeout),
            None => Submission {
                endpoint: endpoint.address,
                kind: endpoint.kind,
                setup: None,
                data,
                timeout,
            },
        };
        match self.transport.submit(address, submission) {
            Ok(handle) => {
                trace!(%address, endpoint = %endpoint.address, ?handle, "transfer submitted");
                signal.attach_handle(handle);
                device.outstanding.insert(handle);
                self.in_flight
                    .insert(handle, InFlight::OneShot { address, signal });
            }
            Err(refused) => {
                debug!(%address, endpoint = %endpoint.address, "submission refused: {}", refused.error);
                signal.complete(Err(refused.error.into()), refused.submission.data);
            }
        }
    }

    fn open_stream(
        &mut self,
        address: BusAddress,
        endpoint: EndpointDescriptor,
        config: StreamConfig,
    ) -> Result<StreamReply> {
        if !self.devices.contains_key(&address) {
            return Err(UsbError::DeviceDisconnected);
        }
        let transfer_size = if config.transfer_size > 0 {
            config.transfer_size
        } else {
            usize::from(endpoint.max_packet_size)
        };
        let id = StreamId(self.next_stream);
        self.next_stream += 1;

        let shared = Arc::new(StreamShared::new(config.queue_depth, config.overflow));
        let (reclaim_tx, reclaim_rx) =
            async_channel::bounded(config.pool_size + config.queue_depth + 1);
        let mut runtime = StreamRuntime {
            address,
            endpoint,
            config,
            transfer_size,
            shared: Arc::clone(&shared),
            reclaim_tx,
            reclaim_rx,
            resequencer: Resequencer::new(),
            slots: (0..config.pool_size).map(|_| StreamSlot { failures: 0 }).collect(),
            // Full inventory up front: pool in flight, the rest spare
            spare: (0..config.pool_size + config.queue_depth + 1)
                .map(|_| vec![0u8; transfer_size])
                .collect(),
            next_sequence: 0,
            outstanding: 0,
            stopping: false,
            faulted: false,
        };

        for slot in 0..config.pool_size {
            self.resubmit_slot(&mut runtime, id, slot);
        }
        if runtime.faulted && runtime.outstanding == 0 {
            return Err(UsbError::DeviceDisconnected);
        }

        if let Some(device) = self.devices.get_mut(&address) {
            device.streams.insert(id);
        }
        info!(
            %address, stream = %id, endpoint = %endpoint.address,
            pool = config.pool_size, "stream opened"
        );
        self.streams.insert(id, runtime);
        Ok(StreamReply { id, shared })
    }

    /// Submits the next transfer for `slot`, consuming a sequence number.
    /// A refusal faults the stream: the pool cannot stay saturated.
    fn resubmit_slot(&mut self, runtime: &mut StreamRuntime, id: StreamId, slot: usize) {
        let buffer = runtime.next_buffer();
        let sequence = runtime.next_sequence;
        runtime.next_sequence += 1;
        let submission = Submission {
            endpoint: runtime.endpoint.address,
            kind: runtime.endpoint.kind,
            setup: None,
            data: buffer,
            timeout: runtime.config.timeout,
        };
        match self.transport.submit(runtime.address, submission) {
            Ok(handle) => {
                runtime.outstanding += 1;
                self.in_flight
                    .insert(handle, InFlight::StreamSlot { stream: id, slot, sequence });
                if let Some(device) = self.devices.get_mut(&runtime.address) {
                    device.outstanding.insert(handle);
                }
            }
            Err(refused) => {
                // Nothing was submitted for this sequence; hand it back
                runtime.next_sequence -= 1;
                runtime.spare.push(refused.submission.data);
                let error = UsbError::from(refused.error);
                warn!(stream = %id, slot, "stream resubmission failed: {error}");
                self.fault_stream(runtime, id, error);
            }
        }
    }

    fn fault_stream(&self, runtime: &mut StreamRuntime, id: StreamId, error: UsbError) {
        if runtime.faulted {
            return;
        }
        runtime.faulted = true;
        runtime.shared.set_fault(error.clone());
        self.publish(HostEvent::StreamFault { stream: id, error });
    }

    fn dispatch(&mut self, completion: Completion) {
        let Some(entry) = self.in_flight.remove(&completion.handle) else {
            trace!(handle = ?completion.handle, "completion for unknown handle dropped");
            return;
        };
        match entry {
            InFlight::OneShot { address, signal } => {
                if let Some(device) = self.devices.get_mut(&address) {
                    device.outstanding.remove(&completion.handle);
                }
                let result = UsbError::from_completion(completion.status, completion.length);
                if matches!(result, Err(UsbError::DeviceDisconnected))
                    && let Some(device) = self.devices.get(&address)
                {
                    // Fail fast for everything issued after this point; full
                    // cleanup happens on the hotplug Left event
                    device.shared.mark_closed();
                }
                trace!(%address, handle = ?completion.handle, ?result, "transfer completed");
                signal.complete(result, completion.data);
            }
            InFlight::StreamSlot { stream, slot, sequence } => {
                if let Some(mut runtime) = self.streams.remove(&stream) {
                    if let Some(device) = self.devices.get_mut(&runtime.address) {
                        device.outstanding.remove(&completion.handle);
                    }
                    runtime.outstanding -= 1;
                    self.stream_completion(&mut runtime, stream, slot, sequence, completion);
                    self.streams.insert(stream, runtime);
                }
            }
        }
    }

    fn stream_completion(
        &mut self,
        runtime: &mut StreamRuntime,
        id: StreamId,
        slot: usize,
        sequence: u64,
        completion: Completion,
    ) {
        let Completion { status, data, length, .. } = completion;
        if runtime.stopping {
            runtime.spare.push(data);
            return;
        }
        match status {
            CompletionStatus::Success => {
                runtime.slots[slot].failures = 0;
                runtime
                    .resequencer
                    .insert(sequence, SlotOutcome::Payload { data, length });
                if !runtime.faulted {
                    self.resubmit_slot(runtime, id, slot);
                }
            }
            CompletionStatus::Disconnected => {
                // The remaining pool completes Disconnected on its own; the
                // sequence is marked lost so earlier successes still deliver
                runtime.spare.push(data);
                runtime.resequencer.insert(sequence, SlotOutcome::Lost);
                if !runtime.faulted {
                    warn!(stream = %id, "stream faulted: device disconnected");
                }
                self.fault_stream(runtime, id, UsbError::DeviceDisconnected);
            }
            CompletionStatus::Cancelled => {
                // Cancel raced a stop or close that has not marked the
                // stream yet; nothing to deliver for this sequence
                runtime.spare.push(data);
                runtime.resequencer.insert(sequence, SlotOutcome::Retried);
            }
            transient => {
                runtime.spare.push(data);
                runtime.slots[slot].failures += 1;
                let failures = runtime.slots[slot].failures;
                if failures <= runtime.config.max_retries {
                    debug!(
                        stream = %id, slot, ?transient, failures,
                        "transient stream error, retrying"
                    );
                    runtime.shared.note_retry();
                    runtime.resequencer.insert(sequence, SlotOutcome::Retried);
                } else {
                    warn!(stream = %id, slot, ?transient, "retries exhausted, payload lost");
                    runtime.slots[slot].failures = 0;
                    runtime.resequencer.insert(sequence, SlotOutcome::Lost);
                }
                if !runtime.faulted {
                    self.resubmit_slot(runtime, id, slot);
                }
            }
        }
        runtime.deliver_ready();
    }

    fn handle_hotplug(&mut self, event: HotplugEvent) {
        match event {
            HotplugEvent::Arrived(info) => {
                info!(address = %info.address, id = %info.id_string(), "device arrived");
                self.known.insert(info.address, info.clone());
                self.publish(HostEvent::DeviceArrived { info });
            }
            HotplugEvent::Left(address) => {
                info!(%address, "device left");
                self.known.remove(&address);
                if self.devices.contains_key(&address) {
                    // Forced close: no cancels — in-flight transfers complete
                    // Disconnected on their own and must surface that way
                    let deadline = Instant::now() + self.config.teardown_timeout();
                    self.begin_device_teardown(address, deadline, None, false);
                }
                self.publish(HostEvent::DeviceLeft { address });
            }
        }
    }

    /// Marks the device closed, stops its streams, optionally cancels its
    /// one-shots, and schedules the quiescence wait.
    fn begin_device_teardown(
        &mut self,
        address: BusAddress,
        deadline: Instant,
        reply: Option<tokio::sync::oneshot::Sender<Result<()>>>,
        cancel: bool,
    ) {
        let Some(device) = self.devices.get(&address) else {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        };
        device.shared.mark_closed();
        let stream_ids: Vec<StreamId> = device.streams.iter().copied().collect();
        let one_shots: Vec<TransferHandle> = device.outstanding.iter().copied().collect();

        for id in stream_ids {
            if cancel {
                self.begin_stream_stop(id);
                continue;
            }
            let mut newly_faulted = false;
            if let Some(runtime) = self.streams.get_mut(&id)
                && !runtime.faulted
            {
                runtime.faulted = true;
                runtime.shared.set_fault(UsbError::DeviceDisconnected);
                newly_faulted = true;
            }
            if newly_faulted {
                self.publish(HostEvent::StreamFault {
                    stream: id,
                    error: UsbError::DeviceDisconnected,
                });
            }
        }
        if cancel {
            for handle in one_shots {
                if let Err(error) = self.transport.cancel(handle) {
                    debug!(%address, ?handle, "cancel during close failed: {error}");
                }
            }
        }
        self.teardowns.push(Teardown {
            target: TeardownTarget::Device(address),
            deadline,
            reply,
        });
    }

    /// Marks a stream stopping and cancels its in-flight pool.
    fn begin_stream_stop(&mut self, id: StreamId) {
        let Some(runtime) = self.streams.get_mut(&id) else {
            return;
        };
        if runtime.stopping {
            return;
        }
        runtime.stopping = true;
        let handles: Vec<TransferHandle> = self
            .in_flight
            .iter()
            .filter_map(|(handle, entry)| match entry {
                InFlight::StreamSlot { stream, .. } if *stream == id => Some(*handle),
                _ => None,
            })
            .collect();
        debug!(stream = %id, in_flight = handles.len(), "stopping stream");
        for handle in handles {
            if let Err(error) = self.transport.cancel(handle) {
                debug!(stream = %id, ?handle, "cancel during stop failed: {error}");
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutdown.is_some() {
            return;
        }
        let deadline = Instant::now() + self.config.teardown_timeout();
        self.shutdown = Some(deadline);
        let addresses: Vec<BusAddress> = self.devices.keys().copied().collect();
        for address in addresses {
            self.begin_device_teardown(address, deadline, None, true);
        }
    }

    fn advance_teardowns(&mut self) {
        let pending = std::mem::take(&mut self.teardowns);
        for mut teardown in pending {
            if self.quiesced(&teardown.target) {
                self.finish_teardown(&teardown.target);
                if let Some(reply) = teardown.reply.take() {
                    let _ = reply.send(Ok(()));
                }
            } else if Instant::now() >= teardown.deadline {
                if let Some(reply) = teardown.reply.take() {
                    warn!("teardown deadline passed, reclaiming in the background");
                    let _ = reply.send(Err(UsbError::TeardownIncomplete));
                }
                // Keep waiting; resources are reclaimed whenever the
                // transport finally reports the stragglers
                self.teardowns.push(teardown);
            } else {
                self.teardowns.push(teardown);
            }
        }
    }

    fn quiesced(&self, target: &TeardownTarget) -> bool {
        match target {
            // Device outstanding covers one-shots and stream slots alike
            TeardownTarget::Device(address) => self
                .devices
                .get(address)
                .is_none_or(|device| device.outstanding.is_empty()),
            TeardownTarget::Stream(id) => self
                .streams
                .get(id)
                .is_none_or(|runtime| runtime.outstanding == 0),
        }
    }

    fn finish_teardown(&mut self, target: &TeardownTarget) {
        match target {
            TeardownTarget::Device(address) => {
                let Some(device) = self.devices.remove(address) else {
                    return;
                };
                for id in device.streams {
                    self.finish_stream(id);
                }
                if let Err(error) = self.transport.close(*address) {
                    debug!(%address, "transport close failed: {error}");
                }
                info!(%address, "device closed");
            }
            TeardownTarget::Stream(id) => self.finish_stream(*id),
        }
    }

    fn finish_stream(&mut self, id: StreamId) {
        let Some(mut runtime) = self.streams.remove(&id) else {
            return;
        };
        if let Some(device) = self.devices.get_mut(&runtime.address) {
            device.streams.remove(&id);
        }
        // Anything still parked in order gets delivered before the end
        runtime.deliver_ready();
        runtime.shared.set_stopped();
        debug!(stream = %id, stats = ?runtime.shared.stats(), "stream closed");
    }

    fn publish(&self, event: HostEvent) {
        // Bounded channel; never block the engine on a slow listener
        if let Err(error) = self.channels.events.try_send(event) {
            debug!("host event dropped: {error}");
        }
    }
}
