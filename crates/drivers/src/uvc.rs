//! UVC-style camera driver
//!
//! Speaks the video-streaming interface protocol: probe/commit negotiation
//! of the 26-byte streaming-parameter block over class control requests,
//! then frame assembly from payload-header-framed isochronous transfers.
//!
//! Each stream payload starts with a header: length byte, then an info byte
//! carrying the frame id (FID), end-of-frame (EOF), and error (ERR) bits.
//! The FID bit toggles at every frame boundary; EOF marks the payload that
//! completes a frame. A payload with ERR set, a malformed header, or any
//! reported payload loss poisons the frame under assembly, which is then
//! discarded rather than delivered truncated.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use host::{
    ClassDriver, ControlRequest, Device, DeviceFilter, DriverRegistry, Recipient, Stream,
    StreamConfig, UsbError,
};
use tracing::{debug, trace};
use transport::{Direction, EndpointAddress, TransferKind};

use crate::{DriverError, Result};

/// Video interface class code
pub const CLASS_VIDEO: u8 = 0x0e;
/// Video interface subclass: streaming
pub const SUBCLASS_STREAMING: u8 = 0x02;

/// Class request: SET_CUR
pub const SET_CUR: u8 = 0x01;
/// Class request: GET_CUR
pub const GET_CUR: u8 = 0x81;

/// Streaming-interface control selector: probe (in wValue's high byte)
pub const VS_PROBE_CONTROL: u16 = 0x0100;
/// Streaming-interface control selector: commit
pub const VS_COMMIT_CONTROL: u16 = 0x0200;

/// Size of the streaming-parameter block
pub const PARAMS_LEN: usize = 26;

/// Payload header info bit: frame id
const HEADER_FID: u8 = 0x01;
/// Payload header info bit: end of frame
const HEADER_EOF: u8 = 0x02;
/// Payload header info bit: error
const HEADER_ERR: u8 = 0x40;

/// The negotiated streaming parameters exchanged during probe/commit.
///
/// Only the fields this driver negotiates are modeled; the reserved words
/// of the block encode as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingParams {
    /// Which fields the host asks the device to keep fixed
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    /// Frame interval in 100 ns units
    pub frame_interval: u32,
    /// Largest complete frame the device will produce, in bytes
    pub max_video_frame_size: u32,
    /// Largest single payload transfer, in bytes
    pub max_payload_transfer_size: u32,
}

impl StreamingParams {
    /// Encodes the block, little-endian fields at their fixed offsets.
    pub fn encode(&self) -> [u8; PARAMS_LEN] {
        let mut block = [0u8; PARAMS_LEN];
        LittleEndian::write_u16(&mut block[0..2], self.hint);
        block[2] = self.format_index;
        block[3] = self.frame_index;
        LittleEndian::write_u32(&mut block[4..8], self.frame_interval);
        LittleEndian::write_u32(&mut block[18..22], self.max_video_frame_size);
        LittleEndian::write_u32(&mut block[22..26], self.max_payload_transfer_size);
        block
    }

    /// Decodes a block as returned by GET_CUR.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PARAMS_LEN {
            return Err(DriverError::Protocol(format!(
                "streaming-parameter block too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            hint: LittleEndian::read_u16(&data[0..2]),
            format_index: data[2],
            frame_index: data[3],
            frame_interval: LittleEndian::read_u32(&data[4..8]),
            max_video_frame_size: LittleEndian::read_u32(&data[18..22]),
            max_payload_transfer_size: LittleEndian::read_u32(&data[22..26]),
        })
    }
}

/// An opened camera with its streaming interface claimed.
pub struct UvcCamera {
    device: Device,
    streaming_interface: u8,
    iso_in: EndpointAddress,
}

impl UvcCamera {
    /// Claims the video-streaming interface and locates its isochronous IN
    /// endpoint.
    pub fn open(mut device: Device) -> Result<Self> {
        let Some((interface, iso_in)) = device.interfaces().iter().find_map(|i| {
            if i.class != CLASS_VIDEO || i.subclass != SUBCLASS_STREAMING {
                return None;
            }
            let endpoint = i.endpoints.iter().find(|e| {
                e.kind == TransferKind::Isochronous && e.address.direction() == Direction::In
            })?;
            Some((i.number, endpoint.address))
        }) else {
            return Err(DriverError::Protocol(format!(
                "no video-streaming interface with an isochronous IN endpoint on {}",
                device.address()
            )));
        };
        device.claim_interface(interface)?;
        debug!(address = %device.address(), interface, "video-streaming interface claimed");
        Ok(Self {
            device,
            streaming_interface: interface,
            iso_in,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Probe/commit negotiation: proposes `wanted`, reads back what the
    /// device can do, and commits that. Returns the committed parameters.
    pub fn negotiate(&self, wanted: StreamingParams) -> Result<StreamingParams> {
        let timeout = self.device.default_timeout();
        let probe_set = self.class_request(SET_CUR, VS_PROBE_CONTROL);
        self.device.control_out(probe_set, &wanted.encode(), timeout)?;

        let probe_get = self.class_request(GET_CUR, VS_PROBE_CONTROL);
        let block = self.device.control_in(probe_get, PARAMS_LEN, timeout)?;
        let negotiated = StreamingParams::decode(&block)?;

        let commit = self.class_request(SET_CUR, VS_COMMIT_CONTROL);
        self.device.control_out(commit, &negotiated.encode(), timeout)?;
        debug!(?negotiated, "streaming parameters committed");
        Ok(negotiated)
    }

    /// Opens the isochronous stream and wraps it in a frame assembler.
    /// Call after [`negotiate`](UvcCamera::negotiate).
    pub fn frames(&self, config: StreamConfig) -> Result<FrameReader> {
        let stream = self.device.open_stream(self.iso_in, config)?;
        Ok(FrameReader::new(stream))
    }

    fn class_request(&self, request: u8, selector: u16) -> ControlRequest {
        let index = u16::from(self.streaming_interface);
        if request & 0x80 != 0 {
            ControlRequest::class_in(Recipient::Interface, request, selector, index)
        } else {
            ControlRequest::class_out(Recipient::Interface, request, selector, index)
        }
    }
}

impl ClassDriver for UvcCamera {
    fn name(&self) -> &str {
        "uvc"
    }
}

/// Registers the camera driver for all video-class devices.
pub fn register(registry: &mut DriverRegistry) {
    registry.register(DeviceFilter::class(CLASS_VIDEO), |device| {
        let camera = UvcCamera::open(device).map_err(UsbError::from)?;
        Ok(Box::new(camera) as Box<dyn ClassDriver>)
    });
}

/// Assembles complete frames from payload-header-framed stream payloads.
pub struct FrameReader {
    stream: Stream,
    assembly: Vec<u8>,
    current_fid: Option<bool>,
    discard: bool,
}

impl FrameReader {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            assembly: Vec::new(),
            current_fid: None,
            discard: false,
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Blocks for the next complete frame.
    ///
    /// Corrupt frames (ERR bit, malformed header, lost payloads) are
    /// dropped silently; only whole frames come back.
    pub fn next_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(UsbError::Timeout.into());
            }
            let payload = self.stream.next_payload(deadline - now)?;
            if payload.lost_before() > 0 {
                trace!(lost = payload.lost_before(), "payload loss, poisoning frame");
                self.discard = true;
            }
            let bytes = payload.bytes();
            if bytes.is_empty() {
                // Empty iso microframe, no header to read
                continue;
            }
            let header_len = usize::from(bytes[0]);
            if header_len < 2 || header_len > bytes.len() {
                self.discard = true;
                continue;
            }
            let info = bytes[1];
            let fid = info & HEADER_FID != 0;
            if self.current_fid != Some(fid) {
                // FID toggled: whatever was under assembly is over
                self.assembly.clear();
                self.discard = false;
                self.current_fid = Some(fid);
            }
            if info & HEADER_ERR != 0 {
                self.discard = true;
            }
            if !self.discard {
                self.assembly.extend_from_slice(&bytes[header_len..]);
            }
            if info & HEADER_EOF != 0 {
                let complete = !self.discard && !self.assembly.is_empty();
                if complete {
                    return Ok(std::mem::take(&mut self.assembly));
                }
                self.assembly.clear();
            }
        }
    }

    /// Stops the underlying stream.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        Ok(self.stream.stop(timeout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_encode_decode_round_trip() {
        let params = StreamingParams {
            hint: 0x0001,
            format_index: 1,
            frame_index: 3,
            frame_interval: 333_333,
            max_video_frame_size: 614_400,
            max_payload_transfer_size: 3072,
        };
        let block = params.encode();
        assert_eq!(block.len(), PARAMS_LEN);
        assert_eq!(LittleEndian::read_u16(&block[0..2]), 0x0001);
        assert_eq!(StreamingParams::decode(&block).unwrap(), params);
    }

    #[test]
    fn short_params_block_is_rejected() {
        assert!(matches!(
            StreamingParams::decode(&[0u8; 25]),
            Err(DriverError::Protocol(_))
        ));
    }
}
