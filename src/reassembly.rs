//! Payload reassembly
//!
//! Orders the payload packets collected for one frame by packet id and
//! concatenates their bytes into a single pixel buffer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gvsp_receiver_lib::frame_validation::FrameGeometry;
//! use gvsp_receiver_lib::reassembly::PayloadReassembler;
//!
//! let reassembler = PayloadReassembler::new(FrameGeometry::new(1920, 1200));
//! let frame = reassembler.assemble(&packets, block_id, Some(start_timestamp))?;
//! ```

use thiserror::Error;

use crate::frame_validation::{infer_pixel_format, FrameGeometry, PixelFormat};
use crate::gvsp_header::PacketHeader;

/// Errors raised while reassembling a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// Assembled buffer matches neither the Mono8 nor the RGB8 frame size.
    #[error("frame size mismatch: {actual} bytes (expected {mono8} for mono8 or {rgb8} for rgb8)")]
    SizeMismatch {
        /// Length of the assembled buffer.
        actual: usize,
        /// Expected Mono8 length.
        mono8: usize,
        /// Expected RGB8 length.
        rgb8: usize,
    },
}

/// Result type alias for reassembly operations.
pub type Result<T> = std::result::Result<T, AssemblyError>;

/// A payload datagram buffered for the current frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Decoded header
    pub header: PacketHeader,
    /// Payload bytes following the header
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet from a header and an owned copy of its payload
    pub fn new(header: PacketHeader, payload: &[u8]) -> Self {
        Self {
            header,
            payload: payload.to_vec(),
        }
    }

    /// Packet ordering key
    pub fn packet_id(&self) -> u32 {
        self.header.packet_id
    }
}

/// A finished frame ready for a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    /// Block id the frame was delimited by
    pub block_id: u16,
    /// Contiguous pixel buffer
    pub data: Vec<u8>,
    /// Format inferred from the buffer length
    pub pixel_format: PixelFormat,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Capture timestamp from the leader (`None` if the leader was truncated)
    pub start_timestamp: Option<u64>,
    /// Wall-clock completion time, microseconds since the Unix epoch
    pub completed_at_us: u64,
    /// Number of payload packets that made up the frame
    pub packet_count: usize,
}

/// Orders and concatenates payload packets into frames
#[derive(Debug, Clone, Copy)]
pub struct PayloadReassembler {
    geometry: FrameGeometry,
}

impl PayloadReassembler {
    /// Create a reassembler for the configured sensor dimensions
    pub fn new(geometry: FrameGeometry) -> Self {
        Self { geometry }
    }

    /// Configured geometry
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Assemble one frame from its payload packets
    ///
    /// Packets are ordered by ascending packet id. The sort is stable, so
    /// packets sharing an id keep their arrival order. The packet set is only
    /// borrowed, so assembling the same set twice yields identical bytes.
    ///
    /// # Errors
    ///
    /// Returns `AssemblyError::SizeMismatch` if the concatenated length is
    /// neither the Mono8 nor the RGB8 frame size.
    pub fn assemble(
        &self,
        packets: &[Packet],
        block_id: u16,
        start_timestamp: Option<u64>,
    ) -> Result<AssembledFrame> {
        let data = concatenate_payloads(packets);

        let pixel_format = infer_pixel_format(data.len(), self.geometry).ok_or(
            AssemblyError::SizeMismatch {
                actual: data.len(),
                mono8: self.geometry.mono8_len(),
                rgb8: self.geometry.rgb8_len(),
            },
        )?;

        log::debug!(
            "Assembled block {}: {} bytes from {} packets ({})",
            block_id,
            data.len(),
            packets.len(),
            pixel_format.name()
        );

        Ok(AssembledFrame {
            block_id,
            data,
            pixel_format,
            width: self.geometry.width,
            height: self.geometry.height,
            start_timestamp,
            completed_at_us: unix_time_us(),
            packet_count: packets.len(),
        })
    }
}

/// Concatenate payloads in ascending packet id order
///
/// The buffer is sized up front so each payload is a single bulk copy.
pub fn concatenate_payloads(packets: &[Packet]) -> Vec<u8> {
    let mut ordered: Vec<&Packet> = packets.iter().collect();
    ordered.sort_by_key(|packet| packet.packet_id());

    let total: usize = ordered.iter().map(|packet| packet.payload.len()).sum();
    let mut data = Vec::with_capacity(total);
    for packet in ordered {
        data.extend_from_slice(&packet.payload);
    }
    data
}

/// Current wall-clock time in microseconds since the Unix epoch
pub(crate) fn unix_time_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
